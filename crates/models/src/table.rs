use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Error, FieldSchema, FieldSpec, FieldType, ScopeSet, Temporal};
use names::{shorten_name, to_snake_case};

/// The raw JSON of a table definition inside a dataset document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ScopeSet>,
    pub schema: TableSchemaSpec,
}

/// The embedded JSON Schema of a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchemaSpec {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_geometry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_temporal: Option<bool>,
    #[serde(rename = "parentTableID", default, skip_serializing_if = "Option::is_none")]
    pub parent_table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through_fields: Option<[String; 2]>,
    /// Marks a table that is backed by a view instead of a physical table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_view: Option<bool>,
    /// For views: the tables whose scopes the view needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Vec<String>>,
    /// For views: the defining SELECT statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_sql: Option<String>,
    pub properties: IndexMap<String, FieldSpec>,
}

/// The logical key of a table: one field id or an ordered list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Single(String),
    Composite(Vec<String>),
}

impl Identifier {
    pub fn field_ids(&self) -> Vec<String> {
        match self {
            Identifier::Single(id) => vec![id.clone()],
            Identifier::Composite(ids) => ids.clone(),
        }
    }
}

/// Dataset-level facts that every table needs for physical naming and
/// geometry handling. Copied into each table so tables stay self-contained
/// value objects without back-references.
#[derive(Debug, Clone, Default)]
pub struct DatasetContext {
    pub dataset_id: String,
    pub version: Option<semver::Version>,
    pub default_version: Option<semver::Version>,
    pub crs: Option<String>,
    pub auth: ScopeSet,
    pub temporal: Option<Temporal>,
    pub use_dimension_fields: bool,
}

impl DatasetContext {
    /// The SRID from the dataset CRS, e.g. `EPSG:28992` gives 28992.
    pub fn srid(&self) -> Option<i32> {
        self.crs
            .as_deref()
            .and_then(|crs| crs.rsplit(':').next())
            .and_then(|code| code.parse().ok())
    }

    /// A dataset whose version differs from the default version in major
    /// number gets its own suffixed naming.
    pub fn is_default_version(&self) -> bool {
        match (&self.version, &self.default_version) {
            (Some(version), Some(default)) => version.major == default.major,
            _ => true,
        }
    }
}

/// One table of a dataset: a declared table, or a derived nested/through
/// table. Immutable after construction.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub id: String,
    shortname: Option<String>,
    pub description: Option<String>,
    pub auth: ScopeSet,
    pub version: Option<semver::Version>,
    identifier: Vec<String>,
    main_geometry: Option<String>,
    is_temporal_flag: Option<bool>,
    pub display: Option<String>,
    parent_table_id: Option<String>,
    through_fields: Option<[String; 2]>,
    is_view: bool,
    derived_from: Vec<String>,
    view_sql: Option<String>,
    nested_table: bool,
    through_table: bool,
    fields: Vec<FieldSchema>,
    context: DatasetContext,
}

impl TableSchema {
    pub fn from_spec(spec: &TableSpec, context: &DatasetContext) -> Result<TableSchema, Error> {
        Self::from_spec_derived(spec, context, false, false)
    }

    pub(crate) fn from_spec_derived(
        spec: &TableSpec,
        context: &DatasetContext,
        nested_table: bool,
        through_table: bool,
    ) -> Result<TableSchema, Error> {
        if spec.type_ != "table" {
            return Err(Error::InvalidSchema(format!(
                "'{}' is not a table definition",
                spec.id
            )));
        }
        if !nested_table && !through_table {
            let uri = spec.schema.schema_uri.as_deref().unwrap_or("");
            if !uri.starts_with("http://json-schema.org/") {
                return Err(Error::InvalidSchema(format!(
                    "table '{}' has no JSON-schema contents",
                    spec.id
                )));
            }
        }

        let identifier = spec
            .schema
            .identifier
            .as_ref()
            .map(Identifier::field_ids)
            .unwrap_or_else(|| vec!["id".to_string()]);

        let mut fields = Vec::with_capacity(spec.schema.properties.len() + 1);
        for (id, field_spec) in &spec.schema.properties {
            fields.push(FieldSchema::from_spec(
                id,
                field_spec,
                spec.schema.required.iter().any(|r| r == id),
                &context.dataset_id,
                &spec.id,
            )?);
        }

        // A composite key gets a generated scalar `id` holding the joined
        // identifier values.
        if identifier.len() > 1 && !fields.iter().any(|f| f.id == "id") {
            fields.push(FieldSchema::synthetic(
                "id",
                FieldType::String,
                &context.dataset_id,
                &spec.id,
                None,
            ));
        }

        let version = spec
            .version
            .as_deref()
            .map(|v| {
                semver::Version::parse(v).map_err(|err| {
                    Error::InvalidSchema(format!("table '{}' version '{v}': {err}", spec.id))
                })
            })
            .transpose()?;

        Ok(TableSchema {
            id: spec.id.clone(),
            shortname: spec.shortname.clone(),
            description: spec.description.clone(),
            auth: spec.auth.clone().unwrap_or_default(),
            version,
            identifier,
            main_geometry: spec.schema.main_geometry.clone(),
            is_temporal_flag: spec.schema.is_temporal,
            display: spec.schema.display.clone(),
            parent_table_id: spec.schema.parent_table_id.clone(),
            through_fields: spec.schema.through_fields.clone(),
            is_view: spec.schema.is_view.unwrap_or(false),
            derived_from: spec.schema.derived_from.clone().unwrap_or_default(),
            view_sql: spec.schema.view_sql.clone(),
            nested_table,
            through_table,
            fields,
            context: context.clone(),
        })
    }

    /// Constructor for tables synthesized by the derivation engine.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_derived(
        id: String,
        shortname: Option<String>,
        context: &DatasetContext,
        parent_table_id: Option<String>,
        through_fields: Option<[String; 2]>,
        nested_table: bool,
        through_table: bool,
        identifier: Vec<String>,
        fields: Vec<FieldSchema>,
    ) -> TableSchema {
        TableSchema {
            id,
            shortname,
            description: None,
            auth: ScopeSet::default(),
            version: None,
            identifier,
            main_geometry: None,
            is_temporal_flag: Some(false),
            display: None,
            parent_table_id,
            through_fields,
            is_view: false,
            derived_from: Vec::new(),
            view_sql: None,
            nested_table,
            through_table,
            fields,
            context: context.clone(),
        }
    }

    /// The physical handle: the `shortname` when declared, the id otherwise.
    pub fn name(&self) -> &str {
        self.shortname.as_deref().unwrap_or(&self.id)
    }

    pub fn has_shortname(&self) -> bool {
        self.shortname.is_some()
    }

    pub fn dataset_id(&self) -> &str {
        &self.context.dataset_id
    }

    pub fn dataset(&self) -> &DatasetContext {
        &self.context
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    /// Find a declared field. Ids are compared as-is and snake-cased, so
    /// both `ligtInBouwblok` and `ligt_in_bouwblok` resolve.
    pub fn get_field_by_id(&self, field_id: &str) -> Result<&FieldSchema, Error> {
        let snaked = to_snake_case(field_id);
        self.fields
            .iter()
            .find(|f| f.id == field_id || to_snake_case(&f.id) == snaked)
            .ok_or_else(|| Error::field_not_found(&self.context.dataset_id, &self.id, field_id))
    }

    pub fn identifier(&self) -> &[String] {
        &self.identifier
    }

    pub fn has_composite_key(&self) -> bool {
        self.identifier.len() > 1
    }

    /// The fields named by `identifier`, applying the `fooId` sugar for
    /// relation fields.
    pub fn identifier_fields(&self) -> Result<Vec<&FieldSchema>, Error> {
        self.identifier
            .iter()
            .map(|entry| {
                self.fields
                    .iter()
                    .find(|f| {
                        f.id == *entry
                            || format!("{}Id", f.id) == *entry
                            || (f.relation().is_some() && format!("{entry}Id") == f.id)
                    })
                    .ok_or_else(|| {
                        Error::field_not_found(&self.context.dataset_id, &self.id, entry)
                    })
            })
            .collect()
    }

    pub fn main_geometry_field(&self) -> Option<&FieldSchema> {
        let name = self.main_geometry.as_deref().unwrap_or("geometry");
        self.fields.iter().find(|f| f.id == name)
    }

    pub fn temporal(&self) -> Option<&Temporal> {
        self.context.temporal.as_ref()
    }

    pub fn is_temporal(&self) -> bool {
        self.is_temporal_flag
            .unwrap_or(self.context.temporal.is_some())
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    /// For views: the `dataset:table` references whose scopes apply.
    pub fn derived_from(&self) -> &[String] {
        &self.derived_from
    }

    pub fn view_sql(&self) -> Option<&str> {
        self.view_sql.as_deref()
    }

    pub fn is_nested_table(&self) -> bool {
        self.nested_table
    }

    pub fn is_through_table(&self) -> bool {
        self.through_table
    }

    pub fn has_parent_table(&self) -> bool {
        self.parent_table_id.is_some()
    }

    pub fn parent_table_id(&self) -> Option<&str> {
        self.parent_table_id.as_deref()
    }

    /// For derived tables, the `[source, destination]` field pair of the
    /// relation that spawned them.
    pub fn through_fields(&self) -> Option<&[String; 2]> {
        self.through_fields.as_ref()
    }

    /// Fields that hold a 1-n relation to another table.
    pub fn fk_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.relation().is_some())
    }

    /// Fields that spawn a nested sub-table.
    pub fn nested_table_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_nested_table())
    }

    /// The autoincrement id of derived nested tables; such tables have no
    /// identifier of their own.
    pub fn is_autoincrement(&self) -> bool {
        self.identifier.len() == 1
            && self
                .get_field_by_id(&self.identifier[0])
                .map(|f| *f.field_type() == FieldType::Autoincrement)
                .unwrap_or(false)
    }

    /// The physical table name: `<dataset>_<table>` in the shared `public`
    /// schema, with the major version infixed for non-default dataset
    /// versions. The result is snake-cased and bounded.
    pub fn db_name(&self) -> String {
        self.db_name_variant(true, false, "")
    }

    /// Variant naming: without the dataset prefix (for tables living in
    /// their own database schema), with a `_v<major>` version suffix, or
    /// with a trailing postfix (`_new`, `_full_load`) that survives
    /// shortening.
    pub fn db_name_variant(
        &self,
        with_dataset_prefix: bool,
        with_version: bool,
        postfix: &str,
    ) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if with_dataset_prefix {
            parts.push(self.context.dataset_id.clone());
            if let (Some(version), false) = (&self.context.version, self.context.is_default_version())
            {
                parts.push(version.major.to_string());
            }
        }
        parts.push(self.name().to_string());
        let mut name = to_snake_case(&parts.join("_"));
        if with_version {
            if let Some(version) = &self.context.version {
                name = format!("{name}_v{}", version.major);
            }
        }
        name.push_str(postfix);
        shorten_name(&name, postfix)
    }
}
