use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{DatasetCollection, Error, ScopeSet};
use names::{to_snake_case, RELATION_INDICATOR};

/// The raw JSON of a single property inside a table's JSON Schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ScopeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_auth: Option<ScopeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<IndexMap<String, FieldSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

/// The declared type of a field: a JSON type, the autoincrement marker,
/// or a `$ref` URI (geometry schemas and the row-schema pointer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Autoincrement,
    Number,
    Boolean,
    Object,
    Array,
    Ref(String),
}

impl FieldType {
    pub fn parse(type_: Option<&str>, reference: Option<&str>) -> Result<FieldType, Error> {
        match (type_, reference) {
            (Some("string"), _) => Ok(FieldType::String),
            (Some("integer"), _) => Ok(FieldType::Integer),
            (Some("integer/autoincrement"), _) => Ok(FieldType::Autoincrement),
            (Some("number"), _) => Ok(FieldType::Number),
            (Some("boolean"), _) => Ok(FieldType::Boolean),
            (Some("object"), _) => Ok(FieldType::Object),
            (Some("array"), _) => Ok(FieldType::Array),
            (Some(other), _) => Err(Error::InvalidSchema(format!(
                "unsupported field type '{other}'"
            ))),
            (None, Some(uri)) => Ok(FieldType::Ref(uri.to_string())),
            (None, None) => Err(Error::InvalidSchema(
                "field without 'type' or '$ref'".to_string(),
            )),
        }
    }
}

/// A reference to another table, parsed from the `"dataset:table"` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub dataset_id: String,
    pub table_id: String,
}

impl Relation {
    pub fn parse(value: &str) -> Result<Relation, Error> {
        let mut parts = value.splitn(3, ':');
        match (parts.next(), parts.next()) {
            (Some(dataset), Some(table)) if !dataset.is_empty() && !table.is_empty() => {
                Ok(Relation {
                    dataset_id: dataset.to_string(),
                    table_id: table.to_string(),
                })
            }
            _ => Err(Error::InvalidSchema(format!(
                "relation '{value}' is not of the form 'dataset:table'"
            ))),
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.dataset_id, self.table_id)
    }
}

/// A single field (column) of a table, fully resolved.
///
/// `id` is the logical handle within the table; `name()` is the physical
/// handle, which differs when a `shortname` is declared. Subfields of
/// object-shaped fields are expanded at construction time, carrying
/// composite ids like `ligtInBouwblok_identificatie`.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub id: String,
    shortname: Option<String>,
    pub dataset_id: String,
    pub table_id: String,
    type_: FieldType,
    pub format: Option<String>,
    relation: Option<Relation>,
    nm_relation: Option<Relation>,
    pub required: bool,
    pub auth: ScopeSet,
    pub filter_auth: ScopeSet,
    pub provenance: Option<String>,
    pub description: Option<String>,
    subfields: Vec<FieldSchema>,
    item_type: Option<FieldType>,
    /// Set on begin/end-of-validity fields added for temporal relations.
    pub is_temporal: bool,
    parent_field_id: Option<String>,
}

impl FieldSchema {
    pub fn from_spec(
        id: &str,
        spec: &FieldSpec,
        required: bool,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<FieldSchema, Error> {
        let type_ = FieldType::parse(spec.type_.as_deref(), spec.reference.as_deref())?;

        // `relation` on an array field is an n-m relation; on any other
        // field it is a 1-n relation.
        let (relation, nm_relation) = match (&spec.relation, &type_) {
            (Some(value), FieldType::Array) => (None, Some(Relation::parse(value)?)),
            (Some(value), _) => (Some(Relation::parse(value)?), None),
            (None, _) => (None, None),
        };

        let item_type = match (&type_, &spec.items) {
            (FieldType::Array, Some(items)) => Some(FieldType::parse(
                items.type_.as_deref(),
                items.reference.as_deref(),
            )?),
            _ => None,
        };

        let mut field = FieldSchema {
            id: id.to_string(),
            shortname: spec.shortname.clone(),
            dataset_id: dataset_id.to_string(),
            table_id: table_id.to_string(),
            type_,
            format: spec.format.clone(),
            relation,
            nm_relation,
            required,
            auth: spec.auth.clone().unwrap_or_default(),
            filter_auth: spec.filter_auth.clone().unwrap_or_default(),
            provenance: spec.provenance.clone(),
            description: spec.description.clone(),
            subfields: Vec::new(),
            item_type,
            is_temporal: false,
            parent_field_id: None,
        };
        field.expand_subfields(spec)?;
        Ok(field)
    }

    /// A field that exists in the physical model without being declared in
    /// the document, such as the generated `id` of a composite-key table.
    pub fn synthetic(
        id: &str,
        type_: FieldType,
        dataset_id: &str,
        table_id: &str,
        relation: Option<Relation>,
    ) -> FieldSchema {
        FieldSchema {
            id: id.to_string(),
            shortname: None,
            dataset_id: dataset_id.to_string(),
            table_id: table_id.to_string(),
            type_,
            format: None,
            relation,
            nm_relation: None,
            required: true,
            auth: ScopeSet::default(),
            filter_auth: ScopeSet::default(),
            provenance: None,
            description: None,
            subfields: Vec::new(),
            item_type: None,
            is_temporal: false,
            parent_field_id: None,
        }
    }

    fn expand_subfields(&mut self, spec: &FieldSpec) -> Result<(), Error> {
        let (properties, required, prefixed) = if self.is_object() {
            if self.format.as_deref() == Some("json") {
                // Stored as one JSON column; no expansion.
                return Ok(());
            }
            (spec.properties.as_ref(), spec.required.clone(), true)
        } else if let (true, Some(items)) = (self.is_array_of_objects(), spec.items.as_ref()) {
            // Subfields of an n-m relation become prefixed columns of the
            // through table; subfields of a nested table keep their own ids.
            (
                items.properties.as_ref(),
                items.required.clone(),
                self.nm_relation.is_some(),
            )
        } else {
            return Ok(());
        };

        let Some(properties) = properties else {
            return Ok(());
        };
        let required: Vec<String> = required.unwrap_or_default();

        for (sub_id, sub_spec) in properties {
            let full_id = if prefixed {
                format!("{}{}{}", self.name(), RELATION_INDICATOR, sub_id)
            } else {
                sub_id.clone()
            };
            let mut subfield = FieldSchema::from_spec(
                &full_id,
                sub_spec,
                required.iter().any(|r| r == sub_id),
                &self.dataset_id,
                &self.table_id,
            )?;
            subfield.parent_field_id = Some(self.id.clone());
            // The auth scope on the owning field is leading for all of
            // its components.
            if !self.auth.is_public() {
                subfield.auth = self.auth.clone();
            }
            self.subfields.push(subfield);
        }
        Ok(())
    }

    pub(crate) fn push_subfield(&mut self, subfield: FieldSchema) {
        self.subfields.push(subfield);
    }

    pub(crate) fn relocate(&mut self, table_id: &str) {
        self.table_id = table_id.to_string();
        for subfield in &mut self.subfields {
            subfield.relocate(table_id);
        }
    }

    pub(crate) fn set_shortname(&mut self, shortname: Option<String>) {
        self.shortname = shortname;
    }

    /// The physical handle: the `shortname` when declared, the id otherwise.
    pub fn name(&self) -> &str {
        self.shortname.as_deref().unwrap_or(&self.id)
    }

    pub fn has_shortname(&self) -> bool {
        self.shortname.is_some()
    }

    /// The column this field maps to. Relation fields carry an `_id`
    /// postfix; array fields have no column of their own.
    pub fn db_name(&self) -> String {
        let snaked = to_snake_case(self.name());
        if self.relation.is_some() {
            format!("{snaked}_id")
        } else {
            snaked
        }
    }

    /// `dataset.table.field`, for error messages.
    pub fn qualified_id(&self) -> String {
        format!("{}.{}.{}", self.dataset_id, self.table_id, self.id)
    }

    pub fn field_type(&self) -> &FieldType {
        &self.type_
    }

    /// The declared type of the array items, for scalar arrays.
    pub fn item_type(&self) -> Option<&FieldType> {
        self.item_type.as_ref()
    }

    pub fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    pub fn nm_relation(&self) -> Option<&Relation> {
        self.nm_relation.as_ref()
    }

    /// The relation this field participates in, regardless of cardinality.
    pub fn any_relation(&self) -> Option<&Relation> {
        self.relation.as_ref().or(self.nm_relation.as_ref())
    }

    pub fn subfields(&self) -> &[FieldSchema] {
        &self.subfields
    }

    pub fn parent_field_id(&self) -> Option<&str> {
        self.parent_field_id.as_deref()
    }

    pub fn is_object(&self) -> bool {
        self.type_ == FieldType::Object
    }

    pub fn is_array(&self) -> bool {
        self.type_ == FieldType::Array
    }

    pub fn is_array_of_objects(&self) -> bool {
        self.is_array() && self.item_type == Some(FieldType::Object)
    }

    pub fn is_array_of_scalars(&self) -> bool {
        self.is_array() && !self.is_array_of_objects()
    }

    pub fn is_geo(&self) -> bool {
        matches!(&self.type_, FieldType::Ref(uri) if uri.contains("geojson.org"))
    }

    /// The geometry type from a geojson.org `$ref`, e.g. `Point`.
    pub fn geometry_type(&self) -> Option<&str> {
        match &self.type_ {
            FieldType::Ref(uri) if uri.contains("geojson.org") => uri
                .rsplit('/')
                .next()
                .and_then(|name| name.strip_suffix(".json")),
            _ => None,
        }
    }

    /// The self-describing row schema pointer, skipped in physical models.
    pub fn is_schema_ref(&self) -> bool {
        matches!(&self.type_, FieldType::Ref(uri) if uri.ends_with("#/definitions/schema") || uri.ends_with("/definitions/schema"))
    }

    /// An array-of-objects field without a relation spawns a nested table.
    pub fn is_nested_table(&self) -> bool {
        self.is_array_of_objects() && self.nm_relation.is_none()
    }

    /// An array field with a relation, or a compound (object) foreign key,
    /// spawns a through table.
    pub fn is_through_table(&self) -> bool {
        (self.is_array() && self.nm_relation.is_some())
            || (self.relation.is_some() && self.is_object())
    }

    /// Subfields extended with the begin/end-of-validity fields of the
    /// relation target, when the owning dataset asks for dimension fields
    /// and the target table is temporal.
    pub fn subfields_with_dimensions(
        &self,
        use_dimension_fields: bool,
        collection: &dyn DatasetCollection,
    ) -> Vec<FieldSchema> {
        let mut subfields = self.subfields.clone();
        if !use_dimension_fields {
            return subfields;
        }
        let Some(relation) = self.any_relation() else {
            return subfields;
        };
        let Ok(dataset) = collection.get_dataset(&relation.dataset_id) else {
            return subfields;
        };
        let Ok(target) = dataset.get_table_by_id(&relation.table_id) else {
            return subfields;
        };
        if !target.is_temporal() {
            return subfields;
        }
        let Some(temporal) = dataset.temporal.as_ref() else {
            return subfields;
        };

        // 1-n relation dimension fields are prefixed like the other
        // subfields; n-m relation dimension fields keep their bare names.
        let prefix = if self.nm_relation.is_some() {
            String::new()
        } else {
            format!("{}{}", self.name(), RELATION_INDICATOR)
        };
        for dimension in temporal.dimensions.values() {
            for field_name in dimension.fields() {
                let mut field = FieldSchema::synthetic(
                    &format!("{prefix}{field_name}"),
                    FieldType::String,
                    &self.dataset_id,
                    &self.table_id,
                    None,
                );
                field.format = Some("date-time".to_string());
                field.required = false;
                field.is_temporal = true;
                field.parent_field_id = Some(self.id.clone());
                subfields.push(field);
            }
        }
        subfields
    }
}
