use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{DatasetContext, Error, ScopeSet, TableSchema, TableSpec, Temporal};
use names::{to_camel_case, to_snake_case};

/// Publication status of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    #[serde(rename = "beschikbaar")]
    Available,
    #[serde(rename = "nietBeschikbaar")]
    Unavailable,
}

/// The raw JSON of a dataset document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub default_version: Option<String>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub auth: Option<ScopeSet>,
    #[serde(default)]
    pub temporal: Option<Temporal>,
    #[serde(default)]
    pub use_dimension_fields: bool,
    pub tables: Vec<TableEntry>,
}

/// A dataset's table list entry: the table inline, or a `$ref` to a
/// versioned table document that the loader resolves.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TableEntry {
    Inline(TableSpec),
    Ref(TableRef),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRef {
    pub id: String,
    #[serde(rename = "$ref")]
    pub reference: String,
}

/// A dataset: the unit of authorization and coordinate-system choice,
/// holding an ordered list of tables. Immutable after construction and
/// shared by reference through a [`DatasetCollection`].
#[derive(Debug, Clone)]
pub struct DatasetSchema {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Status,
    pub auth: ScopeSet,
    pub temporal: Option<Temporal>,
    context: DatasetContext,
    tables: Vec<TableSchema>,
}

impl DatasetSchema {
    /// Parse a dataset document with all tables inline. Documents using
    /// `$ref` table entries must be resolved by a loader first.
    pub fn from_value(value: serde_json::Value) -> Result<DatasetSchema, Error> {
        let spec: DatasetSpec = serde_json::from_value(value)?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: DatasetSpec) -> Result<DatasetSchema, Error> {
        if spec.type_ != "dataset" {
            return Err(Error::InvalidSchema(
                "document is not an Amsterdam schema dataset".to_string(),
            ));
        }

        let parse_version = |value: &Option<String>, what: &str| -> Result<_, Error> {
            value
                .as_deref()
                .map(|v| {
                    semver::Version::parse(v).map_err(|err| {
                        Error::InvalidSchema(format!(
                            "dataset '{}' {what} '{v}': {err}",
                            spec.id
                        ))
                    })
                })
                .transpose()
        };
        let version = parse_version(&spec.version, "version")?;
        let default_version = match &spec.default_version {
            Some(_) => parse_version(&spec.default_version, "defaultVersion")?,
            None => version.clone(),
        };

        let context = DatasetContext {
            dataset_id: spec.id.clone(),
            version,
            default_version,
            crs: spec.crs.clone(),
            auth: spec.auth.clone().unwrap_or_default(),
            temporal: spec.temporal.clone(),
            use_dimension_fields: spec.use_dimension_fields,
        };

        let mut tables = Vec::with_capacity(spec.tables.len());
        for entry in &spec.tables {
            match entry {
                TableEntry::Inline(table_spec) => {
                    tables.push(TableSchema::from_spec(table_spec, &context)?)
                }
                TableEntry::Ref(table_ref) => {
                    return Err(Error::InvalidSchema(format!(
                        "table '{}' of dataset '{}' is an unresolved '$ref' ({})",
                        table_ref.id, spec.id, table_ref.reference
                    )))
                }
            }
        }

        Ok(DatasetSchema {
            id: spec.id,
            title: spec.title,
            description: spec.description,
            status: spec.status.unwrap_or_default(),
            auth: spec.auth.unwrap_or_default(),
            temporal: spec.temporal,
            context,
            tables,
        })
    }

    pub fn context(&self) -> &DatasetContext {
        &self.context
    }

    pub fn version(&self) -> Option<&semver::Version> {
        self.context.version.as_ref()
    }

    pub fn default_version(&self) -> Option<&semver::Version> {
        self.context.default_version.as_ref()
    }

    pub fn is_default_version(&self) -> bool {
        self.context.is_default_version()
    }

    pub fn crs(&self) -> Option<&str> {
        self.context.crs.as_deref()
    }

    pub fn srid(&self) -> Option<i32> {
        self.context.srid()
    }

    pub fn use_dimension_fields(&self) -> bool {
        self.context.use_dimension_fields
    }

    /// The declared tables, in document order.
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Find a table among the declared and derived tables. Ids are
    /// compared snake-cased, so event streams using `ggwgebieden_bestaat_uit_buurten`
    /// resolve the same table as `ggwgebieden_bestaatUitBuurten`.
    pub fn get_table_by_id(&self, table_id: &str) -> Result<TableSchema, Error> {
        let snaked = to_snake_case(table_id);
        if let Some(table) = self
            .tables
            .iter()
            .find(|t| to_snake_case(&t.id) == snaked)
        {
            return Ok(table.clone());
        }
        for table in self.tables_including_derived() {
            if to_snake_case(&table.id) == snaked {
                return Ok(table);
            }
        }
        Err(Error::table_not_found(
            &self.id,
            table_id,
            self.tables.iter().map(|t| t.id.clone()),
        ))
    }

    /// Like [`get_table_by_id`], restricted to declared tables; borrows
    /// instead of cloning.
    pub fn get_declared_table(&self, table_id: &str) -> Result<&TableSchema, Error> {
        let snaked = to_snake_case(table_id);
        self.tables
            .iter()
            .find(|t| to_snake_case(&t.id) == snaked)
            .ok_or_else(|| {
                Error::table_not_found(&self.id, table_id, self.tables.iter().map(|t| t.id.clone()))
            })
    }

    /// Dataset ids referenced by relations of this dataset's tables; the
    /// loader prefetches their documents so cross-dataset lookups resolve.
    pub fn related_dataset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tables
            .iter()
            .flat_map(|t| t.fields())
            .filter_map(|f| f.any_relation())
            .map(|r| r.dataset_id.clone())
            .filter(|id| *id != self.id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Check structural invariants that the parser cannot express:
    /// camelCase round-trips of field ids and identifier references.
    /// Errors are aggregated per dataset.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        for table in &self.tables {
            for field in table.fields() {
                // Composite subfield ids legitimately contain the relation
                // indicator; only declared ids must round-trip.
                if field.id.contains('_') {
                    continue;
                }
                let round_trip = to_camel_case(&to_snake_case(&field.id));
                if round_trip != field.id {
                    errors.push(format!(
                        "{}: field id does not round-trip to camelCase ('{}' became '{}')",
                        field.qualified_id(),
                        field.id,
                        round_trip
                    ));
                }
            }
            // Legacy tables without a declared identifier fall back to an
            // implicit `id` key; only explicit identifiers must resolve.
            let implicit_key = table.identifier() == ["id".to_string()]
                && table.get_field_by_id("id").is_err();
            if !implicit_key {
                if let Err(err) = table.identifier_fields() {
                    errors.push(err.to_string());
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                dataset: self.id.clone(),
                errors,
            })
        }
    }
}

/// Read-only access to every loaded dataset. The loader cache implements
/// this; components receive it explicitly instead of a process singleton.
pub trait DatasetCollection: Send + Sync {
    fn get_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, Error>;
}

/// A collection with nothing in it, for contexts where cross-dataset
/// relations are known not to occur.
#[derive(Debug, Default)]
pub struct EmptyCollection;

impl DatasetCollection for EmptyCollection {
    fn get_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, Error> {
        Err(Error::DatasetNotFound(dataset_id.to_string()))
    }
}
