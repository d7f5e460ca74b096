//! In-memory representation of the Amsterdam Schema: datasets, tables,
//! fields, profiles, scopes and publishers, plus the derivation of the
//! implicit nested and through tables.

mod dataset;
mod derivation;
mod error;
mod field;
mod permissions;
mod profile;
mod publisher;
mod scopes;
mod table;
mod temporal;

pub use dataset::{
    DatasetCollection, DatasetSchema, DatasetSpec, EmptyCollection, Status, TableEntry, TableRef,
};
pub use error::Error;
pub use field::{FieldSchema, FieldSpec, FieldType, Relation};
pub use permissions::{Permission, PermissionLevel};
pub use profile::{ProfileDataset, ProfileSchema, ProfileTable};
pub use publisher::{Publisher, Scope};
pub use scopes::{ScopeSet, PUBLIC_SCOPE};
pub use table::{DatasetContext, Identifier, TableSchema, TableSchemaSpec, TableSpec};
pub use temporal::{Dimension, Temporal};
