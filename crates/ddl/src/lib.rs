//! The DDL planner: turns physical table descriptors into `CREATE`
//! statements, derives the role matrix from the schema's scopes, and
//! emits the matching GRANT/REVOKE statements. Generation is pure;
//! [`apply_statements`] executes a plan against PostgreSQL.

mod apply;
mod grants;
mod planner;
mod views;

pub use apply::apply_statements;
pub use grants::{
    collect_scopes, create_role_statement, dataset_read_grants, dataset_write_grants,
    grant_statements, profile_read_grants, revoke_statement, scope_to_role, write_role, GrantSet,
    RoleTarget,
};
pub use planner::{
    create_index_statements, create_schema_statement, create_table_statement, plan_dataset,
    quote_ident, Plan,
};
pub use views::{is_valid_view_sql, required_view_scopes, view_statements};
