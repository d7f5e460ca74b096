use models::{DatasetSchema, Error, FieldSchema, ScopeSet, TableSchema, PUBLIC_SCOPE};
use names::to_snake_case;

/// Which roles receive the generated grants.
#[derive(Debug, Clone)]
pub enum RoleTarget {
    /// One `scope_<scope>` role per distinct scope found in the schema.
    Auto,
    /// A single existing role, granted only the privileges belonging to
    /// `scope`.
    Single { role: String, scope: String },
}

/// A set of privileges on one table for a list of grantees.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantSet {
    pub table: String,
    pub privileges: Vec<String>,
    pub grantees: Vec<String>,
}

/// `BRK/RO` becomes role `scope_brk_ro`.
pub fn scope_to_role(scope: &str) -> String {
    format!("scope_{}", scope.replace('/', "_").to_lowercase())
}

/// The writer role of a dataset.
pub fn write_role(dataset_id: &str) -> String {
    format!("write_{}", to_snake_case(dataset_id))
}

fn fetch_grantees(target: &RoleTarget, scopes: &ScopeSet) -> Vec<String> {
    match target {
        RoleTarget::Auto => {
            if scopes.is_empty() {
                vec![scope_to_role(PUBLIC_SCOPE)]
            } else {
                scopes.iter().map(scope_to_role).collect()
            }
        }
        RoleTarget::Single { role, scope } => {
            let matches = if scopes.is_empty() {
                scope == PUBLIC_SCOPE
            } else {
                scopes.contains(scope)
            };
            if matches {
                vec![role.clone()]
            } else {
                Vec::new()
            }
        }
    }
}

fn column_scope(field: &FieldSchema) -> ScopeSet {
    field.auth.without_public()
}

/// Read grants for one dataset, per the scope layering of the schema:
/// a table scope overrides the dataset scope; any field scope forces
/// per-column grants on its table; nested and through tables inherit the
/// scope of the field that spawned them.
pub fn dataset_read_grants(
    dataset: &DatasetSchema,
    target: &RoleTarget,
) -> Result<Vec<GrantSet>, Error> {
    let mut grants: Vec<GrantSet> = Vec::new();
    let select = vec!["SELECT".to_string()];

    for table in dataset.tables() {
        let table_name = table.db_name();
        let fallback = {
            let table_scopes = table.auth.without_public();
            if table_scopes.is_empty() {
                dataset.auth.clone()
            } else {
                table_scopes
            }
        };

        // Column scopes, considering the expanded subfield columns too.
        let mut column_scopes: Vec<(String, ScopeSet)> = Vec::new();
        for field in physical_fields(table) {
            let scopes = column_scope(field);
            if !scopes.is_empty() {
                column_scopes.push((field.db_name(), scopes));
            }
        }

        // Derived tables take the spawning field's scope, with the table
        // scope as fallback.
        for field in table.fields() {
            if field.is_nested_table() {
                let nested = dataset.build_nested_table(table, field);
                grants.push(GrantSet {
                    table: nested.db_name(),
                    privileges: select.clone(),
                    grantees: fetch_grantees(target, &non_empty(column_scope(field), &fallback)),
                });
            }
            if field.is_through_table() {
                let through = dataset.build_through_table(table, field);
                grants.push(GrantSet {
                    table: through.db_name(),
                    privileges: select.clone(),
                    grantees: fetch_grantees(target, &non_empty(column_scope(field), &fallback)),
                });
            }
        }

        if column_scopes.is_empty() {
            grants.push(GrantSet {
                table: table_name,
                privileges: select.clone(),
                grantees: fetch_grantees(target, &fallback),
            });
        } else {
            // One column-level grant per physical column; protected
            // columns get their own scopes, the rest the fallback.
            for field in physical_fields(table) {
                let column = field.db_name();
                let scopes = column_scopes
                    .iter()
                    .find(|(name, _)| *name == column)
                    .map(|(_, scopes)| scopes.clone())
                    .unwrap_or_else(|| fallback.clone());
                grants.push(GrantSet {
                    table: table_name.clone(),
                    privileges: vec![format!("SELECT ({column})")],
                    grantees: fetch_grantees(target, &scopes),
                });
            }
        }
    }
    Ok(grants)
}

/// Write grants: full table privileges on every table of the dataset for
/// its writer role.
pub fn dataset_write_grants(dataset: &DatasetSchema) -> Vec<GrantSet> {
    let privileges: Vec<String> = ["SELECT", "INSERT", "UPDATE", "DELETE", "TRUNCATE", "REFERENCES"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let grantee = write_role(&dataset.id);

    dataset
        .tables_including_derived()
        .iter()
        .map(|table| GrantSet {
            table: table.db_name(),
            privileges: privileges.clone(),
            grantees: vec![grantee.clone()],
        })
        .collect()
}

/// Profile-driven read grants: a role that carries a profile's scope may
/// read the tables of every dataset the profile mentions.
pub fn profile_read_grants(
    profiles: &[models::ProfileSchema],
    datasets: &[&DatasetSchema],
    role: &str,
    scope: &str,
) -> Vec<GrantSet> {
    let mut grants = Vec::new();
    for profile in profiles {
        if !profile.scopes.contains(scope) {
            continue;
        }
        for dataset in datasets {
            if !profile.datasets.contains_key(&dataset.id) {
                continue;
            }
            for table in dataset.tables_including_derived() {
                grants.push(GrantSet {
                    table: table.db_name(),
                    privileges: vec!["SELECT".to_string()],
                    grantees: vec![role.to_string()],
                });
            }
        }
    }
    grants
}

/// The flattened physical fields of a table: scalar fields plus the
/// expanded subfield columns, excluding arrays, the schema pointer and
/// temporal helper fields.
fn physical_fields(table: &TableSchema) -> Vec<&FieldSchema> {
    let mut fields = Vec::new();
    for field in table.fields() {
        if field.is_schema_ref() || field.is_array() || field.is_temporal {
            continue;
        }
        if field.is_object() && field.format.as_deref() != Some("json") {
            for subfield in field.subfields() {
                if !subfield.is_temporal {
                    fields.push(subfield);
                }
            }
            if field.relation().is_some() {
                fields.push(field);
            }
        } else {
            fields.push(field);
        }
    }
    fields
}

fn non_empty(scopes: ScopeSet, fallback: &ScopeSet) -> ScopeSet {
    if scopes.is_empty() {
        fallback.clone()
    } else {
        scopes
    }
}

/// GRANT statements for one grant set, one per grantee.
pub fn grant_statements(pg_schema: &str, grant: &GrantSet) -> Vec<String> {
    grant
        .grantees
        .iter()
        .map(|grantee| {
            format!(
                "GRANT {} ON {pg_schema}.{} TO {grantee}",
                grant.privileges.join(", "),
                grant.table
            )
        })
        .collect()
}

/// Role creation that tolerates the role already existing.
pub fn create_role_statement(role: &str) -> String {
    format!(
        r#"DO $$
BEGIN
  CREATE ROLE {role};
EXCEPTION
  WHEN duplicate_object THEN RAISE NOTICE 'role {role} already exists, skipping';
END
$$"#
    )
}

/// A prior `REVOKE ALL` for a role on a dataset's tables, tolerating
/// missing objects and insufficient privileges.
pub fn revoke_statement(pg_schema: &str, dataset: &DatasetSchema, role: &str) -> String {
    let revokes: Vec<String> = dataset
        .tables_including_derived()
        .iter()
        .map(|table| {
            format!(
                "REVOKE ALL PRIVILEGES ON {pg_schema}.{} FROM {role}",
                table.db_name()
            )
        })
        .collect();
    format!(
        r#"DO $$
BEGIN
  {};
EXCEPTION
  WHEN undefined_object THEN RAISE NOTICE '%, skipping', SQLERRM USING ERRCODE = SQLSTATE;
  WHEN undefined_table THEN RAISE NOTICE '%, skipping', SQLERRM USING ERRCODE = SQLSTATE;
  WHEN insufficient_privilege THEN RAISE NOTICE '%, skipping', SQLERRM USING ERRCODE = SQLSTATE;
END
$$"#,
        revokes.join(";\n  ")
    )
}

/// Every distinct scope named anywhere in the dataset, for `AUTO` role
/// creation.
pub fn collect_scopes(dataset: &DatasetSchema) -> Vec<String> {
    let mut scopes: Vec<String> = dataset.auth.iter().map(str::to_string).collect();
    for table in dataset.tables() {
        scopes.extend(table.auth.iter().map(str::to_string));
        for field in table.fields() {
            scopes.extend(field.auth.iter().map(str::to_string));
            for subfield in field.subfields() {
                scopes.extend(subfield.auth.iter().map(str::to_string));
            }
        }
    }
    scopes.push(PUBLIC_SCOPE.to_string());
    scopes.sort();
    scopes.dedup();
    scopes
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn dataset() -> DatasetSchema {
        DatasetSchema::from_value(json!({
            "id": "afval",
            "type": "dataset",
            "auth": "AFVAL/R",
            "tables": [{
                "id": "containers",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {
                        "identificatie": {"type": "string"},
                        "eigenaar": {"type": "string", "auth": "AFVAL/EIGENAAR"}
                    }
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_field_scope_forces_column_grants() {
        let grants = dataset_read_grants(&dataset(), &RoleTarget::Auto).unwrap();
        // One grant per column, not one per table.
        let columns: Vec<&str> = grants
            .iter()
            .map(|g| g.privileges[0].as_str())
            .collect();
        assert!(columns.contains(&"SELECT (identificatie)"));
        assert!(columns.contains(&"SELECT (eigenaar)"));

        let eigenaar = grants
            .iter()
            .find(|g| g.privileges[0] == "SELECT (eigenaar)")
            .unwrap();
        assert_eq!(eigenaar.grantees, vec!["scope_afval_eigenaar"]);

        // Unprotected columns fall back to the dataset scope.
        let identificatie = grants
            .iter()
            .find(|g| g.privileges[0] == "SELECT (identificatie)")
            .unwrap();
        assert_eq!(identificatie.grantees, vec!["scope_afval_r"]);
    }

    #[test]
    fn test_public_dataset_grants_to_openbaar() {
        let dataset = DatasetSchema::from_value(json!({
            "id": "parken",
            "type": "dataset",
            "tables": [{
                "id": "bomen",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {"identificatie": {"type": "string"}}
                }
            }]
        }))
        .unwrap();
        let grants = dataset_read_grants(&dataset, &RoleTarget::Auto).unwrap();
        assert_eq!(
            grants,
            vec![GrantSet {
                table: "parken_bomen".to_string(),
                privileges: vec!["SELECT".to_string()],
                grantees: vec!["scope_openbaar".to_string()],
            }]
        );
    }

    #[test]
    fn test_single_role_target_filters_by_scope() {
        let grants = dataset_read_grants(
            &dataset(),
            &RoleTarget::Single {
                role: "ambtenaar".to_string(),
                scope: "AFVAL/EIGENAAR".to_string(),
            },
        )
        .unwrap();
        let with_grantees: Vec<&GrantSet> =
            grants.iter().filter(|g| !g.grantees.is_empty()).collect();
        assert_eq!(with_grantees.len(), 1);
        assert_eq!(with_grantees[0].privileges, vec!["SELECT (eigenaar)"]);
        assert_eq!(with_grantees[0].grantees, vec!["ambtenaar"]);
    }

    #[test]
    fn test_write_grants() {
        let grants = dataset_write_grants(&dataset());
        assert_eq!(grants[0].grantees, vec!["write_afval"]);
        assert!(grants[0].privileges.contains(&"TRUNCATE".to_string()));
    }

    #[test]
    fn test_role_statement_is_idempotent_block() {
        let statement = create_role_statement("scope_afval_r");
        assert!(statement.contains("duplicate_object"));
        assert!(statement.contains("CREATE ROLE scope_afval_r"));
    }
}
