//! Per-request authorization over the Amsterdam Schema.
//!
//! A [`UserScopes`] captures the scopes and query parameters of one
//! request and answers `has_..._access` questions against datasets,
//! tables and fields. The `auth` clauses in schemas act as a blacklist:
//! everything is readable unless an `auth` clause restricts it. Profiles
//! act as a whitelist on top, opening up specific levels of access when
//! the direct `auth` checks do not grant anything.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use models::{
    DatasetSchema, FieldSchema, Permission, PermissionLevel, ProfileDataset, ProfileSchema,
    ProfileTable, ScopeSet, TableSchema, PUBLIC_SCOPE,
};

/// A profile-dataset that applies to the current request, together with
/// the name of the profile it came from.
#[derive(Debug, Clone)]
pub struct ActiveProfileDataset {
    pub profile_name: String,
    pub dataset: ProfileDataset,
}

/// A profile-table that applies to the current request.
#[derive(Debug, Clone)]
pub struct ActiveProfileTable {
    pub profile_name: String,
    pub table: ProfileTable,
}

/// The scopes and query parameters of one request, with memoised
/// permission lookups. Construct one per request; results are cached for
/// its lifetime.
pub struct UserScopes {
    scopes: BTreeSet<String>,
    query_param_names: Vec<String>,
    profiles: Vec<ProfileSchema>,
    active_datasets: RefCell<HashMap<String, Rc<Vec<ActiveProfileDataset>>>>,
}

impl UserScopes {
    /// `query_params` entries with empty values are discarded; the public
    /// scope is implied.
    pub fn new(
        query_params: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        request_scopes: impl IntoIterator<Item = impl Into<String>>,
        profiles: Vec<ProfileSchema>,
    ) -> UserScopes {
        let mut scopes: BTreeSet<String> =
            request_scopes.into_iter().map(Into::into).collect();
        scopes.insert(PUBLIC_SCOPE.to_string());

        let query_param_names = query_params
            .into_iter()
            .filter_map(|(name, value)| {
                let value: String = value.into();
                (!value.is_empty()).then(|| name.into())
            })
            .collect();

        UserScopes {
            scopes,
            query_param_names,
            profiles,
            active_datasets: RefCell::new(HashMap::new()),
        }
    }

    /// Tell that the request carries extra implicit parameters (e.g. the
    /// identifier in a detail URL), which count towards mandatory filter
    /// sets.
    pub fn add_query_params(&mut self, params: impl IntoIterator<Item = impl Into<String>>) {
        self.query_param_names.extend(params.into_iter().map(Into::into));
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }

    /// AND check: all of the needed scopes are present.
    pub fn has_all_scopes(&self, needed: &ScopeSet) -> bool {
        needed.iter().all(|scope| self.scopes.contains(scope))
    }

    /// OR check: one matching scope gives access. An empty clause is
    /// public and always passes.
    pub fn has_any_scope(&self, needed: &ScopeSet) -> bool {
        needed.is_empty() || needed.iter().any(|scope| self.scopes.contains(scope))
    }

    /// Tell whether a dataset can be accessed.
    pub fn has_dataset_access(&self, dataset: &DatasetSchema) -> Permission {
        let auth = self.dataset_auth_access(&dataset.auth);
        if auth.granted() {
            return auth;
        }
        self.dataset_profile_access(&dataset.id)
    }

    /// Tell whether a table can be accessed, and at which level.
    pub fn has_table_access(&self, table: &TableSchema) -> Permission {
        let auth = self.table_auth_access(table);
        if auth.granted() {
            return auth;
        }
        self.table_profile_access(table)
    }

    /// Tell whether every field of a table is readable.
    pub fn has_table_fields_access(&self, table: &TableSchema) -> bool {
        table
            .fields()
            .iter()
            .all(|field| self.has_field_access(table, field).granted())
    }

    /// Tell whether a field may be read.
    pub fn has_field_access(&self, table: &TableSchema, field: &FieldSchema) -> Permission {
        let auth = self.field_auth_access(table, field);
        if auth.granted() {
            return auth;
        }
        self.field_profile_access(table, field)
    }

    /// Tell whether a field may be used for filtering. `filterAuth` is an
    /// additional gate on top of read access; it never broadens it.
    pub fn has_field_filter_access(&self, table: &TableSchema, field: &FieldSchema) -> Permission {
        if !self.has_any_scope(&field.filter_auth) {
            return Permission::none();
        }
        let read = self.has_field_access(table, field);
        if !read.granted() {
            return Permission::none();
        }
        if field.filter_auth.is_empty() {
            read
        } else {
            Permission::read("field.filter_auth")
        }
    }

    /// Profiles that mention the dataset and whose scopes are all held.
    pub fn active_profile_datasets(&self, dataset_id: &str) -> Rc<Vec<ActiveProfileDataset>> {
        if let Some(active) = self.active_datasets.borrow().get(dataset_id) {
            return active.clone();
        }

        let active: Vec<ActiveProfileDataset> = self
            .profiles
            .iter()
            .filter(|profile| self.has_all_scopes(&profile.scopes))
            .filter_map(|profile| {
                profile.dataset(dataset_id).map(|dataset| ActiveProfileDataset {
                    profile_name: profile.name.clone(),
                    dataset: dataset.clone(),
                })
            })
            .collect();
        let active = Rc::new(active);
        self.active_datasets
            .borrow_mut()
            .insert(dataset_id.to_string(), active.clone());
        active
    }

    /// Profiles that mention the table, pass the scope check, and pass the
    /// mandatory-filter check.
    pub fn active_profile_tables(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Vec<ActiveProfileTable> {
        self.active_profile_datasets(dataset_id)
            .iter()
            .filter_map(|active| {
                active.dataset.tables.get(table_id).and_then(|table| {
                    self.may_include_profile_table(table).then(|| ActiveProfileTable {
                        profile_name: active.profile_name.clone(),
                        table: table.clone(),
                    })
                })
            })
            .collect()
    }

    fn dataset_auth_access(&self, auth: &ScopeSet) -> Permission {
        if self.has_any_scope(auth) {
            Permission::read("dataset.auth")
        } else {
            Permission::none()
        }
    }

    fn table_auth_access(&self, table: &TableSchema) -> Permission {
        let dataset_auth = &table.dataset().auth;
        if self.has_any_scope(&table.auth) && self.has_any_scope(dataset_auth) {
            let source = if !table.auth.is_empty() {
                "table.auth"
            } else {
                "dataset.auth"
            };
            Permission::read(source)
        } else {
            Permission::none()
        }
    }

    fn field_auth_access(&self, table: &TableSchema, field: &FieldSchema) -> Permission {
        let dataset_auth = &table.dataset().auth;
        if self.has_any_scope(&field.auth)
            && self.has_any_scope(&table.auth)
            && self.has_any_scope(dataset_auth)
        {
            let source = if !field.auth.is_empty() {
                "field.auth"
            } else if !table.auth.is_empty() {
                "table.auth"
            } else {
                "dataset.auth"
            };
            Permission::read(source)
        } else {
            Permission::none()
        }
    }

    fn dataset_profile_access(&self, dataset_id: &str) -> Permission {
        self.active_profile_datasets(dataset_id)
            .iter()
            .filter_map(|active| {
                active
                    .dataset
                    .permissions
                    .map(|level| Permission::new(level, active.profile_name.clone()))
            })
            .fold(Permission::none(), Permission::max)
    }

    /// Table level from profiles. A profile that grants on the dataset
    /// without mentioning the table extends that grant to the table.
    fn table_profile_access(&self, table: &TableSchema) -> Permission {
        let mut max = Permission::none();
        for active in self.active_profile_datasets(table.dataset_id()).iter() {
            if max.level == PermissionLevel::highest() {
                break;
            }
            match active.dataset.tables.get(&table.id) {
                None => {
                    if let Some(level) = active.dataset.permissions {
                        max = max.max(Permission::new(level, active.profile_name.clone()));
                    }
                }
                Some(profile_table) if self.may_include_profile_table(profile_table) => {
                    if let Some(level) = profile_table.permissions {
                        max = max.max(Permission::new(level, active.profile_name.clone()));
                    }
                }
                Some(_) => {}
            }
        }
        max
    }

    /// Field level from profiles. An explicit field permission wins by
    /// maximum; table- and dataset-wide grants act as fallbacks.
    fn field_profile_access(&self, table: &TableSchema, field: &FieldSchema) -> Permission {
        let mut max = Permission::none();
        for active in self.active_profile_datasets(table.dataset_id()).iter() {
            if max.level == PermissionLevel::highest() {
                break;
            }

            let Some(profile_table) = active.dataset.tables.get(&table.id) else {
                if let Some(level) = active.dataset.permissions {
                    max = max.max(Permission::new(level, active.profile_name.clone()));
                }
                continue;
            };
            if !self.may_include_profile_table(profile_table) {
                continue;
            }

            match profile_table.fields.get(&field.id) {
                Some(level) => {
                    max = max.max(Permission::new(*level, active.profile_name.clone()));
                }
                None => {
                    // No explicit field entry; a table-wide grant above
                    // "subobjects only" covers the field.
                    if let Some(level) = profile_table.permissions {
                        if level > PermissionLevel::SubobjectsOnly {
                            max = max.max(Permission::new(level, active.profile_name.clone()));
                        }
                    }
                }
            }
        }
        max
    }

    /// A profile table applies when it has no mandatory filter sets, or
    /// when at least one rule has all of its parameters present in the
    /// query.
    fn may_include_profile_table(&self, profile_table: &ProfileTable) -> bool {
        profile_table.mandatory_filtersets.is_empty()
            || profile_table.mandatory_filtersets.iter().any(|rule| {
                rule.iter()
                    .all(|name| self.query_param_names.iter().any(|p| p == name))
            })
    }
}
