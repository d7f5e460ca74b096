use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use models::{DatasetCollection, DatasetSchema, TableSchema, TableSpec};
use serde_json::Value;

use crate::Error;

/// A storage backend for schema documents. Implementations only know how
/// to read raw JSON; caching, `$ref` resolution and prefetching live in
/// [`CachedSchemaLoader`].
pub trait SchemaLoader: Send + Sync {
    /// The id-to-relative-path index of every dataset at this location.
    fn read_index(&self) -> Result<BTreeMap<String, String>, Error>;

    /// The raw `dataset.json` document of a dataset.
    fn read_dataset(&self, dataset_id: &str) -> Result<Value, Error>;

    /// The raw document of a versioned table reference such as
    /// `bouwblokken/v1.2.3`.
    fn read_table(&self, dataset_id: &str, table_ref: &str) -> Result<Value, Error>;

    /// Where this loader reads from, for error messages.
    fn location(&self) -> String;
}

#[derive(Default)]
struct Cache {
    datasets: HashMap<String, Arc<DatasetSchema>>,
    tables: HashMap<(String, String), TableSchema>,
    index: Option<BTreeMap<String, String>>,
    has_all: bool,
}

/// The memoising front of a [`SchemaLoader`]: datasets are parsed once and
/// shared by reference, so relations across datasets resolve to the same
/// instances. This is the single dataset collection of a process; every
/// component receives it explicitly.
pub struct CachedSchemaLoader {
    loader: Box<dyn SchemaLoader>,
    cache: Mutex<Cache>,
}

impl CachedSchemaLoader {
    pub fn new(loader: Box<dyn SchemaLoader>) -> Self {
        CachedSchemaLoader {
            loader,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Insert an already-parsed dataset, mainly for tests that construct
    /// their own collection.
    pub fn add_dataset(&self, dataset: DatasetSchema) -> Arc<DatasetSchema> {
        let dataset = Arc::new(dataset);
        let mut cache = self.cache.lock().unwrap();
        cache.datasets.insert(dataset.id.clone(), dataset.clone());
        dataset
    }

    /// Load a dataset by id. With `prefetch_related`, the transitive
    /// closure of related datasets is loaded as well, so later
    /// cross-dataset lookups cannot miss.
    pub fn get_dataset(
        &self,
        dataset_id: &str,
        prefetch_related: bool,
    ) -> Result<Arc<DatasetSchema>, Error> {
        let cached = {
            let cache = self.cache.lock().unwrap();
            cache.datasets.get(dataset_id).cloned()
        };
        let dataset = match cached {
            Some(dataset) => dataset,
            None => {
                tracing::debug!(dataset = %dataset_id, "loading dataset");
                let value = self.loader.read_dataset(dataset_id)?;
                let value = self.resolve_table_refs(dataset_id, value)?;
                let dataset = Arc::new(DatasetSchema::from_value(value)?);
                let mut cache = self.cache.lock().unwrap();
                cache
                    .datasets
                    .entry(dataset_id.to_string())
                    .or_insert(dataset)
                    .clone()
            }
        };

        if prefetch_related {
            for related_id in dataset.related_dataset_ids() {
                self.get_dataset(&related_id, true)?;
            }
        }
        Ok(dataset)
    }

    /// The relative path of a dataset within the loader's location.
    pub fn get_dataset_path(&self, dataset_id: &str) -> Result<String, Error> {
        let mut cache = self.cache.lock().unwrap();
        if cache.index.is_none() {
            cache.index = Some(self.loader.read_index()?);
        }
        cache
            .index
            .as_ref()
            .unwrap()
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| {
                tracing::debug!(dataset = %dataset_id, location = %self.loader.location(), "dataset not in index");
                models::Error::DatasetNotFound(dataset_id.to_string()).into()
            })
    }

    /// Load every dataset in the index, keyed by relative path.
    pub fn get_all_datasets(&self) -> Result<BTreeMap<String, Arc<DatasetSchema>>, Error> {
        let index = {
            let mut cache = self.cache.lock().unwrap();
            if cache.index.is_none() {
                cache.index = Some(self.loader.read_index()?);
            }
            cache.index.clone().unwrap()
        };

        let mut datasets = BTreeMap::new();
        for (dataset_id, path) in index {
            datasets.insert(path, self.get_dataset(&dataset_id, false)?);
        }
        self.cache.lock().unwrap().has_all = true;
        Ok(datasets)
    }

    /// Load a versioned table by reference, memoised per
    /// `(dataset, table_ref)`.
    pub fn get_table(
        &self,
        dataset: &DatasetSchema,
        table_ref: &str,
    ) -> Result<TableSchema, Error> {
        let key = (dataset.id.clone(), table_ref.to_string());
        {
            let cache = self.cache.lock().unwrap();
            if let Some(table) = cache.tables.get(&key) {
                return Ok(table.clone());
            }
        }

        let value = self.loader.read_table(&dataset.id, table_ref)?;
        let spec: TableSpec = serde_json::from_value(value).map_err(|source| Error::Json {
            location: format!("{}/{table_ref}", dataset.id),
            source,
        })?;
        let table = TableSchema::from_spec(&spec, dataset.context())?;
        let mut cache = self.cache.lock().unwrap();
        Ok(cache.tables.entry(key).or_insert(table).clone())
    }

    /// Replace `$ref` table entries of a raw dataset document by the
    /// referenced table documents.
    fn resolve_table_refs(&self, dataset_id: &str, mut value: Value) -> Result<Value, Error> {
        let Some(tables) = value.get_mut("tables").and_then(Value::as_array_mut) else {
            return Ok(value);
        };
        for entry in tables {
            let Some(reference) = entry.get("$ref").and_then(Value::as_str) else {
                continue;
            };
            let resolved = self.loader.read_table(dataset_id, reference)?;
            *entry = resolved;
        }
        Ok(value)
    }
}

impl DatasetCollection for CachedSchemaLoader {
    fn get_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, models::Error> {
        CachedSchemaLoader::get_dataset(self, dataset_id, false).map_err(Error::into_model_error)
    }
}
