use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::{Error, SchemaLoader};

/// Loads dataset schemas from a directory tree. Datasets are recognized
/// by their `<path>/dataset.json` file; versioned tables live next to it
/// as `<table>/v<major>.<minor>.<patch>.json`.
pub struct FileSystemSchemaLoader {
    root: PathBuf,
}

impl FileSystemSchemaLoader {
    pub fn new(root: impl AsRef<Path>) -> Result<FileSystemSchemaLoader, Error> {
        let root = root.as_ref().to_path_buf();
        let metadata = fs::metadata(&root).map_err(|source| Error::Io {
            path: root.display().to_string(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(Error::Io {
                path: root.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "schema root must be a directory, not a file",
                ),
            });
        }
        Ok(FileSystemSchemaLoader { root })
    }

    /// Resolve the real `datasets/` root from any path inside a schema
    /// repository checkout, so relative dataset paths stay correct when a
    /// subfolder is imported.
    pub fn get_root(path: impl AsRef<Path>) -> Option<PathBuf> {
        let path = path.as_ref();
        if path.file_name().map_or(false, |n| n == "datasets") {
            return Some(path.to_path_buf());
        }
        let nested = path.join("datasets");
        if nested.is_dir() {
            return Some(nested);
        }
        path.ancestors()
            .find(|dir| dir.file_name().map_or(false, |n| n == "datasets"))
            .map(Path::to_path_buf)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect_dataset_files(&self, dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), Error> {
        let entries = fs::read_dir(dir).map_err(|source| Error::Io {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_dataset_files(&path, found)?;
            } else if path.file_name().map_or(false, |n| n == "dataset.json") {
                found.push(path);
            }
        }
        Ok(())
    }
}

pub(crate) fn read_json_path(path: &Path) -> Result<Value, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| Error::Json {
        location: path.display().to_string(),
        source,
    })
}

impl SchemaLoader for FileSystemSchemaLoader {
    fn read_index(&self) -> Result<BTreeMap<String, String>, Error> {
        let mut files = Vec::new();
        self.collect_dataset_files(&self.root, &mut files)?;

        let mut index = BTreeMap::new();
        for path in files {
            let value = read_json_path(&path)?;
            if value.get("type").and_then(Value::as_str) != Some("dataset") {
                continue;
            }
            let Some(id) = value.get("id").and_then(Value::as_str) else {
                continue;
            };
            let relative = path
                .parent()
                .and_then(|dir| dir.strip_prefix(&self.root).ok())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if index.insert(id.to_string(), relative).is_some() {
                return Err(models::Error::InvalidSchema(format!(
                    "schema root '{}' contains multiple datasets named '{id}'",
                    self.root.display()
                ))
                .into());
            }
        }
        Ok(index)
    }

    fn read_dataset(&self, dataset_id: &str) -> Result<Value, Error> {
        let index = self.read_index()?;
        let relative = index
            .get(dataset_id)
            .ok_or_else(|| models::Error::DatasetNotFound(dataset_id.to_string()))?;
        read_json_path(&self.root.join(relative).join("dataset.json"))
    }

    fn read_table(&self, dataset_id: &str, table_ref: &str) -> Result<Value, Error> {
        let index = self.read_index()?;
        let relative = index
            .get(dataset_id)
            .ok_or_else(|| models::Error::DatasetNotFound(dataset_id.to_string()))?;
        read_json_path(&self.root.join(relative).join(format!("{table_ref}.json")))
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CachedSchemaLoader;
    use serde_json::json;
    use std::fs;

    fn write_dataset(root: &Path, relative: &str, value: &Value) {
        let dir = root.join(relative);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("dataset.json"), value.to_string()).unwrap();
    }

    fn minimal_dataset(id: &str) -> Value {
        json!({
            "id": id,
            "type": "dataset",
            "tables": [{
                "id": "things",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {
                        "identificatie": {"type": "string"}
                    }
                }
            }]
        })
    }

    #[test]
    fn test_index_and_dataset_loading() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path(), "gebieden", &minimal_dataset("gebieden"));
        write_dataset(tmp.path(), "sub/nap", &minimal_dataset("nap"));

        let loader = FileSystemSchemaLoader::new(tmp.path()).unwrap();
        let index = loader.read_index().unwrap();
        assert_eq!(index["gebieden"], "gebieden");
        assert_eq!(index["nap"], "sub/nap");

        let cached = CachedSchemaLoader::new(Box::new(loader));
        let dataset = cached.get_dataset("nap", false).unwrap();
        assert_eq!(dataset.id, "nap");
        // Served from cache: the same Arc comes back.
        let again = cached.get_dataset("nap", false).unwrap();
        assert!(std::sync::Arc::ptr_eq(&dataset, &again));
    }

    #[test]
    fn test_missing_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FileSystemSchemaLoader::new(tmp.path()).unwrap();
        let cached = CachedSchemaLoader::new(Box::new(loader));
        let err = cached.get_dataset("nope", false).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_duplicate_dataset_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path(), "a", &minimal_dataset("twin"));
        write_dataset(tmp.path(), "b", &minimal_dataset("twin"));

        let loader = FileSystemSchemaLoader::new(tmp.path()).unwrap();
        assert!(loader.read_index().is_err());
    }

    #[test]
    fn test_table_ref_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("gebieden");
        fs::create_dir_all(dir.join("bouwblokken")).unwrap();
        fs::write(
            dir.join("dataset.json"),
            json!({
                "id": "gebieden",
                "type": "dataset",
                "tables": [{"id": "bouwblokken", "$ref": "bouwblokken/v1.0.0"}]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            dir.join("bouwblokken/v1.0.0.json"),
            json!({
                "id": "bouwblokken",
                "type": "table",
                "version": "1.0.0",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {
                        "identificatie": {"type": "string"}
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        let cached =
            CachedSchemaLoader::new(Box::new(FileSystemSchemaLoader::new(tmp.path()).unwrap()));
        let dataset = cached.get_dataset("gebieden", false).unwrap();
        let table = dataset.get_declared_table("bouwblokken").unwrap();
        assert_eq!(table.version.as_ref().map(|v| v.major), Some(1));
    }

    #[test]
    fn test_get_root() {
        let tmp = tempfile::tempdir().unwrap();
        let datasets = tmp.path().join("datasets");
        fs::create_dir_all(datasets.join("gebieden")).unwrap();

        assert_eq!(FileSystemSchemaLoader::get_root(tmp.path()), Some(datasets.clone()));
        assert_eq!(FileSystemSchemaLoader::get_root(&datasets), Some(datasets.clone()));
        assert_eq!(
            FileSystemSchemaLoader::get_root(datasets.join("gebieden")),
            Some(datasets)
        );
    }
}
