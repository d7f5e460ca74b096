use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use models::{ProfileSchema, Publisher, Scope};
use serde_json::Value;
use url::Url;

use crate::filesystem::read_json_path;
use crate::Error;

/// Access to the profile repository.
pub trait ProfileLoader: Send + Sync {
    fn get_profile(&self, profile_id: &str) -> Result<ProfileSchema, Error>;
    fn get_all_profiles(&self) -> Result<Vec<ProfileSchema>, Error>;
}

/// Loads profiles from a folder of JSON files.
pub struct FileSystemProfileLoader {
    root: PathBuf,
}

impl FileSystemProfileLoader {
    pub fn new(root: impl AsRef<Path>) -> Result<FileSystemProfileLoader, Error> {
        Ok(FileSystemProfileLoader {
            root: root.as_ref().to_path_buf(),
        })
    }
}

impl ProfileLoader for FileSystemProfileLoader {
    fn get_profile(&self, profile_id: &str) -> Result<ProfileSchema, Error> {
        let value = read_json_path(&self.root.join(format!("{profile_id}.json")))?;
        Ok(ProfileSchema::from_value(value)?)
    }

    fn get_all_profiles(&self) -> Result<Vec<ProfileSchema>, Error> {
        let mut profiles = Vec::new();
        for path in json_files_under(&self.root)? {
            if path.file_name().map_or(false, |n| n == "index.json") {
                continue;
            }
            let value = read_json_path(&path)?;
            profiles.push(ProfileSchema::from_value(value)?);
        }
        Ok(profiles)
    }
}

/// Loads profiles from the profile repository URL, driven by its
/// `index.json`.
pub struct UrlProfileLoader {
    base: Url,
    client: reqwest::blocking::Client,
}

impl UrlProfileLoader {
    pub fn new(base: &str) -> Result<UrlProfileLoader, Error> {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|err| Error::InvalidLocation {
            location: base.clone(),
            reason: err.to_string(),
        })?;
        Ok(UrlProfileLoader {
            base,
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("constructing an HTTP client cannot fail"),
        })
    }

    fn read_json_url(&self, relative: &str) -> Result<Value, Error> {
        let url = self.base.join(relative).map_err(|err| Error::InvalidLocation {
            location: format!("{}{relative}", self.base),
            reason: err.to_string(),
        })?;
        let wrap = |source| Error::Http {
            url: url.to_string(),
            source,
        };
        self.client
            .get(url.clone())
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(wrap)?
            .json()
            .map_err(wrap)
    }
}

impl ProfileLoader for UrlProfileLoader {
    fn get_profile(&self, profile_id: &str) -> Result<ProfileSchema, Error> {
        let value = self.read_json_url(&format!("{profile_id}.json"))?;
        Ok(ProfileSchema::from_value(value)?)
    }

    fn get_all_profiles(&self) -> Result<Vec<ProfileSchema>, Error> {
        let index: Vec<String> = serde_json::from_value(self.read_json_url("index.json")?)
            .map_err(|source| Error::Json {
                location: format!("{}index.json", self.base),
                source,
            })?;
        index
            .iter()
            .map(|name| self.get_profile(name))
            .collect()
    }
}

/// Read all scope documents from a folder, for `import-scopes`.
pub fn scopes_from_dir(root: impl AsRef<Path>) -> Result<Vec<Scope>, Error> {
    json_files_under(root.as_ref())?
        .iter()
        .map(|path| Ok(Scope::from_value(read_json_path(path)?)?))
        .collect()
}

/// Read all publisher documents from a folder, for `import-publishers`.
pub fn publishers_from_dir(root: impl AsRef<Path>) -> Result<Vec<Publisher>, Error> {
    json_files_under(root.as_ref())?
        .iter()
        .filter(|path| path.file_name().map_or(true, |n| n != "index.json"))
        .map(|path| Ok(Publisher::from_value(read_json_path(path)?)?))
        .collect()
}

fn json_files_under(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| Error::Io {
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
                stack.push(path);
            } else if path.extension().map_or(false, |e| e == "json") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filesystem_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("brk_readall.json"),
            json!({
                "name": "brk_readall",
                "scopes": ["BRK/RSN"],
                "datasets": {"brk": {"permissions": "read"}}
            })
            .to_string(),
        )
        .unwrap();

        let loader = FileSystemProfileLoader::new(tmp.path()).unwrap();
        let profile = loader.get_profile("brk_readall").unwrap();
        assert_eq!(profile.name, "brk_readall");

        let all = loader.get_all_profiles().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_scopes_from_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("brk-ro.json"),
            json!({"id": "BRK/RO", "name": "BRK read"}).to_string(),
        )
        .unwrap();
        let scopes = scopes_from_dir(tmp.path()).unwrap();
        assert_eq!(scopes[0].id, "BRK/RO");
    }
}
