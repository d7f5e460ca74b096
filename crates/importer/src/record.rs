use serde_json::{Map, Value};

/// Resolve a dotted JSONPath of the `$.a.b` form. Only child steps are
/// supported; that covers every provenance expression in the schema
/// repository.
pub fn jsonpath<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for step in path.strip_prefix("$.")?.split('.') {
        current = current.get(step)?;
    }
    Some(current)
}

/// A raw input record with the owning table's provenance rules applied:
/// a provenance of `otherName` renames that source key, `$.a.b` pulls the
/// value out of a nested document.
#[derive(Debug, Clone)]
pub struct Record {
    data: Map<String, Value>,
}

impl Record {
    /// `provenances` pairs each provenance expression with the target
    /// field id it feeds.
    pub fn new(mut data: Map<String, Value>, provenances: &[(String, String)]) -> Record {
        for (source, target) in provenances {
            let value = if source.starts_with('$') {
                jsonpath(&Value::Object(data.clone()), source).cloned()
            } else {
                data.remove(source)
            };
            if let Some(value) = value {
                data.insert(target.clone(), value);
            }
        }
        Record { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.data
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_jsonpath() {
        let value = json!({"a": {"b": {"c": 12}}});
        assert_eq!(jsonpath(&value, "$.a.b.c"), Some(&json!(12)));
        assert_eq!(jsonpath(&value, "$.a.x"), None);
        assert_eq!(jsonpath(&value, "a.b"), None);
    }

    #[test]
    fn test_rename_provenance() {
        let record = Record::new(
            as_map(json!({"plaats": "Amsterdam"})),
            &[("plaats".to_string(), "stad".to_string())],
        );
        assert_eq!(record.get("stad"), Some(&json!("Amsterdam")));
        assert_eq!(record.get("plaats"), None);
    }

    #[test]
    fn test_jsonpath_provenance() {
        let record = Record::new(
            as_map(json!({"adres": {"straat": "Kalverstraat"}})),
            &[("$.adres.straat".to_string(), "straatnaam".to_string())],
        );
        assert_eq!(record.get("straatnaam"), Some(&json!("Kalverstraat")));
        // The source document is left in place for other lookups.
        assert!(record.get("adres").is_some());
    }
}
