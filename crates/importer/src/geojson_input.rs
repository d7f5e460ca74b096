use std::path::Path;

use serde_json::{Map, Value};

use models::TableSchema;

use crate::ParseError;

/// Read a GeoJSON FeatureCollection into per-feature records: the
/// properties (cleaned) plus the geometry under the table's main
/// geometry field.
pub fn read_geojson(path: &Path, table: &TableSchema) -> Result<Vec<Map<String, Value>>, ParseError> {
    let contents = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&contents)?;

    if value.get("type").and_then(Value::as_str) != Some("FeatureCollection")
        || !value.get("features").map_or(false, Value::is_array)
    {
        return Err(ParseError::InvalidGeoJson(path.display().to_string()));
    }

    let geometry_field = table
        .main_geometry_field()
        .map(|f| f.id.clone())
        .unwrap_or_else(|| "geometry".to_string());

    let mut records = Vec::new();
    for feature in value["features"].as_array().into_iter().flatten() {
        if feature.get("type").and_then(Value::as_str) != Some("Feature") {
            return Err(ParseError::InvalidGeoJson(format!(
                "expected a Feature in {}",
                path.display()
            )));
        }
        let mut record = Map::new();
        if let Some(properties) = feature.get("properties").and_then(Value::as_object) {
            for (name, value) in properties {
                let (name, value) = clean_property(name, value.clone());
                record.insert(name, value);
            }
        }
        if let Some(geometry) = feature.get("geometry") {
            record.insert(geometry_field.clone(), geometry.clone());
        }
        records.push(record);
    }
    Ok(records)
}

/// Property names may carry `@`/`$` markers; `id` values of the
/// `name/number` or `name.number` form keep the number part, which
/// signals that several feature types share one file.
fn clean_property(name: &str, value: Value) -> (String, Value) {
    let name = name.strip_prefix(['@', '$']).unwrap_or(name).to_string();
    if name == "id" {
        if let Value::String(id) = &value {
            if let Some((prefix, number)) = id.split_once(['/', '.']) {
                if !prefix.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                    return (name, Value::String(number.to_string()));
                }
            }
        }
    }
    (name, value)
}
