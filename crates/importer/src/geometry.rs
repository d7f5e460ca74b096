use serde_json::Value;
use wkt::ToWkt;

use crate::ParseError;

/// Convert a GeoJSON geometry object to the `SRID=<srid>;<wkt>` form that
/// PostGIS accepts as EWKT input.
pub fn geojson_to_ewkt(value: &Value, srid: i32) -> Result<String, ParseError> {
    let geometry: geojson::Geometry = serde_json::from_value(value.clone())
        .map_err(|_| ParseError::InvalidGeometry(value.to_string()))?;
    let geometry: geo_types::Geometry<f64> = geometry
        .try_into()
        .map_err(|_| ParseError::InvalidGeometry(value.to_string()))?;
    Ok(format!("SRID={srid};{}", geometry.wkt_string()))
}
