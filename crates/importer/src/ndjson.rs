use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::{Map, Value};

use crate::ParseError;

/// Iterate the records of an NDJSON file: one JSON object per line,
/// empty lines skipped. A malformed line is a parse error, which aborts
/// the file.
pub fn read_ndjson(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Map<String, Value>, ParseError>>, ParseError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(reader
        .lines()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|line| {
            let line = line?;
            match serde_json::from_str::<Value>(&line)? {
                Value::Object(map) => Ok(map),
                other => Err(ParseError::NotAnObject(other.to_string())),
            }
        }))
}
