//! JSON sidecar kept next to every case and rule.
//!
//! Reads are lenient: a missing or corrupt `metadata.json` is an empty object,
//! so listings keep working. Writes rewrite the whole file.

use crate::error::AppError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const METADATA_FILENAME: &str = "metadata.json";

pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILENAME)
}

pub fn get(dir: &Path) -> Map<String, Value> {
    let path = metadata_path(dir);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return Map::new();
        }
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            tracing::warn!("{} is not a JSON object, ignoring it", path.display());
            Map::new()
        }
        Err(e) => {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            Map::new()
        }
    }
}

pub fn put(dir: &Path, metadata: &Map<String, Value>) -> Result<(), AppError> {
    let body = serde_json::to_string_pretty(metadata)?;
    std::fs::write(metadata_path(dir), body)?;
    Ok(())
}

/// Shallow-merges `partial` into the stored object and writes it back.
pub fn merge_put(dir: &Path, partial: Map<String, Value>) -> Result<Map<String, Value>, AppError> {
    let mut current = get(dir);
    for (key, value) in partial {
        current.insert(key, value);
    }
    put(dir, &current)?;
    Ok(current)
}

/// Typed view of the sidecar; fields that are missing or malformed fall back to defaults.
pub fn get_typed<T: DeserializeOwned + Default>(dir: &Path) -> T {
    let map = get(dir);
    if map.is_empty() {
        return T::default();
    }
    match serde_json::from_value(Value::Object(map)) {
        Ok(typed) => typed,
        Err(e) => {
            tracing::warn!("Metadata in {} has unexpected shape: {}", dir.display(), e);
            T::default()
        }
    }
}

pub fn merge_put_typed<T: Serialize>(dir: &Path, value: &T) -> Result<Map<String, Value>, AppError> {
    match serde_json::to_value(value)? {
        Value::Object(partial) => merge_put(dir, partial),
        _ => Err(AppError::Internal("metadata must serialize to a JSON object".to_string())),
    }
}
