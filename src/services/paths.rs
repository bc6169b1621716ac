use crate::error::AppError;
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static FOLDER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[^/\\:*?"<>|\x00-\x1f]+$"#).expect("folder name pattern"));

pub const FOLDER_TIMESTAMP: &str = "%Y%m%d_%H%M%S";
pub const DISPLAY_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_display() -> String {
    Local::now().format(DISPLAY_TIMESTAMP).to_string()
}

/// Rejects names that could escape the storage root or are invalid on common filesystems.
pub fn validate_name(name: &str) -> Result<&str, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::MissingRequiredField("name".to_string()));
    }
    if trimmed == "." || trimmed == ".." || !FOLDER_NAME.is_match(trimmed) {
        return Err(AppError::InvalidInput(format!("invalid name: {}", name)));
    }
    Ok(trimmed)
}

/// Last path component of a client-supplied file name.
pub fn sanitize_file_name(name: &str) -> Result<String, AppError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    validate_name(base).map(str::to_string)
}

/// Existing child directory `root/name`, or `NotFound`.
pub fn existing_dir(root: &Path, name: &str) -> Result<PathBuf, AppError> {
    let dir = root.join(validate_name(name)?);
    if !dir.is_dir() {
        return Err(AppError::NotFound(format!("folder {}", name)));
    }
    Ok(dir)
}

/// Creates `root/<timestamp>`, adding `_1`, `_2`, ... when the second is already taken.
pub fn create_timestamp_dir(root: &Path) -> Result<(String, PathBuf), AppError> {
    let base = Local::now().format(FOLDER_TIMESTAMP).to_string();
    create_unique_dir(root, &base)
}

pub fn create_unique_dir(root: &Path, base: &str) -> Result<(String, PathBuf), AppError> {
    std::fs::create_dir_all(root)?;
    let mut counter = 0;
    loop {
        let name = if counter == 0 {
            base.to_string()
        } else {
            format!("{}_{}", base, counter)
        };
        let dir = root.join(&name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((name, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Sorted names of the sub-directories of `root`.
pub fn list_dirs(root: &Path) -> Result<Vec<String>, AppError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// `attachment; filename*=UTF-8''...` with the name percent-encoded.
pub fn content_disposition(file_name: &str) -> String {
    let mut encoded = String::with_capacity(file_name.len() * 3);
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("attachment; filename*=UTF-8''{}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_and_separators_are_rejected() {
        assert!(validate_name("20240101_101010").is_ok());
        assert!(validate_name("검토 규칙 2024").is_ok());
        assert!(matches!(validate_name(".."), Err(AppError::InvalidInput(_))));
        assert!(matches!(validate_name("a/b"), Err(AppError::InvalidInput(_))));
        assert!(matches!(validate_name("a\\b"), Err(AppError::InvalidInput(_))));
        assert!(matches!(validate_name("  "), Err(AppError::MissingRequiredField(_))));
    }

    #[test]
    fn file_names_keep_only_the_last_component() {
        assert_eq!(sanitize_file_name("folder/증빙.pdf").unwrap(), "증빙.pdf");
        assert_eq!(sanitize_file_name("C:\\x\\a.xlsx").unwrap(), "a.xlsx");
        assert!(sanitize_file_name("dir/").is_err());
    }

    #[test]
    fn colliding_directories_get_suffixes() {
        let root = tempfile::tempdir().unwrap();
        let (first, _) = create_unique_dir(root.path(), "20240101_000000").unwrap();
        let (second, _) = create_unique_dir(root.path(), "20240101_000000").unwrap();
        let (third, _) = create_unique_dir(root.path(), "20240101_000000").unwrap();
        assert_eq!(first, "20240101_000000");
        assert_eq!(second, "20240101_000000_1");
        assert_eq!(third, "20240101_000000_2");
        assert_eq!(list_dirs(root.path()).unwrap(), vec![first, second, third]);
    }

    #[test]
    fn missing_dir_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(existing_dir(root.path(), "nope"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn disposition_percent_encodes_utf8() {
        assert_eq!(
            content_disposition("검토.xlsx"),
            "attachment; filename*=UTF-8''%EA%B2%80%ED%86%A0.xlsx"
        );
    }
}
