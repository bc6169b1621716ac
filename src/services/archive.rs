use crate::error::AppError;
use std::io::{Cursor, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Unpacks a zip bundle into `dest`, returning the number of entries.
/// Entries whose paths would escape `dest` fail the whole extraction.
pub fn extract_zip(data: &[u8], dest: &Path) -> Result<usize, AppError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if entry.enclosed_name().is_none() {
            return Err(AppError::Archive(format!("entry {} escapes the target folder", entry.name())));
        }
    }
    std::fs::create_dir_all(dest)?;
    archive.extract(dest)?;
    tracing::info!("Extracted {} entries into {}", archive.len(), dest.display());
    Ok(archive.len())
}

/// Packs every file below `dir` into an in-memory zip, paths relative to `dir`.
pub fn zip_dir(dir: &Path) -> Result<Vec<u8>, AppError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| AppError::Archive(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        zip.write_all(&std::fs::read(entry.path())?)?;
        files += 1;
    }

    let bytes = zip.finish()?.into_inner();
    tracing::info!("Zipped {} files from {} ({}KB)", files, dir.display(), bytes.len() / 1024);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_and_extract_preserve_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("증빙/1월")).unwrap();
        std::fs::write(src.path().join("metadata.json"), "{}").unwrap();
        std::fs::write(src.path().join("증빙/1월/receipt.txt"), "영수증").unwrap();

        let bytes = zip_dir(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let entries = extract_zip(&bytes, dest.path()).unwrap();
        assert_eq!(entries, 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("증빙/1월/receipt.txt")).unwrap(),
            "영수증"
        );
        assert!(dest.path().join("metadata.json").is_file());
    }

    #[test]
    fn non_zip_payload_is_an_archive_error() {
        let dest = tempfile::tempdir().unwrap();
        let err = extract_zip(b"plain text", dest.path()).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
    }

    #[test]
    fn entries_outside_the_target_fail_the_whole_extraction() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("ok.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"ok").unwrap();
        zip.start_file("../evil.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"evil").unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("attachments");
        let err = extract_zip(&bytes, &dest).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
        assert!(!root.path().join("evil.txt").exists());
        assert!(!dest.join("ok.txt").exists());
    }
}
