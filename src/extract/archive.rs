use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};
use crate::evidence::FileHash;

/// Unpack a ZIP container into `output_dir` and hash every file written.
///
/// Entries whose names escape `output_dir` (absolute paths, `..`) are
/// skipped with a warning.
pub fn extract_archive(archive_path: &Path, output_dir: &Path) -> Result<Vec<FileHash>> {
    let file = File::open(archive_path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AnalysisError::Validation(format!("archive not found: {}", archive_path.display()))
        } else {
            AnalysisError::Io(err)
        }
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| {
        AnalysisError::Extraction(format!(
            "{} is not a valid zip archive: {err}",
            archive_path.display()
        ))
    })?;

    std::fs::create_dir_all(output_dir).map_err(|err| {
        AnalysisError::Extraction(format!(
            "cannot create output directory {}: {err}",
            output_dir.display()
        ))
    })?;

    let hashes = extract_entries(&mut archive, output_dir)?;
    info!(
        "extracted archive={} files={} dest={}",
        archive_path.display(),
        hashes.len(),
        output_dir.display()
    );
    Ok(hashes)
}

fn extract_entries<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    output_dir: &Path,
) -> Result<Vec<FileHash>> {
    let mut hashes = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let outpath = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut outfile = File::create(&outpath)?;
        let written = std::io::copy(&mut entry, &mut outfile).map_err(|err| {
            AnalysisError::Extraction(format!("failed to extract {}: {err}", entry.name()))
        })?;
        if written != entry.size() {
            debug!(
                "entry {} declared {} bytes, wrote {}",
                entry.name(),
                entry.size(),
                written
            );
        }
        drop(outfile);

        hashes.push(FileHash::from_file(&outpath, "extracted")?);
    }

    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish").into_inner()
    }

    #[test]
    fn extracts_nested_entries_and_hashes_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_path = dir.path().join("sample.zip");
        std::fs::write(
            &zip_path,
            build_zip(&[("setup.msi", b"installer"), ("docs/readme.txt", b"hello")]),
        )
        .expect("write zip");

        let out = dir.path().join("out");
        let hashes = extract_archive(&zip_path, &out).expect("extract");
        assert_eq!(hashes.len(), 2);
        assert!(out.join("setup.msi").is_file());
        assert!(out.join("docs/readme.txt").is_file());
        let readme = hashes
            .iter()
            .find(|h| h.path.ends_with("readme.txt"))
            .expect("readme hash");
        assert_eq!(readme.size, 5);
    }

    #[test]
    fn rejects_non_zip_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fake.zip");
        std::fs::write(&path, b"definitely not a zip").expect("write");
        let err = extract_archive(&path, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, AnalysisError::Extraction(_)));
    }

    #[test]
    fn skips_path_traversal_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_path = dir.path().join("evil.zip");
        std::fs::write(
            &zip_path,
            build_zip(&[("../escape.txt", b"nope"), ("ok.txt", b"fine")]),
        )
        .expect("write zip");
        let out = dir.path().join("out");
        let hashes = extract_archive(&zip_path, &out).expect("extract");
        assert_eq!(hashes.len(), 1);
        assert!(!dir.path().join("escape.txt").exists());
    }
}
