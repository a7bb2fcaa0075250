//! # Evidence Hashing
//!
//! `FileHash` records are computed from the bytes on disk at the moment a
//! file is materialised. Sizes reported by archives or installers are never
//! trusted.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AnalysisError, Result};

const HASH_BUF_SIZE: usize = 1024 * 1024;

/// Container/executable kind sniffed from leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Zip,
    /// OLE compound document (MSI packages use this container)
    Ole,
    /// MZ executable (EXE or DLL)
    Pe,
    Text,
    Unknown,
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

impl FileKind {
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(ZIP_MAGIC) || head.starts_with(ZIP_EMPTY_MAGIC) {
            FileKind::Zip
        } else if head.starts_with(OLE_MAGIC) {
            FileKind::Ole
        } else if head.starts_with(b"MZ") {
            FileKind::Pe
        } else if !head.is_empty()
            && head
                .iter()
                .all(|b| matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7E))
        {
            FileKind::Text
        } else {
            FileKind::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHash {
    pub path: PathBuf,
    pub sha256: String,
    pub md5: String,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
    /// Role of the file in the chain (`sample`, `installer`, `component`, ...)
    pub file_type: String,
    pub detected: FileKind,
}

impl FileHash {
    pub fn from_file(path: &Path, file_type: &str) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AnalysisError::Validation(format!("file not found: {}", path.display()))
            } else {
                AnalysisError::Io(err)
            }
        })?;
        if !meta.is_file() {
            return Err(AnalysisError::Validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let mut file = File::open(path)?;
        let mut sha256 = Sha256::new();
        let mut md5 = md5::Context::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut head = Vec::with_capacity(16);
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if head.len() < 16 {
                let take = (16 - head.len()).min(n);
                head.extend_from_slice(&buf[..take]);
            }
            sha256.update(&buf[..n]);
            md5.consume(&buf[..n]);
            size += n as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            sha256: hex::encode(sha256.finalize()),
            md5: format!("{:x}", md5.compute()),
            size,
            modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
            file_type: file_type.to_string(),
            detected: FileKind::sniff(&head),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_content() {
        assert_eq!(
            sha256_hex(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn file_hash_reads_actual_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"MZ\x90\x00payload").expect("write");
        let hash = FileHash::from_file(&path, "component").expect("hash");
        assert_eq!(hash.size, 11);
        assert_eq!(hash.sha256, sha256_hex(b"MZ\x90\x00payload"));
        assert_eq!(hash.detected, FileKind::Pe);
        assert_eq!(hash.file_type, "component");
        assert!(hash.modified_time.is_some());
    }

    #[test]
    fn missing_file_is_validation_error() {
        let err = FileHash::from_file(Path::new("/nonexistent/droptrace"), "sample").unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
    }

    #[test]
    fn sniffs_containers() {
        assert_eq!(FileKind::sniff(b"PK\x03\x04rest"), FileKind::Zip);
        assert_eq!(FileKind::sniff(OLE_MAGIC), FileKind::Ole);
        assert_eq!(FileKind::sniff(b"aGVsbG8="), FileKind::Text);
        assert_eq!(FileKind::sniff(&[0u8, 1, 2]), FileKind::Unknown);
    }
}
