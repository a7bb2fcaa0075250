//! # String Extraction
//!
//! Printable-run extraction from binaries (single-byte and UTF-16LE) and the
//! URL classification built on top of it.

pub mod artifacts;
pub mod scan;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{AnalysisError, Result};

pub use artifacts::{UrlSet, find_cnc_url, find_download_url, find_urls};
pub use scan::scan_strings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    Ascii,
    Utf16Le,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedString {
    pub offset: u64,
    pub encoding: StringEncoding,
    pub text: String,
}

/// Strings pulled from one file plus the sidecar they were written to.
#[derive(Debug, Clone)]
pub struct StringDump {
    pub strings: Vec<ExtractedString>,
    pub sidecar: PathBuf,
}

impl StringDump {
    pub fn texts(&self) -> Vec<&str> {
        self.strings.iter().map(|s| s.text.as_str()).collect()
    }
}

/// `<file>.strings` next to the binary.
pub fn sidecar_path(file_path: &Path) -> PathBuf {
    let mut name = file_path.as_os_str().to_os_string();
    name.push(".strings");
    PathBuf::from(name)
}

/// Extract strings of at least `min_length` characters from `file_path` and
/// persist them, one per line, to the sidecar next to it.
pub fn extract_strings(file_path: &Path, min_length: usize) -> Result<StringDump> {
    extract_strings_to(file_path, min_length, &sidecar_path(file_path))
}

pub fn extract_strings_to(file_path: &Path, min_length: usize, output: &Path) -> Result<StringDump> {
    let data = std::fs::read(file_path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AnalysisError::Validation(format!("file not found: {}", file_path.display()))
        } else {
            AnalysisError::Io(err)
        }
    })?;
    let strings = scan_strings(&data, min_length);
    write_sidecar(&strings, output)?;
    info!(
        "extracted strings={} file={} sidecar={}",
        strings.len(),
        file_path.display(),
        output.display()
    );
    Ok(StringDump {
        strings,
        sidecar: output.to_path_buf(),
    })
}

pub fn write_sidecar(strings: &[ExtractedString], path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for s in strings {
        writer.write_all(s.text.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a sidecar back, skipping blank lines.
pub fn read_sidecar(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}
