//! # Reports
//!
//! Persists a finished [`SampleMetadata`] as a JSON analysis document and
//! renders the human-readable report printed after a single analysis.
//! [`JsonlSink`] appends one JSON record per line for batch runs.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::evidence::FileHash;
use crate::pipeline::{
    ComponentInfo, InstallerInfo, NetworkStatus, SampleMetadata, StageResult, ThreatLevel,
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct SampleInfo<'a> {
    name: &'a str,
    path: &'a Path,
    size: u64,
    sha256: Option<&'a str>,
    md5: Option<&'a str>,
}

#[derive(Serialize)]
struct SessionInfo<'a> {
    session_id: &'a str,
    analysis_start: DateTime<Utc>,
    analysis_end: Option<DateTime<Utc>>,
    total_duration: Option<f64>,
}

#[derive(Serialize)]
struct FileAnalysis<'a> {
    extracted_files: &'a [FileHash],
    installer_info: Option<&'a InstallerInfo>,
    component_info: Option<&'a ComponentInfo>,
    file_hashes: &'a BTreeMap<String, FileHash>,
    payload_executable: Option<&'a Path>,
}

#[derive(Serialize)]
struct ContentAnalysis<'a> {
    strings_count: usize,
    strings_file: Option<&'a Path>,
    urls_found: &'a [String],
    cnc_url: Option<&'a str>,
    download_url: Option<&'a str>,
}

#[derive(Serialize)]
struct AssessmentSection<'a> {
    threat_level: ThreatLevel,
    malware_family: Option<&'a str>,
    summary: Option<&'a str>,
    complete: bool,
}

/// The persisted analysis document.
#[derive(Serialize)]
pub struct AnalysisReport<'a> {
    tool_version: &'a str,
    config_hash: &'a str,
    generated_at: DateTime<Utc>,
    sample_info: SampleInfo<'a>,
    session_info: SessionInfo<'a>,
    file_analysis: FileAnalysis<'a>,
    content_analysis: ContentAnalysis<'a>,
    network_analysis: &'a NetworkStatus,
    processing_stages: &'a [StageResult],
    assessment: AssessmentSection<'a>,
}

fn total_duration(meta: &SampleMetadata) -> Option<f64> {
    let end = meta.end_time?;
    (end - meta.start_time).to_std().ok().map(|d| d.as_secs_f64())
}

impl<'a> AnalysisReport<'a> {
    pub fn new(meta: &'a SampleMetadata, tool_version: &'a str, config_hash: &'a str) -> Self {
        let hash = meta.sample_hash.as_ref();
        Self {
            tool_version,
            config_hash,
            generated_at: Utc::now(),
            sample_info: SampleInfo {
                name: &meta.sample_name,
                path: &meta.sample_path,
                size: meta.sample_size,
                sha256: hash.map(|h| h.sha256.as_str()),
                md5: hash.map(|h| h.md5.as_str()),
            },
            session_info: SessionInfo {
                session_id: &meta.session_id,
                analysis_start: meta.start_time,
                analysis_end: meta.end_time,
                total_duration: total_duration(meta),
            },
            file_analysis: FileAnalysis {
                extracted_files: &meta.extracted_files,
                installer_info: meta.installer_info.as_ref(),
                component_info: meta.component_info.as_ref(),
                file_hashes: &meta.file_hashes,
                payload_executable: meta.payload_executable.as_deref(),
            },
            content_analysis: ContentAnalysis {
                strings_count: meta.strings_count,
                strings_file: meta.strings_file.as_deref(),
                urls_found: meta.urls.as_slice(),
                cnc_url: meta.cnc_url.as_deref(),
                download_url: meta.download_url.as_deref(),
            },
            network_analysis: &meta.network_status,
            processing_stages: &meta.stage_results,
            assessment: AssessmentSection {
                threat_level: meta.threat_level,
                malware_family: meta.malware_family.as_deref(),
                summary: meta.analysis_summary.as_deref(),
                complete: meta.is_complete(),
            },
        }
    }
}

pub fn report_path(output_dir: &Path, meta: &SampleMetadata) -> PathBuf {
    output_dir.join(format!("{}_analysis.json", meta.sample_stem()))
}

/// Write `<sample>_analysis.json` into `output_dir`.
pub fn write_report(
    meta: &SampleMetadata,
    output_dir: &Path,
    tool_version: &str,
    config_hash: &str,
) -> Result<PathBuf, ReportError> {
    std::fs::create_dir_all(output_dir)?;
    let path = report_path(output_dir, meta);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, &AnalysisReport::new(meta, tool_version, config_hash))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(path)
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Banner-style report printed by `analyze`.
pub fn render_text_report(meta: &SampleMetadata) -> String {
    let rule = "=".repeat(60);
    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "MALWARE ANALYSIS REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Sample: {}", meta.sample_name);
    let _ = writeln!(
        out,
        "SHA256: {}",
        meta.sample_hash
            .as_ref()
            .map(|h| h.sha256.as_str())
            .unwrap_or("N/A")
    );
    let _ = writeln!(out, "Size: {} bytes", group_thousands(meta.sample_size));
    let _ = writeln!(out, "Session ID: {}", meta.session_id);
    match total_duration(meta) {
        Some(secs) => {
            let _ = writeln!(out, "Analysis Time: {secs:.1}s");
        }
        None => {
            let _ = writeln!(out, "Analysis Time: N/A");
        }
    }

    let _ = writeln!(out, "\nFILE HASHES:\n{}", "-".repeat(15));
    for (key, hash) in &meta.file_hashes {
        let _ = writeln!(out, "{}: {}", key.to_uppercase(), hash.sha256);
    }

    let _ = writeln!(out, "\nANALYSIS RESULTS:\n{}", "-".repeat(20));
    if let Some(component) = &meta.component_info {
        let _ = writeln!(out, "Malware DLL: {}", component.binary_key);
        let _ = writeln!(out, "DLL Size: {} bytes", group_thousands(component.size));
        let _ = writeln!(out, "DLL SHA256: {}", component.sha256);
    }
    if meta.strings_count > 0 {
        let _ = writeln!(
            out,
            "Strings Extracted: {}",
            group_thousands(meta.strings_count as u64)
        );
    }
    if !meta.urls.is_empty() {
        let _ = writeln!(out, "URLs Found: {}", meta.urls.len());
    }
    if let Some(cnc) = &meta.cnc_url {
        let _ = writeln!(out, "C&C Server: {cnc}");
    }
    if let Some(url) = &meta.download_url {
        let _ = writeln!(out, "Download URL: {url}");
    }
    if let Some(exe) = &meta.payload_executable {
        let _ = writeln!(out, "Payload: {}", exe.display());
    }
    for failed in meta.failed_stages() {
        let _ = writeln!(
            out,
            "Failed stage {}: {}",
            failed.stage,
            failed.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let _ = writeln!(out, "\nTHREAT ASSESSMENT:\n{}", "-".repeat(20));
    let _ = writeln!(
        out,
        "Threat Level: {}",
        meta.threat_level.as_str().to_uppercase()
    );
    let _ = writeln!(
        out,
        "Malware Family: {}",
        meta.malware_family.as_deref().unwrap_or("Unknown")
    );
    let _ = writeln!(out, "\nSUMMARY:\n{}", "-".repeat(10));
    let _ = writeln!(out, "{}", meta.analysis_summary.as_deref().unwrap_or(""));
    out.push_str(&rule);
    out
}

/// Appends serialisable records to a JSON Lines file.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, ReportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record<T: Serialize>(&self, record: &T) -> Result<(), ReportError> {
        let mut guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *guard, record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ReportError> {
        let mut guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.flush()?;
        Ok(())
    }
}
