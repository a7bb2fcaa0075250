//! # Batch Events
//!
//! Records sent from the analysis workers to the results writer thread.

use std::path::PathBuf;

use serde::Serialize;

use crate::pipeline::ThreatLevel;

/// One line of `batch_results.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub sample: PathBuf,
    pub session_id: Option<String>,
    /// The processor returned a report (stages may still have failed)
    pub processed: bool,
    /// Every stage that ran succeeded
    pub complete: bool,
    pub stages_run: usize,
    pub stages_successful: usize,
    pub threat_level: Option<ThreatLevel>,
    pub malware_family: Option<String>,
    pub cnc_url: Option<String>,
    pub download_url: Option<String>,
    pub report_path: Option<PathBuf>,
    pub error: Option<String>,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub enum BatchEvent {
    /// A sample finished, successfully or not
    Sample(BatchRecord),
    /// Flush buffered records to disk
    Flush,
}
