use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::error::{AnalysisError, Result};
use crate::evidence::FileHash;
use crate::pipeline::assessment::{Assessment, ThreatLevel};
use crate::pipeline::{StageId, StageOutcome, StageResult};
use crate::session::{SessionLayout, generate_session_id};
use crate::strings::UrlSet;

#[derive(Debug, Clone, Serialize)]
pub struct InstallerInfo {
    pub path: PathBuf,
    pub script_path: PathBuf,
    pub extract_dir: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentInfo {
    pub binary_key: String,
    pub entry_point: String,
    pub action_id: Option<String>,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub md5: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub attempted: bool,
    pub success: bool,
    pub from_cache: bool,
}

/// Everything learned about one sample.
///
/// Collections only grow and scalar findings are set at most once; the
/// context applies stage deltas under those rules.
#[derive(Debug, Clone, Serialize)]
pub struct SampleMetadata {
    pub sample_path: PathBuf,
    pub sample_name: String,
    pub sample_size: u64,
    pub sample_hash: Option<FileHash>,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub extracted_files: Vec<FileHash>,
    pub file_hashes: BTreeMap<String, FileHash>,
    pub installer_info: Option<InstallerInfo>,
    pub component_info: Option<ComponentInfo>,
    pub strings_count: usize,
    pub strings_file: Option<PathBuf>,
    pub urls: UrlSet,
    pub cnc_url: Option<String>,
    pub download_url: Option<String>,
    pub network_status: NetworkStatus,
    pub payload_executable: Option<PathBuf>,
    pub stage_results: Vec<StageResult>,
    pub threat_level: ThreatLevel,
    pub malware_family: Option<String>,
    pub analysis_summary: Option<String>,
}

impl SampleMetadata {
    fn new(sample_path: &Path, session_id: &str) -> Self {
        Self {
            sample_path: sample_path.to_path_buf(),
            sample_name: sample_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            sample_size: 0,
            sample_hash: None,
            session_id: session_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            extracted_files: Vec::new(),
            file_hashes: BTreeMap::new(),
            installer_info: None,
            component_info: None,
            strings_count: 0,
            strings_file: None,
            urls: UrlSet::new(),
            cnc_url: None,
            download_url: None,
            network_status: NetworkStatus::default(),
            payload_executable: None,
            stage_results: Vec::new(),
            threat_level: ThreatLevel::Unknown,
            malware_family: None,
            analysis_summary: None,
        }
    }

    /// File stem used to name reports.
    pub fn sample_stem(&self) -> String {
        Path::new(&self.sample_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.sample_name.clone())
    }

    pub fn stages_run(&self) -> usize {
        self.stage_results.iter().filter(|r| r.ran()).count()
    }

    pub fn successful_stages(&self) -> usize {
        self.stage_results.iter().filter(|r| r.success).count()
    }

    pub fn failed_stages(&self) -> Vec<&StageResult> {
        self.stage_results.iter().filter(|r| r.ran() && !r.success).collect()
    }

    /// True when every stage that ran completed successfully.
    pub fn is_complete(&self) -> bool {
        self.failed_stages().is_empty()
    }
}

/// Changes a stage asks the context to apply to the sample metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataDelta {
    pub sample_hash: Option<FileHash>,
    pub extracted_files: Vec<FileHash>,
    pub file_hashes: Vec<(String, FileHash)>,
    pub installer_info: Option<InstallerInfo>,
    pub component_info: Option<ComponentInfo>,
    pub strings_count: Option<usize>,
    pub strings_file: Option<PathBuf>,
    pub urls: Vec<String>,
    pub cnc_url: Option<String>,
    pub download_url: Option<String>,
    pub network_status: Option<NetworkStatus>,
    pub payload_executable: Option<PathBuf>,
    pub assessment: Option<Assessment>,
    pub end_time: Option<DateTime<Utc>>,
}

fn assign_once<T>(slot: &mut Option<T>, value: Option<T>, field: &str) {
    let Some(value) = value else {
        return;
    };
    if slot.is_some() {
        warn!("ignoring second assignment of {field}");
        return;
    }
    *slot = Some(value);
}

/// Per-sample execution state. Owned by exactly one pipeline run.
#[derive(Debug)]
pub struct PipelineContext {
    layout: SessionLayout,
    output_dir: PathBuf,
    metadata: SampleMetadata,
}

impl PipelineContext {
    /// New context with a fresh session id under `config.paths.temp_dir`.
    pub fn new(sample_path: &Path, config: &Config) -> Result<Self> {
        Self::with_session(sample_path, config, &generate_session_id())
    }

    pub fn with_session(sample_path: &Path, config: &Config, session_id: &str) -> Result<Self> {
        if !sample_path.is_file() {
            return Err(AnalysisError::Validation(format!(
                "sample not found: {}",
                sample_path.display()
            )));
        }
        Ok(Self {
            layout: SessionLayout::new(&config.paths.temp_dir, session_id),
            output_dir: config.paths.output_dir.clone(),
            metadata: SampleMetadata::new(sample_path, session_id),
        })
    }

    pub fn sample_path(&self) -> &Path {
        &self.metadata.sample_path
    }

    pub fn session_id(&self) -> &str {
        &self.layout.session_id
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn metadata(&self) -> &SampleMetadata {
        &self.metadata
    }

    pub fn result(&self, id: StageId) -> Option<&StageResult> {
        self.metadata.stage_results.iter().find(|r| r.stage == id)
    }

    pub fn succeeded(&self, id: StageId) -> bool {
        self.result(id).is_some_and(|r| r.success)
    }

    pub fn prerequisites_met(&self, id: StageId) -> bool {
        id.prerequisites().iter().all(|&p| self.succeeded(p))
    }

    /// Append a stage result and merge its delta. The only mutation path
    /// for the sample metadata.
    pub fn record(&mut self, outcome: StageOutcome) {
        let StageOutcome { result, delta } = outcome;
        let meta = &mut self.metadata;

        if let Some(hash) = delta.sample_hash {
            meta.sample_size = hash.size;
            assign_once(&mut meta.sample_hash, Some(hash), "sample_hash");
        }
        meta.extracted_files.extend(delta.extracted_files);
        for (key, hash) in delta.file_hashes {
            if meta.file_hashes.contains_key(&key) {
                warn!("ignoring duplicate file hash key={key}");
                continue;
            }
            meta.file_hashes.insert(key, hash);
        }
        assign_once(&mut meta.installer_info, delta.installer_info, "installer_info");
        assign_once(&mut meta.component_info, delta.component_info, "component_info");
        if let Some(count) = delta.strings_count {
            meta.strings_count += count;
        }
        assign_once(&mut meta.strings_file, delta.strings_file, "strings_file");
        for url in delta.urls {
            meta.urls.insert(url);
        }
        assign_once(&mut meta.cnc_url, delta.cnc_url, "cnc_url");
        assign_once(&mut meta.download_url, delta.download_url, "download_url");
        if let Some(status) = delta.network_status {
            meta.network_status = status;
        }
        assign_once(
            &mut meta.payload_executable,
            delta.payload_executable,
            "payload_executable",
        );
        if let Some(assessment) = delta.assessment {
            if meta.analysis_summary.is_none() {
                meta.threat_level = assessment.threat_level;
                meta.malware_family = Some(assessment.malware_family);
                meta.analysis_summary = Some(assessment.summary);
            } else {
                warn!("ignoring second assessment");
            }
        }
        assign_once(&mut meta.end_time, delta.end_time, "end_time");

        meta.stage_results.push(result);
    }

    pub fn into_metadata(self) -> SampleMetadata {
        self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    fn context(dir: &Path) -> PipelineContext {
        let cfg = load_config(None).expect("config").config.rooted_at(dir);
        let sample = dir.join("dropper.zip");
        std::fs::write(&sample, b"x").expect("write");
        PipelineContext::new(&sample, &cfg).expect("context")
    }

    #[test]
    fn missing_sample_is_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(None).expect("config").config.rooted_at(dir.path());
        let err = PipelineContext::new(&dir.path().join("nope.zip"), &cfg).unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
    }

    #[test]
    fn scalars_are_assigned_once_and_urls_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = context(dir.path());
        assert_eq!(ctx.metadata().sample_stem(), "dropper");

        let first = MetadataDelta {
            cnc_url: Some("http://a:5050/index.php".to_string()),
            urls: vec!["http://a:5050/index.php".to_string()],
            ..MetadataDelta::default()
        };
        let second = MetadataDelta {
            cnc_url: Some("http://b:5050/index.php".to_string()),
            urls: vec![
                "http://b:5050/index.php".to_string(),
                "http://a:5050/index.php".to_string(),
            ],
            ..MetadataDelta::default()
        };
        ctx.record(StageOutcome {
            result: StageResult::skipped(StageId::AnalyzeUrls, "test"),
            delta: first,
        });
        ctx.record(StageOutcome {
            result: StageResult::skipped(StageId::Finalize, "test"),
            delta: second,
        });

        let meta = ctx.into_metadata();
        assert_eq!(meta.cnc_url.as_deref(), Some("http://a:5050/index.php"));
        assert_eq!(meta.urls.len(), 2);
        assert_eq!(meta.stage_results.len(), 2);
        assert_eq!(meta.stages_run(), 0);
        assert!(meta.is_complete());
    }
}
