//! # Pipeline Module
//!
//! Runs the fixed sequence of analysis stages against one sample.
//!
//! Stages never fail the pipeline. Each stage first checks its
//! prerequisites against the results already recorded in the context; a
//! stage whose prerequisites are unmet is recorded as `Skipped`. A stage
//! that runs and errors (or panics) is recorded as `Failed`, and the
//! pipeline moves on. Only [`PipelineContext::record`] mutates the sample
//! metadata.

pub mod assessment;
pub mod context;
pub mod stages;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, info_span, warn};

use crate::config::Config;
use crate::error::{AnalysisError, ErrorKind, Result};
use crate::payload::{HttpFetcher, PayloadFetcher};

pub use assessment::{Assessment, ThreatLevel, assess};
pub use context::{
    ComponentInfo, InstallerInfo, MetadataDelta, NetworkStatus, PipelineContext, SampleMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Initialize,
    ExtractArchive,
    ExtractInstaller,
    ExtractComponent,
    AnalyzeStrings,
    AnalyzeUrls,
    ProcessSecondaryPayload,
    Finalize,
}

/// Execution order of a full pipeline.
pub const STAGE_ORDER: [StageId; 8] = [
    StageId::Initialize,
    StageId::ExtractArchive,
    StageId::ExtractInstaller,
    StageId::ExtractComponent,
    StageId::AnalyzeStrings,
    StageId::AnalyzeUrls,
    StageId::ProcessSecondaryPayload,
    StageId::Finalize,
];

impl StageId {
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Initialize => "initialize",
            StageId::ExtractArchive => "extract_archive",
            StageId::ExtractInstaller => "extract_installer",
            StageId::ExtractComponent => "extract_component",
            StageId::AnalyzeStrings => "analyze_strings",
            StageId::AnalyzeUrls => "analyze_urls",
            StageId::ProcessSecondaryPayload => "process_secondary_payload",
            StageId::Finalize => "finalize",
        }
    }

    /// Stages that must have completed successfully before this one may run.
    pub fn prerequisites(self) -> &'static [StageId] {
        match self {
            StageId::Initialize | StageId::Finalize => &[],
            StageId::ExtractArchive => &[StageId::Initialize],
            StageId::ExtractInstaller => &[StageId::ExtractArchive],
            StageId::ExtractComponent => &[StageId::ExtractInstaller],
            StageId::AnalyzeStrings => &[StageId::ExtractComponent],
            StageId::AnalyzeUrls => &[StageId::AnalyzeStrings],
            StageId::ProcessSecondaryPayload => &[StageId::AnalyzeUrls],
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// Outcome of one stage. Never modified after it is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub metadata: Map<String, Value>,
    pub artifacts: Vec<PathBuf>,
}

impl StageResult {
    pub fn skipped(stage: StageId, reason: &str) -> Self {
        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), Value::from(reason));
        Self {
            stage,
            status: StageStatus::Skipped,
            start_time: now,
            end_time: now,
            duration_secs: 0.0,
            success: false,
            error_message: None,
            error_kind: None,
            metadata,
            artifacts: Vec::new(),
        }
    }

    /// Whether this stage actually ran (completed or failed).
    pub fn ran(&self) -> bool {
        self.status != StageStatus::Skipped
    }
}

/// What a stage body produces on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub metadata: Map<String, Value>,
    pub artifacts: Vec<PathBuf>,
    pub delta: MetadataDelta,
}

impl StageOutput {
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }
}

/// A recorded result plus the metadata changes it carries.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub result: StageResult,
    pub delta: MetadataDelta,
}

/// One unit of pipeline work.
pub trait PipelineStage: Send + Sync {
    fn id(&self) -> StageId;

    fn can_execute(&self, ctx: &PipelineContext) -> bool {
        ctx.prerequisites_met(self.id())
    }

    /// Stage body. Reads the context and returns what it produced.
    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput>;

    /// Run the body and convert errors and panics into a failed result.
    fn execute(&self, ctx: &PipelineContext) -> StageOutcome {
        let stage = self.id();
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(ctx)))
            .unwrap_or_else(|panic| Err(panic_error(panic)));
        let duration_secs = started.elapsed().as_secs_f64();
        let end_time = Utc::now();

        match outcome {
            Ok(output) => StageOutcome {
                result: StageResult {
                    stage,
                    status: StageStatus::Completed,
                    start_time,
                    end_time,
                    duration_secs,
                    success: true,
                    error_message: None,
                    error_kind: None,
                    metadata: output.metadata,
                    artifacts: output.artifacts,
                },
                delta: output.delta,
            },
            Err(err) => {
                error!("stage={stage} failed: {err}");
                StageOutcome {
                    result: StageResult {
                        stage,
                        status: StageStatus::Failed,
                        start_time,
                        end_time,
                        duration_secs,
                        success: false,
                        error_message: Some(err.to_string()),
                        error_kind: Some(err.kind()),
                        metadata: Map::new(),
                        artifacts: Vec::new(),
                    },
                    delta: MetadataDelta::default(),
                }
            }
        }
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> AnalysisError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    AnalysisError::Extraction(format!("stage panicked: {message}"))
}

/// Ordered stage list applied to one context at a time.
pub struct AnalysisPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl AnalysisPipeline {
    /// Full pipeline with a real HTTP fetcher built from `config.network`.
    pub fn new(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(&config.network)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: &Config, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        Self::from_stages(stages::default_stages(config, fetcher))
    }

    pub fn from_stages(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    /// Run every stage in order and return the finished metadata.
    pub fn execute(&self, mut ctx: PipelineContext) -> SampleMetadata {
        info!(
            "pipeline start sample={} session={}",
            ctx.sample_path().display(),
            ctx.session_id()
        );

        for stage in &self.stages {
            let id = stage.id();
            let span = info_span!("stage", session = %ctx.session_id(), stage = %id);
            let _enter = span.enter();

            if !stage.can_execute(&ctx) {
                info!("skipping stage={id}");
                ctx.record(StageOutcome {
                    result: StageResult::skipped(id, "prerequisites not met"),
                    delta: MetadataDelta::default(),
                });
                continue;
            }

            info!("executing stage={id}");
            let outcome = stage.execute(&ctx);
            if outcome.result.success {
                info!(
                    "stage={id} completed duration_secs={:.3}",
                    outcome.result.duration_secs
                );
            } else if id == StageId::ProcessSecondaryPayload {
                warn!("stage={id} failed; continuing with partial results");
            }
            ctx.record(outcome);
        }

        let metadata = ctx.into_metadata();
        info!(
            "pipeline done session={} stages={} successful={}",
            metadata.session_id,
            metadata.stage_results.len(),
            metadata.successful_stages()
        );
        metadata
    }
}
