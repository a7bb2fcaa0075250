//! # Sample Processor
//!
//! Drives one sample through the pipeline, writes its report and decides
//! what happens to the session workspace afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::payload::PayloadFetcher;
use crate::pipeline::{AnalysisPipeline, PipelineContext, SampleMetadata};
use crate::report::write_report;
use crate::session::{CleanupOutcome, cleanup_session, create_debug_marker};

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceAction {
    Removed,
    Kept { reason: String, marker: PathBuf },
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub metadata: SampleMetadata,
    pub report_path: PathBuf,
    pub workspace: WorkspaceAction,
}

pub struct SampleProcessor {
    config: Config,
    config_hash: String,
    pipeline: AnalysisPipeline,
}

impl SampleProcessor {
    pub fn new(config: Config, config_hash: String) -> Result<Self> {
        let pipeline = AnalysisPipeline::new(&config).context("building analysis pipeline")?;
        Ok(Self {
            config,
            config_hash,
            pipeline,
        })
    }

    pub fn with_fetcher(config: Config, config_hash: String, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        let pipeline = AnalysisPipeline::with_fetcher(&config, fetcher);
        Self {
            config,
            config_hash,
            pipeline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Analyse `sample`, write `<sample>_analysis.json` and apply the
    /// workspace policy: a fully successful run is cleaned up unless
    /// `keep_temp` is set; anything else keeps the workspace behind a debug
    /// marker.
    pub fn process(&self, sample: &Path, keep_temp: bool) -> Result<ProcessOutcome> {
        info!("processing sample={}", sample.display());
        let ctx = PipelineContext::new(sample, &self.config)
            .with_context(|| format!("preparing analysis of {}", sample.display()))?;

        let metadata = self.pipeline.execute(ctx);
        let report_path = write_report(
            &metadata,
            &self.config.paths.output_dir,
            TOOL_VERSION,
            &self.config_hash,
        )
        .context("writing analysis report")?;
        info!("analysis results saved to {}", report_path.display());

        let workspace = self.settle_workspace(&metadata, keep_temp)?;
        Ok(ProcessOutcome {
            metadata,
            report_path,
            workspace,
        })
    }

    fn settle_workspace(&self, metadata: &SampleMetadata, keep_temp: bool) -> Result<WorkspaceAction> {
        let temp_root = &self.config.paths.temp_dir;
        let session = &metadata.session_id;
        let ok = metadata.successful_stages();
        let total = metadata.stages_run();

        let reason = if keep_temp {
            "keep_temp requested".to_string()
        } else if ok == total {
            return match cleanup_session(temp_root, session, false)
                .with_context(|| format!("cleaning up session {session}"))?
            {
                CleanupOutcome::KeptDebugMarker => Ok(WorkspaceAction::Kept {
                    reason: "debug marker present".to_string(),
                    marker: temp_root.join(session).join(".debug"),
                }),
                CleanupOutcome::Removed | CleanupOutcome::Missing => {
                    info!("cleaned up temporary files for session={session}");
                    Ok(WorkspaceAction::Removed)
                }
            };
        } else {
            format!("analysis incomplete: {ok}/{total} stages successful")
        };

        if !temp_root.join(session).is_dir() {
            warn!("session={session} has no workspace to keep");
            return Ok(WorkspaceAction::Removed);
        }
        let marker = create_debug_marker(temp_root, session, &reason)
            .with_context(|| format!("marking session {session}"))?;
        Ok(WorkspaceAction::Kept { reason, marker })
    }
}
