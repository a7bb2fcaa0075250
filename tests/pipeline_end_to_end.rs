#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use droptrace::pipeline::{
    AnalysisPipeline, PipelineContext, STAGE_ORDER, SampleMetadata, StageId, StageStatus,
    ThreatLevel,
};

use common::{CNC_URL, ISO_URL, OfflineFetcher, StubFetcher};

fn status(meta: &SampleMetadata, id: StageId) -> StageStatus {
    meta.stage_results
        .iter()
        .find(|r| r.stage == id)
        .map(|r| r.status)
        .expect("stage result")
}

#[test]
fn full_chain_recovers_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = common::fake_decompiler(dir.path(), &[CNC_URL, ISO_URL, "https://benign.example/"], 0);
    let cfg = common::config_in(dir.path(), &tool);
    let sample = common::write_sample(dir.path(), "dropper.zip");
    let fetcher = StubFetcher::serving(common::disguised_iso(b"MZ final payload"));

    let pipeline = AnalysisPipeline::with_fetcher(&cfg, fetcher.clone());
    let ctx = PipelineContext::new(&sample, &cfg).expect("context");
    let layout = ctx.layout().clone();
    let meta = pipeline.execute(ctx);

    let ids: Vec<StageId> = meta.stage_results.iter().map(|r| r.stage).collect();
    assert_eq!(ids, STAGE_ORDER.to_vec());
    for result in &meta.stage_results {
        assert_eq!(result.status, StageStatus::Completed, "{}: {:?}", result.stage, result.error_message);
    }

    assert_eq!(meta.cnc_url.as_deref(), Some(CNC_URL));
    assert_eq!(meta.download_url.as_deref(), Some(ISO_URL));
    assert_eq!(meta.urls.len(), 3);
    assert!(meta.strings_count >= 4);

    let component = meta.component_info.as_ref().expect("component");
    assert_eq!(component.binary_key, "b.dll");
    assert!(component.path.starts_with(&layout.component_dir));
    assert!(meta.installer_info.is_some());

    let exe = meta.payload_executable.as_ref().expect("payload");
    assert_eq!(std::fs::read(exe).expect("read exe"), b"MZ final payload");
    assert!(exe.starts_with(cfg.paths.output_dir.join(&meta.session_id)));
    for key in ["sample", "installer", "component", "download", "decoded_zip", "executable"] {
        assert!(meta.file_hashes.contains_key(key), "missing hash {key}");
    }

    assert!(meta.network_status.attempted);
    assert!(meta.network_status.success);
    assert!(!meta.network_status.from_cache);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    assert_eq!(meta.threat_level, ThreatLevel::High);
    assert_eq!(meta.malware_family.as_deref(), Some("Grandoreiro"));
    let summary = meta.analysis_summary.as_deref().expect("summary");
    assert!(summary.contains("8/8 stages successful"), "{summary}");
    assert!(summary.ends_with(&format!("C&C server identified: {CNC_URL}")));
    assert!(meta.end_time.is_some());
}

#[test]
fn second_run_uses_payload_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = common::fake_decompiler(dir.path(), &[CNC_URL, ISO_URL], 0);
    let cfg = common::config_in(dir.path(), &tool);
    let sample = common::write_sample(dir.path(), "dropper.zip");
    let fetcher = StubFetcher::serving(common::disguised_iso(b"MZ cached"));
    let pipeline = AnalysisPipeline::with_fetcher(&cfg, fetcher.clone());

    let first = pipeline.execute(PipelineContext::new(&sample, &cfg).expect("context"));
    let second = pipeline.execute(PipelineContext::new(&sample, &cfg).expect("context"));

    assert_ne!(first.session_id, second.session_id);
    assert!(!first.network_status.from_cache);
    assert!(second.network_status.from_cache);
    assert!(second.network_status.success);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn download_failure_is_not_critical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = common::fake_decompiler(dir.path(), &[CNC_URL, ISO_URL], 0);
    let cfg = common::config_in(dir.path(), &tool);
    let sample = common::write_sample(dir.path(), "dropper.zip");

    let pipeline = AnalysisPipeline::with_fetcher(&cfg, Arc::new(OfflineFetcher));
    let meta = pipeline.execute(PipelineContext::new(&sample, &cfg).expect("context"));

    assert_eq!(meta.stage_results.len(), 8);
    assert_eq!(status(&meta, StageId::ProcessSecondaryPayload), StageStatus::Failed);
    assert_eq!(status(&meta, StageId::Finalize), StageStatus::Completed);
    assert!(meta.cnc_url.is_some());
    assert!(meta.download_url.is_some());
    assert!(meta.payload_executable.is_none());
    assert!(meta.network_status.attempted);
    assert!(!meta.network_status.success);
    assert_eq!(meta.threat_level, ThreatLevel::High);
    assert!(
        meta.analysis_summary
            .as_deref()
            .unwrap_or("")
            .contains("7/8 stages successful")
    );
}

#[test]
fn missing_download_url_skips_payload_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = common::fake_decompiler(dir.path(), &[CNC_URL], 0);
    let cfg = common::config_in(dir.path(), &tool);
    let sample = common::write_sample(dir.path(), "dropper.zip");

    let pipeline = AnalysisPipeline::with_fetcher(&cfg, Arc::new(OfflineFetcher));
    let meta = pipeline.execute(PipelineContext::new(&sample, &cfg).expect("context"));

    assert_eq!(status(&meta, StageId::AnalyzeUrls), StageStatus::Completed);
    assert_eq!(status(&meta, StageId::ProcessSecondaryPayload), StageStatus::Skipped);
    assert!(meta.download_url.is_none());
    assert!(!meta.network_status.attempted);
    assert!(meta.is_complete());
}

#[test]
fn decompiler_failure_cascades_to_skips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = common::fake_decompiler(dir.path(), &[CNC_URL, ISO_URL], 2);
    let cfg = common::config_in(dir.path(), &tool);
    let sample = common::write_sample(dir.path(), "dropper.zip");

    let pipeline = AnalysisPipeline::with_fetcher(&cfg, Arc::new(OfflineFetcher));
    let meta = pipeline.execute(PipelineContext::new(&sample, &cfg).expect("context"));

    assert_eq!(status(&meta, StageId::ExtractArchive), StageStatus::Completed);
    assert_eq!(status(&meta, StageId::ExtractInstaller), StageStatus::Failed);
    for id in [
        StageId::ExtractComponent,
        StageId::AnalyzeStrings,
        StageId::AnalyzeUrls,
        StageId::ProcessSecondaryPayload,
    ] {
        assert_eq!(status(&meta, id), StageStatus::Skipped, "{id}");
    }
    assert_eq!(status(&meta, StageId::Finalize), StageStatus::Completed);
    assert_eq!(meta.threat_level, ThreatLevel::Low);
    assert!(!meta.is_complete());
}
