//! # Batch Analysis
//!
//! Analyses every sample in a directory with a bounded pool of worker
//! threads. Results stream to `batch_results.jsonl` as samples finish.
//! Raising the cancel flag stops dispatch; samples already in flight run to
//! completion.

pub mod events;
pub mod workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::processor::SampleProcessor;
use crate::report::JsonlSink;

use events::BatchEvent;
use workers::{BatchCounters, SampleJob};

pub const RESULTS_FILE_NAME: &str = "batch_results.jsonl";

/// Samples with `extension` directly inside `dir`, sorted by path.
/// Subdirectories are not searched, so sample names are unique per batch
/// and so are their report files.
pub fn collect_samples(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("samples directory not found: {}", dir.display());
    }
    let wanted = extension.trim_start_matches('.');
    let mut samples: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
        })
        .collect();
    samples.sort();
    Ok(samples)
}

/// min(available CPUs, samples, cap), at least one.
pub fn worker_count(samples: usize, cap: usize) -> usize {
    num_cpus::get().min(samples).min(cap).max(1)
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_workers: usize,
    pub keep_temp: bool,
    pub results_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub dispatched: usize,
    /// Samples whose pipeline produced a report
    pub processed: u64,
    /// Processed samples where every stage that ran succeeded
    pub complete: u64,
    /// Samples the processor could not handle at all
    pub failed: u64,
    pub cancelled: bool,
    pub record_errors: u64,
}

pub fn run_batch(
    processor: Arc<SampleProcessor>,
    samples: Vec<PathBuf>,
    opts: &BatchOptions,
    cancel_flag: Arc<AtomicBool>,
) -> Result<BatchSummary> {
    let total = samples.len();
    let mut summary = BatchSummary {
        total,
        ..BatchSummary::default()
    };
    if samples.is_empty() {
        warn!("no samples to analyse");
        return Ok(summary);
    }

    let workers = worker_count(total, opts.max_workers);
    let started = Instant::now();
    info!(
        "starting batch samples={} workers={} results={}",
        total,
        workers,
        opts.results_path.display()
    );

    let sink = JsonlSink::create(&opts.results_path)
        .with_context(|| format!("opening {}", opts.results_path.display()))?;
    let (job_tx, job_rx) = bounded::<SampleJob>(workers * 2);
    let (event_tx, event_rx) = bounded::<BatchEvent>(workers * 4);
    let record_errors = Arc::new(AtomicU64::new(0));
    let counters = Arc::new(BatchCounters::default());

    let results_handle = workers::spawn_results_thread(sink, event_rx, record_errors.clone());
    let worker_handles = workers::spawn_analysis_workers(
        workers,
        processor,
        opts.keep_temp,
        job_rx,
        event_tx.clone(),
        counters.clone(),
    );

    for (index, sample) in samples.into_iter().enumerate() {
        if cancel_flag.load(Ordering::Relaxed) {
            warn!("cancellation requested; {} samples not dispatched", total - index);
            summary.cancelled = true;
            break;
        }
        if job_tx.send(SampleJob { index, sample }).is_err() {
            warn!("all workers exited early");
            break;
        }
        summary.dispatched += 1;
    }
    drop(job_tx);

    for handle in worker_handles {
        if handle.join().is_err() {
            warn!("analysis worker panicked");
        }
    }
    let _ = event_tx.send(BatchEvent::Flush);
    drop(event_tx);
    if results_handle.join().is_err() {
        warn!("results writer panicked");
    }

    summary.processed = counters.processed.load(Ordering::Relaxed);
    summary.complete = counters.complete.load(Ordering::Relaxed);
    summary.failed = counters.failed.load(Ordering::Relaxed);
    summary.record_errors = record_errors.load(Ordering::Relaxed);
    info!(
        "batch finished processed={} complete={} failed={} dispatched={}/{} elapsed_secs={:.1}",
        summary.processed,
        summary.complete,
        summary.failed,
        summary.dispatched,
        summary.total,
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}
