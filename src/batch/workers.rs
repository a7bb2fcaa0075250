//! # Batch Workers
//!
//! Worker thread spawning for multi-sample runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use crate::processor::SampleProcessor;
use crate::report::JsonlSink;

use super::events::{BatchEvent, BatchRecord};

/// One sample queued for analysis.
pub struct SampleJob {
    pub index: usize,
    pub sample: PathBuf,
}

/// Spawn the results writer thread.
pub fn spawn_results_thread(
    sink: JsonlSink,
    rx: Receiver<BatchEvent>,
    error_count: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            match event {
                BatchEvent::Sample(record) => {
                    if let Err(err) = sink.record(&record) {
                        error_count.fetch_add(1, Ordering::Relaxed);
                        warn!("batch record error path={}: {err}", sink.path().display());
                    }
                }
                BatchEvent::Flush => {
                    if let Err(err) = sink.flush() {
                        error_count.fetch_add(1, Ordering::Relaxed);
                        warn!("batch flush error path={}: {err}", sink.path().display());
                    }
                }
            }
        }
        if let Err(err) = sink.flush() {
            error_count.fetch_add(1, Ordering::Relaxed);
            warn!("batch flush error path={}: {err}", sink.path().display());
        }
    })
}

/// Counters shared by all workers.
#[derive(Default)]
pub struct BatchCounters {
    pub processed: AtomicU64,
    pub complete: AtomicU64,
    pub failed: AtomicU64,
}

/// Spawn `workers` analysis threads. Each owns nothing but its current job;
/// sessions keep their filesystem state apart.
pub fn spawn_analysis_workers(
    workers: usize,
    processor: Arc<SampleProcessor>,
    keep_temp: bool,
    rx: Receiver<SampleJob>,
    event_tx: Sender<BatchEvent>,
    counters: Arc<BatchCounters>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::new();

    for _ in 0..workers.max(1) {
        let processor = processor.clone();
        let rx = rx.clone();
        let event_tx = event_tx.clone();
        let counters = counters.clone();

        handles.push(thread::spawn(move || {
            for job in rx {
                let started = Instant::now();
                let record = match processor.process(&job.sample, keep_temp) {
                    Ok(outcome) => {
                        let meta = &outcome.metadata;
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        if meta.is_complete() {
                            counters.complete.fetch_add(1, Ordering::Relaxed);
                        }
                        BatchRecord {
                            sample: job.sample.clone(),
                            session_id: Some(meta.session_id.clone()),
                            processed: true,
                            complete: meta.is_complete(),
                            stages_run: meta.stages_run(),
                            stages_successful: meta.successful_stages(),
                            threat_level: Some(meta.threat_level),
                            malware_family: meta.malware_family.clone(),
                            cnc_url: meta.cnc_url.clone(),
                            download_url: meta.download_url.clone(),
                            report_path: Some(outcome.report_path.clone()),
                            error: None,
                            duration_secs: started.elapsed().as_secs_f64(),
                        }
                    }
                    Err(err) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("sample #{} {} failed: {err:#}", job.index, job.sample.display());
                        BatchRecord {
                            sample: job.sample.clone(),
                            session_id: None,
                            processed: false,
                            complete: false,
                            stages_run: 0,
                            stages_successful: 0,
                            threat_level: None,
                            malware_family: None,
                            cnc_url: None,
                            download_url: None,
                            report_path: None,
                            error: Some(format!("{err:#}")),
                            duration_secs: started.elapsed().as_secs_f64(),
                        }
                    }
                };
                if event_tx.send(BatchEvent::Sample(record)).is_err() {
                    warn!("results writer gone; dropping record");
                }
            }
        }));
    }

    handles
}
