use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use droptrace::{
    batch,
    cli::{self, AnalyzeArgs, BatchArgs, CliOptions, Command, DecodeArgs, SessionAction, StringsArgs},
    config::{self, Config},
    extract::InstallerDecompiler,
    logging,
    payload::{self, HttpFetcher, PayloadCache},
    processor::{SampleProcessor, WorkspaceAction},
    report, session, strings,
};

fn main() -> Result<()> {
    let cli_opts = cli::parse();
    logging::init_logging(cli_opts.verbose, cli_opts.json_logs);

    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let cfg = apply_overrides(loaded.config, &cli_opts);

    match cli_opts.command {
        Command::Analyze(args) => analyze(cfg, loaded.config_hash, &args),
        Command::Batch(args) => run_batch(cfg, loaded.config_hash, &args),
        Command::Strings(args) => rip_strings(&cfg, &args),
        Command::Decode(args) => decode(&cfg, &args),
        Command::Sessions { action } => sessions(&cfg, action),
    }
}

fn apply_overrides(mut cfg: Config, opts: &CliOptions) -> Config {
    if let Some(dir) = &opts.data_dir {
        cfg = cfg.rooted_at(dir);
    }
    if let Some(path) = &opts.dark_path {
        cfg.decompiler.path = path.clone();
    }
    if let Some(launcher) = &opts.launcher {
        cfg.decompiler.launcher = Some(launcher.clone());
    }
    if let Some(dir) = &opts.output_dir {
        cfg.paths.output_dir = dir.clone();
    }
    if let Some(dir) = &opts.samples_dir {
        cfg.paths.samples_dir = dir.clone();
    }
    if let Some(agent) = &opts.user_agent {
        cfg.network.user_agent = agent.clone();
    }
    cfg
}

fn check_decompiler(cfg: &Config) -> Result<()> {
    InstallerDecompiler::from_config(&cfg.decompiler)
        .validate()
        .context("installer decompiler unavailable; get WiX Toolset from https://wixtoolset.org/releases/")
}

fn analyze(cfg: Config, config_hash: String, args: &AnalyzeArgs) -> Result<()> {
    check_decompiler(&cfg)?;
    cfg.ensure_directories()?;

    let processor = SampleProcessor::new(cfg, config_hash)?;
    let outcome = processor.process(&args.sample, args.keep_temp)?;
    println!("\n{}", report::render_text_report(&outcome.metadata));

    match outcome.workspace {
        WorkspaceAction::Removed => info!("session workspace removed"),
        WorkspaceAction::Kept { reason, marker } => {
            warn!("session workspace kept ({reason}); marker={}", marker.display())
        }
    }
    info!("processing complete");
    Ok(())
}

fn run_batch(mut cfg: Config, config_hash: String, args: &BatchArgs) -> Result<()> {
    check_decompiler(&cfg)?;
    cfg.ensure_directories()?;
    if let Some(max) = args.max_workers {
        cfg.batch.max_workers = max.max(1);
    }

    let samples = batch::collect_samples(&cfg.paths.samples_dir, &cfg.batch.sample_extension)?;
    let opts = batch::BatchOptions {
        max_workers: cfg.batch.max_workers,
        keep_temp: args.keep_temp,
        results_path: args
            .results
            .clone()
            .unwrap_or_else(|| cfg.paths.output_dir.join(batch::RESULTS_FILE_NAME)),
    };

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel_flag.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received; finishing in-flight samples");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("installing Ctrl-C handler")?;

    let processor = Arc::new(SampleProcessor::new(cfg, config_hash)?);
    let summary = batch::run_batch(processor, samples, &opts, cancel_flag)?;
    println!(
        "{} samples: {} processed ({} complete), {} failed{}",
        summary.total,
        summary.processed,
        summary.complete,
        summary.failed,
        if summary.cancelled { ", cancelled" } else { "" }
    );
    println!("results: {}", opts.results_path.display());
    Ok(())
}

fn rip_strings(cfg: &Config, args: &StringsArgs) -> Result<()> {
    let min_length = args.min_length.unwrap_or(cfg.analysis.string_min_len);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| strings::sidecar_path(&args.file));
    let dump = strings::extract_strings_to(&args.file, min_length, &output)
        .with_context(|| format!("extracting strings from {}", args.file.display()))?;
    println!(
        "extracted {} strings (min length {}) to {}",
        dump.strings.len(),
        min_length,
        dump.sidecar.display()
    );

    if args.urls {
        let urls = strings::find_urls(&dump.texts());
        for artefact in strings::artifacts::classify_urls(
            urls.as_slice(),
            &cfg.analysis.cnc_pattern,
            &cfg.analysis.download_pattern,
        ) {
            let role = match artefact.kind {
                strings::artifacts::ArtefactKind::CncUrl => "c2",
                strings::artifacts::ArtefactKind::DownloadUrl => "download",
                strings::artifacts::ArtefactKind::Url => "url",
            };
            println!("{role:>8}  {}", artefact.url);
        }
    }
    Ok(())
}

fn decode(cfg: &Config, args: &DecodeArgs) -> Result<()> {
    let out_dir = &args.out_dir;
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let source = match (&args.input, &args.url) {
        (Some(input), _) => input.clone(),
        (None, Some(url)) => {
            let fetcher = HttpFetcher::from_config(&cfg.network)?;
            let cache = (!args.no_cache).then(|| PayloadCache::new(cfg.paths.cache_dir.clone()));
            let fetched = payload::fetch_payload(&fetcher, cache.as_ref(), url, out_dir)
                .with_context(|| format!("downloading {url}"))?;
            if fetched.from_cache {
                info!("served from cache: {}", fetched.path.display());
            }
            fetched.path
        }
        (None, None) => bail!("either a URL or --input is required"),
    };

    let decoded = payload::decode(&source, out_dir)
        .with_context(|| format!("decoding {}", source.display()))?;
    println!("decoded zip: {} (sha256 {})", decoded.zip_path.display(), decoded.zip_hash.sha256);

    let unpacked = payload::unpack_payload(
        &decoded.zip_path,
        &out_dir.join("extracted"),
        out_dir,
        &cfg.analysis.payload_extension,
    )?;
    match (&unpacked.executable, &unpacked.output_path) {
        (Some(exe), Some(path)) => println!("payload: {} (sha256 {})", path.display(), exe.sha256),
        _ => println!(
            "no .{} file among {} extracted files",
            cfg.analysis.payload_extension,
            unpacked.files.len()
        ),
    }
    Ok(())
}

fn sessions(cfg: &Config, action: SessionAction) -> Result<()> {
    let temp_root = cfg.paths.temp_dir.as_path();
    match action {
        SessionAction::List => list_sessions(temp_root),
        SessionAction::Cleanup { session_id, force } => {
            match session::cleanup_session(temp_root, &session_id, force)? {
                session::CleanupOutcome::Removed => println!("removed {session_id}"),
                session::CleanupOutcome::KeptDebugMarker => {
                    println!("{session_id} has a debug marker; use --force to remove it")
                }
                session::CleanupOutcome::Missing => println!("{session_id} not found"),
            }
            Ok(())
        }
        SessionAction::Keep { session_id, reason } => {
            let marker = session::create_debug_marker(temp_root, &session_id, &reason)?;
            println!("marked {session_id}: {}", marker.display());
            Ok(())
        }
    }
}

fn list_sessions(temp_root: &Path) -> Result<()> {
    let sessions = session::list_sessions(temp_root)?;
    if sessions.is_empty() {
        println!("No active sessions found.");
        return Ok(());
    }
    println!("Active Analysis Sessions:");
    println!("{}", "=".repeat(80));
    for s in sessions {
        println!("Session: {}", s.session_id);
        println!("  Path: {}", s.path.display());
        println!("  Status: {}", if s.has_debug_marker { "DEBUG" } else { "ACTIVE" });
        println!("  Size: {:.1}MB", s.size_bytes as f64 / (1024.0 * 1024.0));
        println!("  Created: {}", s.created.as_deref().unwrap_or("Unknown"));
        println!();
    }
    Ok(())
}
