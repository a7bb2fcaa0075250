use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Optional path to config file (YAML)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Root for samples/, cache/, temp/ and output/ (overrides config)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the installer decompiler (WiX dark.exe)
    #[arg(long, global = true)]
    pub dark_path: Option<PathBuf>,

    /// Program used to launch the decompiler, e.g. wine
    #[arg(long, global = true)]
    pub launcher: Option<String>,

    /// Output directory for reports and recovered payloads
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Directory scanned by `batch`
    #[arg(long, global = true)]
    pub samples_dir: Option<PathBuf>,

    /// User-Agent header for payload downloads
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyse one sample archive
    Analyze(AnalyzeArgs),
    /// Analyse every sample archive in the samples directory
    Batch(BatchArgs),
    /// Extract printable strings from a binary
    Strings(StringsArgs),
    /// Download (or read) a disguised ISO and recover its payload
    Decode(DecodeArgs),
    /// Inspect and clean up session workspaces
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Sample ZIP archive
    pub sample: PathBuf,

    /// Keep the session workspace even when every stage succeeds
    #[arg(long)]
    pub keep_temp: bool,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Upper bound on worker threads (overrides config)
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Keep every session workspace
    #[arg(long)]
    pub keep_temp: bool,

    /// Results file (default: <output_dir>/batch_results.jsonl)
    #[arg(long)]
    pub results: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StringsArgs {
    /// Binary to scan
    pub file: PathBuf,

    /// Minimum string length (overrides config)
    #[arg(long)]
    pub min_length: Option<usize>,

    /// Write strings here instead of `<file>.strings`
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Also list URLs found in the strings
    #[arg(long)]
    pub urls: bool,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// URL of the disguised ISO
    #[arg(required_unless_present = "input", conflicts_with = "input")]
    pub url: Option<String>,

    /// Decode a local file instead of downloading
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Working directory for the download, decode layers and extraction
    #[arg(long, default_value = "./decoded")]
    pub out_dir: PathBuf,

    /// Always download, ignoring the payload cache
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// List session workspaces
    List,
    /// Remove a session workspace
    Cleanup {
        session_id: String,
        /// Remove even when a debug marker is present
        #[arg(long)]
        force: bool,
    },
    /// Protect a session workspace from automatic cleanup
    Keep {
        session_id: String,
        #[arg(long, default_value = "manual inspection")]
        reason: String,
    },
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
