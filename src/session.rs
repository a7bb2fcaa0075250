//! # Session Workspace
//!
//! Each analysed sample gets its own directory tree under the temp root,
//! named by a session id. Concurrent samples never share a workspace.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{AnalysisError, Result};

pub const SESSION_PREFIX: &str = "session_";
const MANIFEST_NAME: &str = "session_manifest.txt";
const DEBUG_MARKER: &str = ".debug";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns `session_` followed by 16 lowercase hex characters.
pub fn generate_session_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{SESSION_PREFIX}{}", &digest[..16])
}

/// Working directories of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLayout {
    pub session_id: String,
    pub root: PathBuf,
    pub work_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub installer_dir: PathBuf,
    pub script_dir: PathBuf,
    pub component_dir: PathBuf,
    pub download_dir: PathBuf,
    pub payload_dir: PathBuf,
}

impl SessionLayout {
    pub fn new(temp_root: &Path, session_id: &str) -> Self {
        let root = temp_root.join(session_id);
        let work_dir = root.join("processing");
        Self {
            session_id: session_id.to_string(),
            extract_dir: work_dir.join("extract"),
            installer_dir: work_dir.join("installer"),
            script_dir: work_dir.join("script"),
            component_dir: work_dir.join("component"),
            download_dir: work_dir.join("download"),
            payload_dir: work_dir.join("payload"),
            work_dir,
            root,
        }
    }

    pub fn stage_dirs(&self) -> [(&'static str, &Path); 6] {
        [
            ("extract", &self.extract_dir),
            ("installer", &self.installer_dir),
            ("script", &self.script_dir),
            ("component", &self.component_dir),
            ("download", &self.download_dir),
            ("payload", &self.payload_dir),
        ]
    }

    /// Create every directory and write the manifest if it is missing.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        for (_, dir) in self.stage_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        let manifest = self.root.join(MANIFEST_NAME);
        if !manifest.exists() {
            let mut text = String::new();
            text.push_str(&format!("Session ID: {}\n", self.session_id));
            text.push_str(&format!("Created: {}\n", Utc::now().to_rfc3339()));
            text.push_str(&format!("Temp Directory: {}\n\n", self.root.display()));
            text.push_str("Directory Structure:\n");
            text.push_str("- processing/\n");
            text.push_str("  - extract/    # sample archive contents\n");
            text.push_str("  - installer/  # binaries unpacked from the installer\n");
            text.push_str("  - script/     # decompiled install script\n");
            text.push_str("  - component/  # selected payload DLL and its strings\n");
            text.push_str("  - download/   # secondary download and decode layers\n");
            text.push_str("  - payload/    # secondary payload contents\n");
            std::fs::write(&manifest, text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub path: PathBuf,
    pub created: Option<String>,
    pub size_bytes: u64,
    pub has_debug_marker: bool,
}

/// List session directories under `temp_root`, newest first.
pub fn list_sessions(temp_root: &Path) -> Result<Vec<SessionInfo>> {
    let mut sessions = Vec::new();
    if !temp_root.exists() {
        return Ok(sessions);
    }
    for entry in std::fs::read_dir(temp_root)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_dir() || !name.starts_with(SESSION_PREFIX) {
            continue;
        }
        let created = std::fs::read_to_string(path.join(MANIFEST_NAME))
            .ok()
            .and_then(|text| {
                text.lines()
                    .find_map(|line| line.strip_prefix("Created: ").map(str::to_string))
            });
        sessions.push(SessionInfo {
            session_id: name,
            size_bytes: dir_size(&path),
            has_debug_marker: path.join(DEBUG_MARKER).exists(),
            created,
            path,
        });
    }
    sessions.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(sessions)
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Outcome of a cleanup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    KeptDebugMarker,
    Missing,
}

pub fn cleanup_session(temp_root: &Path, session_id: &str, force: bool) -> Result<CleanupOutcome> {
    let dir = temp_root.join(session_id);
    if !dir.exists() {
        return Ok(CleanupOutcome::Missing);
    }

    let manifest = dir.join(MANIFEST_NAME);
    if manifest.exists() {
        let mut file = OpenOptions::new().append(true).open(&manifest)?;
        writeln!(file, "\nCleaned up: {}", Utc::now().to_rfc3339())?;
    }

    if !force && dir.join(DEBUG_MARKER).exists() {
        info!("skipping cleanup of session={session_id}: debug marker present");
        return Ok(CleanupOutcome::KeptDebugMarker);
    }

    std::fs::remove_dir_all(&dir)?;
    info!("removed session workspace {}", dir.display());
    Ok(CleanupOutcome::Removed)
}

/// Drop a `.debug` marker so automatic cleanup leaves the session alone.
pub fn create_debug_marker(temp_root: &Path, session_id: &str, reason: &str) -> Result<PathBuf> {
    let dir = temp_root.join(session_id);
    if !dir.is_dir() {
        return Err(AnalysisError::Validation(format!(
            "session directory not found: {}",
            dir.display()
        )));
    }
    let marker = dir.join(DEBUG_MARKER);
    let text = format!(
        "Debug marker created: {}\nReason: {reason}\nDelete this file to allow automatic cleanup\n",
        Utc::now().to_rfc3339()
    );
    std::fs::write(&marker, text)?;
    warn!("session={session_id} kept for inspection: {reason}");
    Ok(marker)
}
