use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::DecompilerConfig;
use crate::error::{AnalysisError, Result};
use crate::extract::find_files_by_extension;

pub const SCRIPT_FILE_NAME: &str = "installer_script.wxs";

/// Find the installer package in an extraction tree.
///
/// Returns the first match in path order when more than one is present.
pub fn locate_installer(dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut found = find_files_by_extension(dir, extension);
    if found.len() > 1 {
        warn!(
            "{} installer packages under {}; using {}",
            found.len(),
            dir.display(),
            found[0].display()
        );
    }
    if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    }
}

#[derive(Debug, Clone)]
pub struct InstallerOutput {
    pub script_path: PathBuf,
    pub extract_dir: PathBuf,
    pub stdout: String,
    pub stderr: String,
}

/// Wrapper around the external installer decompiler.
#[derive(Debug, Clone)]
pub struct InstallerDecompiler {
    tool: PathBuf,
    launcher: Option<String>,
}

impl InstallerDecompiler {
    pub fn new(tool: impl Into<PathBuf>, launcher: Option<String>) -> Self {
        Self {
            tool: tool.into(),
            launcher,
        }
    }

    pub fn from_config(cfg: &DecompilerConfig) -> Self {
        Self::new(cfg.path.clone(), cfg.launcher.clone())
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Bare program names are resolved through `PATH` at spawn time; explicit
    /// paths must exist.
    pub fn validate(&self) -> Result<()> {
        let explicit = self.tool.components().count() > 1 || self.tool.is_absolute();
        if explicit && !self.tool.is_file() {
            return Err(AnalysisError::Validation(format!(
                "installer decompiler not found at {}",
                self.tool.display()
            )));
        }
        Ok(())
    }

    /// Run the decompiler on `installer`, unpacking binaries into
    /// `extract_dir` and writing the install script into `script_dir`.
    ///
    /// Output streams are kept for diagnostics only.
    pub fn extract_installer(
        &self,
        installer: &Path,
        extract_dir: &Path,
        script_dir: &Path,
    ) -> Result<InstallerOutput> {
        self.validate()?;
        if !installer.is_file() {
            return Err(AnalysisError::Validation(format!(
                "installer not found: {}",
                installer.display()
            )));
        }
        std::fs::create_dir_all(extract_dir)?;
        std::fs::create_dir_all(script_dir)?;

        let installer = absolute(installer)?;
        let extract_dir = absolute(extract_dir)?;
        let script_path = absolute(script_dir)?.join(SCRIPT_FILE_NAME);

        let mut cmd = match &self.launcher {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(&self.tool);
                cmd
            }
            None => Command::new(&self.tool),
        };
        cmd.arg(&installer)
            .arg("-x")
            .arg(&extract_dir)
            .arg("-o")
            .arg(&script_path);

        info!(
            "running decompiler tool={} installer={}",
            self.tool.display(),
            installer.display()
        );
        let output = cmd.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AnalysisError::Validation(format!(
                    "installer decompiler could not be started ({}): {err}",
                    self.tool.display()
                ))
            } else {
                AnalysisError::Extraction(format!("failed to run installer decompiler: {err}"))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stdout.trim().is_empty() {
            debug!("decompiler stdout: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            warn!("decompiler stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(AnalysisError::Extraction(format!(
                "installer decompiler exited with status {code}"
            )));
        }
        if !script_path.is_file() {
            return Err(AnalysisError::Extraction(format!(
                "installer decompiler did not produce {}",
                script_path.display()
            )));
        }

        Ok(InstallerOutput {
            script_path,
            extract_dir,
            stdout,
            stderr,
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}
