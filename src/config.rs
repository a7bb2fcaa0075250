use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DecompilerConfig {
    /// Path to the installer decompiler (WiX `dark.exe` or compatible).
    pub path: PathBuf,
    /// Optional program used to launch the decompiler (for example `wine`).
    #[serde(default)]
    pub launcher: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    pub samples_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_redirects: usize,
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AnalysisConfig {
    pub string_min_len: usize,
    pub installer_extension: String,
    pub entry_point_signature: String,
    pub excluded_components: Vec<String>,
    pub cnc_pattern: String,
    pub download_pattern: String,
    pub payload_extension: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BatchConfig {
    pub max_workers: usize,
    pub sample_extension: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub decompiler: DecompilerConfig,
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub analysis: AnalysisConfig,
    pub batch: BatchConfig,
}

impl Config {
    /// Re-roots all four directory roots under `base`. Used by tests and by
    /// `--data-dir` on the command line.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        self.paths = PathsConfig {
            samples_dir: base.join("samples"),
            cache_dir: base.join("cache"),
            temp_dir: base.join("temp"),
            output_dir: base.join("output"),
        };
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.paths.samples_dir,
            &self.paths.cache_dir,
            &self.paths.temp_dir,
            &self.paths.output_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p).with_context(|| format!("reading config {}", p.display()))?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.analysis.download_pattern.is_empty() {
        config.analysis.download_pattern = "iso".to_string();
    }
    if config.batch.max_workers == 0 {
        config.batch.max_workers = 1;
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}
