//! # Pipeline Stages
//!
//! The eight stages of the dropper chain, in execution order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{AnalysisConfig, Config};
use crate::error::{AnalysisError, Result};
use crate::evidence::FileHash;
use crate::extract::installer::SCRIPT_FILE_NAME;
use crate::extract::script::InstallScript;
use crate::extract::{
    ComponentSelector, InstallerDecompiler, copy_into, extract_archive, locate_installer,
};
use crate::payload::{PayloadCache, PayloadFetcher, decode, fetch_payload, unpack_payload};
use crate::pipeline::assessment::assess;
use crate::pipeline::context::{ComponentInfo, InstallerInfo, MetadataDelta, NetworkStatus};
use crate::pipeline::{PipelineContext, PipelineStage, StageId, StageOutput};
use crate::strings::artifacts::find_url_containing;
use crate::strings::{extract_strings, find_download_url, find_urls, read_sidecar};

/// The full stage list for `config`.
pub fn default_stages(config: &Config, fetcher: Arc<dyn PayloadFetcher>) -> Vec<Box<dyn PipelineStage>> {
    let analysis = &config.analysis;
    vec![
        Box::new(Initialize),
        Box::new(ExtractArchive {
            installer_extension: analysis.installer_extension.clone(),
        }),
        Box::new(ExtractInstaller {
            decompiler: InstallerDecompiler::from_config(&config.decompiler),
            installer_extension: analysis.installer_extension.clone(),
        }),
        Box::new(ExtractComponent {
            selector: ComponentSelector::new(
                analysis.entry_point_signature.clone(),
                &analysis.excluded_components,
            ),
            signature: analysis.entry_point_signature.clone(),
        }),
        Box::new(AnalyzeStrings {
            min_length: analysis.string_min_len,
        }),
        Box::new(AnalyzeUrls {
            analysis: analysis.clone(),
        }),
        Box::new(ProcessSecondaryPayload {
            fetcher,
            cache: PayloadCache::new(config.paths.cache_dir.clone()),
            payload_extension: analysis.payload_extension.clone(),
        }),
        Box::new(Finalize),
    ]
}

fn path_value(path: &Path) -> Value {
    Value::from(path.display().to_string())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
}

/// Creates the session workspace and hashes the sample.
pub struct Initialize;

impl PipelineStage for Initialize {
    fn id(&self) -> StageId {
        StageId::Initialize
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let layout = ctx.layout();
        layout.create()?;
        let hash = FileHash::from_file(ctx.sample_path(), "sample")?;
        info!(
            "sample={} sha256={} size={}",
            ctx.sample_path().display(),
            hash.sha256,
            hash.size
        );

        let dirs: serde_json::Map<String, Value> = layout
            .stage_dirs()
            .iter()
            .map(|(name, dir)| (name.to_string(), path_value(dir)))
            .collect();

        let mut output = StageOutput::default()
            .with_meta("session_id", ctx.session_id())
            .with_meta("work_dir", path_value(&layout.work_dir))
            .with_meta("stage_dirs", Value::Object(dirs))
            .with_meta("sample_sha256", hash.sha256.clone())
            .with_artifact(layout.work_dir.clone());
        output.delta.file_hashes.push(("sample".to_string(), hash.clone()));
        output.delta.sample_hash = Some(hash);
        Ok(output)
    }
}

/// Unpacks the sample archive and looks for the installer package.
pub struct ExtractArchive {
    installer_extension: String,
}

impl PipelineStage for ExtractArchive {
    fn id(&self) -> StageId {
        StageId::ExtractArchive
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let extract_dir = &ctx.layout().extract_dir;
        let files = extract_archive(ctx.sample_path(), extract_dir)?;
        let installer = locate_installer(extract_dir, &self.installer_extension);

        let mut output = StageOutput::default()
            .with_meta("extracted_count", files.len())
            .with_meta("extract_dir", path_value(extract_dir))
            .with_meta(
                "installer",
                installer.as_deref().map(path_value).unwrap_or(Value::Null),
            );
        match &installer {
            Some(path) => info!("installer found path={}", path.display()),
            None => warn!("no .{} package in sample archive", self.installer_extension),
        }
        output
            .artifacts
            .extend(files.iter().map(|f| f.path.clone()));
        output.delta.extracted_files = files;
        Ok(output)
    }
}

/// Runs the external decompiler on the installer package.
pub struct ExtractInstaller {
    decompiler: InstallerDecompiler,
    installer_extension: String,
}

impl ExtractInstaller {
    /// The package `ExtractArchive` selected, if it is among its artifacts.
    fn installer(&self, ctx: &PipelineContext) -> Option<PathBuf> {
        let result = ctx.result(StageId::ExtractArchive)?;
        let selected = PathBuf::from(result.metadata.get("installer")?.as_str()?);
        result
            .artifacts
            .iter()
            .find(|p| **p == selected && has_extension(p, &self.installer_extension))
            .cloned()
    }
}

impl PipelineStage for ExtractInstaller {
    fn id(&self) -> StageId {
        StageId::ExtractInstaller
    }

    fn can_execute(&self, ctx: &PipelineContext) -> bool {
        ctx.prerequisites_met(self.id()) && self.installer(ctx).is_some()
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let installer = self.installer(ctx).ok_or_else(|| {
            AnalysisError::NotFound(format!("no .{} installer package", self.installer_extension))
        })?;
        let layout = ctx.layout();
        let out = self
            .decompiler
            .extract_installer(&installer, &layout.installer_dir, &layout.script_dir)?;
        let hash = FileHash::from_file(&installer, "installer")?;

        let mut output = StageOutput::default()
            .with_meta("installer", path_value(&installer))
            .with_meta("script_path", path_value(&out.script_path))
            .with_meta("extract_dir", path_value(&out.extract_dir))
            .with_artifact(out.script_path.clone())
            .with_artifact(out.extract_dir.clone());
        output.delta.installer_info = Some(InstallerInfo {
            path: installer,
            script_path: out.script_path,
            extract_dir: out.extract_dir,
            size: hash.size,
            sha256: hash.sha256.clone(),
        });
        output.delta.file_hashes.push(("installer".to_string(), hash));
        Ok(output)
    }
}

/// Picks the payload DLL out of the decompiled installer.
pub struct ExtractComponent {
    selector: ComponentSelector,
    signature: String,
}

impl PipelineStage for ExtractComponent {
    fn id(&self) -> StageId {
        StageId::ExtractComponent
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let layout = ctx.layout();
        let (script_path, extract_dir) = match &ctx.metadata().installer_info {
            Some(info) => (info.script_path.clone(), info.extract_dir.clone()),
            None => (
                layout.script_dir.join(SCRIPT_FILE_NAME),
                layout.installer_dir.clone(),
            ),
        };

        let script = InstallScript::from_file(&script_path)?;
        let component = self.selector.select(&script.custom_actions).ok_or_else(|| {
            AnalysisError::NotFound(format!(
                "no custom action with entry point {} in {}",
                self.signature,
                script_path.display()
            ))
        })?;
        let binary = script
            .resolve_binary(&extract_dir, &component.binary_key)
            .ok_or_else(|| {
                AnalysisError::NotFound(format!(
                    "binary {} not present in installer output",
                    component.binary_key
                ))
            })?;
        let copied = copy_into(&binary, &layout.component_dir)?;
        let hash = FileHash::from_file(&copied, "component")?;
        info!(
            "malicious component={} entry_point={} sha256={}",
            component.binary_key, component.entry_point, hash.sha256
        );

        let mut output = StageOutput::default()
            .with_meta("binary_key", component.binary_key.clone())
            .with_meta("entry_point", component.entry_point.clone())
            .with_meta("custom_actions", script.custom_actions.len())
            .with_artifact(copied.clone());
        output.delta.component_info = Some(ComponentInfo {
            binary_key: component.binary_key,
            entry_point: component.entry_point,
            action_id: component.action_id,
            path: copied,
            size: hash.size,
            sha256: hash.sha256.clone(),
            md5: hash.md5.clone(),
        });
        output.delta.file_hashes.push(("component".to_string(), hash));
        Ok(output)
    }
}

/// Dumps printable strings of the payload DLL to a sidecar file.
pub struct AnalyzeStrings {
    min_length: usize,
}

impl PipelineStage for AnalyzeStrings {
    fn id(&self) -> StageId {
        StageId::AnalyzeStrings
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let component = ctx
            .metadata()
            .component_info
            .as_ref()
            .ok_or_else(|| AnalysisError::NotFound("no component to scan".to_string()))?;
        let dump = extract_strings(&component.path, self.min_length)?;

        let mut output = StageOutput::default()
            .with_meta("strings_count", dump.strings.len())
            .with_meta("strings_file", path_value(&dump.sidecar))
            .with_meta("min_length", self.min_length)
            .with_artifact(dump.sidecar.clone());
        output.delta.strings_count = Some(dump.strings.len());
        output.delta.strings_file = Some(dump.sidecar);
        Ok(output)
    }
}

/// Pulls URLs from the string dump and classifies them.
pub struct AnalyzeUrls {
    analysis: AnalysisConfig,
}

impl PipelineStage for AnalyzeUrls {
    fn id(&self) -> StageId {
        StageId::AnalyzeUrls
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let sidecar = ctx
            .metadata()
            .strings_file
            .as_ref()
            .ok_or_else(|| AnalysisError::NotFound("no strings file".to_string()))?;
        let strings = read_sidecar(sidecar)?;
        let urls = find_urls(&strings);
        let cnc = find_url_containing(urls.as_slice(), &self.analysis.cnc_pattern).map(str::to_string);
        let download =
            find_download_url(urls.as_slice(), &self.analysis.download_pattern).map(str::to_string);

        info!(
            "urls={} cnc={} download={}",
            urls.len(),
            cnc.as_deref().unwrap_or("-"),
            download.as_deref().unwrap_or("-")
        );

        let mut output = StageOutput::default()
            .with_meta("url_count", urls.len())
            .with_meta("urls", urls.as_slice().to_vec())
            .with_meta("cnc_url", cnc.clone())
            .with_meta("download_url", download.clone());
        output.delta.urls = urls.into_vec();
        output.delta.cnc_url = cnc;
        output.delta.download_url = download;
        Ok(output)
    }
}

/// Downloads the disguised ISO, undoes both base64 layers and unpacks the
/// final executable.
pub struct ProcessSecondaryPayload {
    fetcher: Arc<dyn PayloadFetcher>,
    cache: PayloadCache,
    payload_extension: String,
}

impl PipelineStage for ProcessSecondaryPayload {
    fn id(&self) -> StageId {
        StageId::ProcessSecondaryPayload
    }

    /// A missing download URL is not a failure; the stage is skipped.
    fn can_execute(&self, ctx: &PipelineContext) -> bool {
        ctx.prerequisites_met(self.id()) && ctx.metadata().download_url.is_some()
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let url = ctx
            .metadata()
            .download_url
            .as_deref()
            .ok_or_else(|| AnalysisError::NotFound("no download url".to_string()))?;
        let layout = ctx.layout();

        let fetched = fetch_payload(
            self.fetcher.as_ref(),
            Some(&self.cache),
            url,
            &layout.download_dir,
        )?;
        let download_hash = FileHash::from_file(&fetched.path, "download")?;
        let decoded = decode(&fetched.path, &layout.download_dir)?;
        let run_output = ctx.output_dir().join(ctx.session_id());
        let unpacked = unpack_payload(
            &decoded.zip_path,
            &layout.payload_dir,
            &run_output,
            &self.payload_extension,
        )?;

        let mut output = StageOutput::default()
            .with_meta("download_path", path_value(&fetched.path))
            .with_meta("download_sha256", download_hash.sha256.clone())
            .with_meta("from_cache", fetched.from_cache)
            .with_meta("decoded_zip", path_value(&decoded.zip_path))
            .with_meta("decoded_zip_sha256", decoded.zip_hash.sha256.clone())
            .with_meta(
                "payload_executable",
                unpacked
                    .output_path
                    .as_deref()
                    .map(path_value)
                    .unwrap_or(Value::Null),
            )
            .with_artifact(fetched.path.clone())
            .with_artifact(decoded.intermediate_path.clone())
            .with_artifact(decoded.zip_path.clone());

        let delta = &mut output.delta;
        delta.file_hashes.push(("download".to_string(), download_hash));
        delta
            .file_hashes
            .push(("decoded_zip".to_string(), decoded.zip_hash));
        if let Some(exe) = unpacked.executable {
            delta.file_hashes.push(("executable".to_string(), exe));
        }
        if let Some(path) = unpacked.output_path {
            output.artifacts.push(path.clone());
            output.delta.payload_executable = Some(path);
        }
        Ok(output)
    }
}

/// Records network status and the threat verdict. Always runs.
pub struct Finalize;

impl PipelineStage for Finalize {
    fn id(&self) -> StageId {
        StageId::Finalize
    }

    fn run(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let meta = ctx.metadata();
        let payload = ctx
            .result(StageId::ProcessSecondaryPayload)
            .filter(|r| r.ran());
        let network_status = NetworkStatus {
            attempted: payload.is_some(),
            success: payload.is_some_and(|r| r.success),
            from_cache: payload
                .and_then(|r| r.metadata.get("from_cache"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        // This stage counts as run and successful.
        let total = meta.stages_run() + 1;
        let ok = meta.successful_stages() + 1;
        let elapsed = (Utc::now() - meta.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let assessment = assess(meta, ok, total, elapsed);
        info!("{}", assessment.summary);

        let mut output = StageOutput::default()
            .with_meta("total_stages", total)
            .with_meta("successful_stages", ok)
            .with_meta("threat_level", assessment.threat_level.as_str())
            .with_meta("network_attempted", network_status.attempted)
            .with_meta("network_success", network_status.success);
        output.delta.network_status = Some(network_status);
        output.delta.assessment = Some(assessment);
        output.delta.end_time = Some(Utc::now());
        Ok(output)
    }
}
