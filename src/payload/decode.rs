//! # Disguised Payload Decoding
//!
//! The downloaded "ISO" is base64 text whose decoded form is base64 text
//! again. The second layer yields a ZIP holding the final executable.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};
use crate::evidence::FileHash;
use crate::extract::{copy_into, extract_archive, find_files_by_extension};

pub const INTERMEDIATE_FILE_NAME: &str = "encoded.b64";
pub const DECODED_ZIP_NAME: &str = "decoded.zip";

fn decode_layer(data: &[u8], layer: u8) -> Result<Vec<u8>> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(&compact)
        .map_err(|err| AnalysisError::Decoding(format!("invalid base64 at layer {layer}: {err}")))
}

/// Undo both base64 layers. Returns the intermediate text and the final
/// bytes.
pub fn decode_layers(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let intermediate = decode_layer(data, 1)?;
    let decoded = decode_layer(&intermediate, 2)?;
    Ok((intermediate, decoded))
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedPayload {
    pub intermediate_path: PathBuf,
    pub zip_path: PathBuf,
    pub zip_hash: FileHash,
}

/// Decode the downloaded artifact at `payload_path`, writing the
/// intermediate layer and the recovered ZIP into `output_dir`.
pub fn decode(payload_path: &Path, output_dir: &Path) -> Result<DecodedPayload> {
    info!("decoding payload={}", payload_path.display());
    let data = std::fs::read(payload_path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AnalysisError::Validation(format!("payload not found: {}", payload_path.display()))
        } else {
            AnalysisError::Io(err)
        }
    })?;
    std::fs::create_dir_all(output_dir)?;

    let intermediate = decode_layer(&data, 1)?;
    let intermediate_path = output_dir.join(INTERMEDIATE_FILE_NAME);
    std::fs::write(&intermediate_path, &intermediate)?;
    debug!("first layer bytes={}", intermediate.len());

    let decoded = decode_layer(&intermediate, 2)?;
    zip::ZipArchive::new(Cursor::new(decoded.as_slice())).map_err(|err| {
        AnalysisError::Decoding(format!("decoded payload is not a zip archive: {err}"))
    })?;
    let zip_path = output_dir.join(DECODED_ZIP_NAME);
    std::fs::write(&zip_path, &decoded)?;
    info!("decoded zip bytes={} path={}", decoded.len(), zip_path.display());

    Ok(DecodedPayload {
        intermediate_path,
        zip_hash: FileHash::from_file(&zip_path, "decoded_zip")?,
        zip_path,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UnpackedPayload {
    pub files: Vec<FileHash>,
    pub executable: Option<FileHash>,
    pub output_path: Option<PathBuf>,
}

/// Extract the decoded ZIP into `extract_dir` and copy the first file with
/// `extension` into `output_dir`. A ZIP without one is not an error.
pub fn unpack_payload(
    zip_path: &Path,
    extract_dir: &Path,
    output_dir: &Path,
    extension: &str,
) -> Result<UnpackedPayload> {
    let files = extract_archive(zip_path, extract_dir)?;
    let Some(exe) = find_files_by_extension(extract_dir, extension).into_iter().next() else {
        warn!(
            "no .{extension} file in decoded payload {}",
            zip_path.display()
        );
        return Ok(UnpackedPayload {
            files,
            executable: None,
            output_path: None,
        });
    };

    let output_path = copy_into(&exe, output_dir)?;
    info!("payload executable={} copied to {}", exe.display(), output_path.display());
    Ok(UnpackedPayload {
        files,
        executable: Some(FileHash::from_file(&exe, "executable")?),
        output_path: Some(output_path),
    })
}
