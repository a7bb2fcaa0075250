//! # Error Types
//!
//! Errors raised by the extraction, analysis, and download collaborators.
//! Every stage converts these into a failed stage result; none of them
//! cross the pipeline boundary.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Missing input file or missing external tool
    #[error("validation error: {0}")]
    Validation(String),
    /// Corrupt archive, corrupt installer, or decompiler failure
    #[error("extraction error: {0}")]
    Extraction(String),
    /// Timeout, redirect limit, connection failure, or bad status
    #[error("network error: {0}")]
    Network(String),
    /// Invalid base64 at either layer, or final bytes not a ZIP
    #[error("decoding error: {0}")]
    Decoding(String),
    /// A required artifact (installer, component, URL) is absent
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Extraction,
    Network,
    Decoding,
    NotFound,
    Io,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::Extraction(_) => ErrorKind::Extraction,
            AnalysisError::Network(_) => ErrorKind::Network,
            AnalysisError::Decoding(_) => ErrorKind::Decoding,
            AnalysisError::NotFound(_) => ErrorKind::NotFound,
            AnalysisError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<zip::result::ZipError> for AnalysisError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => AnalysisError::Io(io),
            other => AnalysisError::Extraction(format!("invalid zip archive: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
