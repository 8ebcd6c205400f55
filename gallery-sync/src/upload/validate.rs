use std::io::Cursor;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{DimensionLimits, ValidationConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{mime_type} is not an allowed image type (allowed: {allowed})")]
    UnsupportedType { mime_type: String, allowed: String },
    #[error("file is {actual} bytes, over the {limit}-byte limit")]
    TooLarge { actual: u64, limit: u64 },
    #[error("image is {width}x{height}px, outside the allowed dimensions")]
    Dimensions { width: u32, height: u32 },
    #[error("could not decode image to check its dimensions: {0}")]
    Undecodable(String),
    #[error("file could not be read: {0}")]
    Unreadable(String),
    #[error("the gallery already holds the maximum of {max_count} images")]
    CapacityExceeded { max_count: usize },
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
}

impl SourceFile {
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            byte_size: metadata.len(),
            mime_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
        })
    }

    /// Stand-in record for a path whose metadata could not be read, so the
    /// rejection still names the file.
    pub fn unreadable(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            byte_size: 0,
            mime_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug)]
pub struct RejectedFile {
    pub source: SourceFile,
    pub reasons: Vec<ValidationError>,
}

#[derive(Debug)]
pub struct BatchValidation {
    pub accepted: Vec<SourceFile>,
    pub rejected: Vec<RejectedFile>,
}

/// Every failing reason is collected; an oversized file of the wrong type
/// reports both.
pub async fn validate(source: &SourceFile, config: &ValidationConfig) -> Vec<ValidationError> {
    let mut reasons = check_metadata(source, config);
    if let Some(limits) = &config.dimensions {
        match tokio::fs::read(&source.path).await {
            Ok(bytes) => {
                if let Some(reason) = check_dimensions(&bytes, limits) {
                    reasons.push(reason);
                }
            }
            Err(err) => reasons.push(ValidationError::Unreadable(err.to_string())),
        }
    }
    reasons
}

pub fn check_metadata(source: &SourceFile, config: &ValidationConfig) -> Vec<ValidationError> {
    let mut reasons = Vec::new();
    if !config.allowed_types.iter().any(|t| t == &source.mime_type) {
        reasons.push(ValidationError::UnsupportedType {
            mime_type: source.mime_type.clone(),
            allowed: config.allowed_types.join(", "),
        });
    }
    if source.byte_size > config.max_bytes {
        reasons.push(ValidationError::TooLarge {
            actual: source.byte_size,
            limit: config.max_bytes,
        });
    }
    reasons
}

pub fn check_dimensions(bytes: &[u8], limits: &DimensionLimits) -> Option<ValidationError> {
    let reader = match image::ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(err) => return Some(ValidationError::Undecodable(err.to_string())),
    };
    match reader.into_dimensions() {
        Ok((width, height)) => {
            (!limits.allows(width, height)).then_some(ValidationError::Dimensions { width, height })
        }
        Err(err) => Some(ValidationError::Undecodable(err.to_string())),
    }
}

/// Remaining gallery capacity caps how many leading files are even
/// considered; overflow files are rejected with a capacity reason only.
pub async fn validate_batch(
    sources: Vec<SourceFile>,
    current_count: usize,
    config: &ValidationConfig,
) -> BatchValidation {
    let capacity = config.max_count.saturating_sub(current_count);
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for (index, source) in sources.into_iter().enumerate() {
        if index >= capacity {
            rejected.push(RejectedFile {
                source,
                reasons: vec![ValidationError::CapacityExceeded {
                    max_count: config.max_count,
                }],
            });
            continue;
        }
        let reasons = validate(&source, config).await;
        if reasons.is_empty() {
            accepted.push(source);
        } else {
            rejected.push(RejectedFile { source, reasons });
        }
    }
    BatchValidation { accepted, rejected }
}
