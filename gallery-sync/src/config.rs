use gallery_core::RetryPolicy;

use crate::upload::compress::CompressionOptions;
use crate::upload::transport::UploadDestination;

pub const ALLOWED_IMAGE_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_MAX_COUNT: usize = 10;
const DEFAULT_COMPRESS_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionLimits {
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl DimensionLimits {
    pub fn allows(&self, width: u32, height: u32) -> bool {
        self.min_width.is_none_or(|min| width >= min)
            && self.min_height.is_none_or(|min| height >= min)
            && self.max_width.is_none_or(|max| width <= max)
            && self.max_height.is_none_or(|max| height <= max)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub allowed_types: Vec<String>,
    pub max_bytes: u64,
    pub max_count: usize,
    pub dimensions: Option<DimensionLimits>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_types: ALLOWED_IMAGE_TYPES.iter().map(|t| t.to_string()).collect(),
            max_bytes: read_u64_env("GALLERY_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            max_count: DEFAULT_MAX_COUNT,
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadQueueConfig {
    pub listing_id: String,
    pub destination: UploadDestination,
    pub max_concurrent: usize,
    pub compress_threshold_bytes: u64,
    pub compression: CompressionOptions,
    pub validation: ValidationConfig,
}

impl UploadQueueConfig {
    pub fn new(listing_id: impl Into<String>, destination: UploadDestination) -> Self {
        Self {
            listing_id: listing_id.into(),
            destination,
            max_concurrent: read_usize_env("GALLERY_UPLOAD_CONCURRENCY", DEFAULT_MAX_CONCURRENT),
            compress_threshold_bytes: DEFAULT_COMPRESS_THRESHOLD_BYTES,
            compression: CompressionOptions::default(),
            validation: ValidationConfig::default(),
        }
    }

    /// One transfer at a time, for single-image flows like the main slot.
    pub fn sequential(mut self) -> Self {
        self.max_concurrent = 1;
        self
    }
}

pub fn retry_policy_from_env() -> RetryPolicy {
    RetryPolicy {
        max_attempts: read_u32_env("GALLERY_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS),
        ..RetryPolicy::default()
    }
}

fn read_usize_env(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_u32_env(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
