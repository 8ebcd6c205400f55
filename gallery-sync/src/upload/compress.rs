use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Options forwarded to the external compression collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionOptions {
    pub max_size_mb: f64,
    pub max_width_or_height: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 1.0,
            max_width_or_height: 1920,
        }
    }
}

#[derive(Debug, Error)]
#[error("compression failed: {0}")]
pub struct CompressError(pub String);

/// External collaborator. A failed compression is never fatal: the queue
/// logs a warning and uploads the original bytes.
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(
        &self,
        bytes: Bytes,
        options: &CompressionOptions,
    ) -> Result<Bytes, CompressError>;
}
