pub mod config;
pub mod store;
pub mod upload;

pub use config::{DimensionLimits, UploadQueueConfig, ValidationConfig, retry_policy_from_env};
pub use store::backend::{ApiBackend, CommitBackend, LocalOnly};
pub use store::gallery::{GalleryImage, GalleryStore, StoreError};
pub use upload::compress::{CompressError, CompressionOptions, Compressor};
pub use upload::queue::{
    AddOutcome, BatchOutcome, EntryId, EntrySnapshot, EntryStatus, PreviewHandle, QueueError,
    UploadEvent, UploadQueue,
};
pub use upload::transport::{ApiTransport, TransferRequest, Transport, UploadDestination};
pub use upload::validate::{BatchValidation, RejectedFile, SourceFile, ValidationError};
