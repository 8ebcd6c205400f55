mod client;
mod retry;

pub use client::{
    ApiError, ApiErrorClass, GalleryClient, ImageUpload, ProgressFn, ReorderEntry, StaticToken,
    TokenSource, UploadedImage, VariantImage,
};
pub use retry::{RetryPolicy, retry_with_backoff};
