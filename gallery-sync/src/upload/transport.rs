use async_trait::async_trait;
use gallery_core::{
    ApiError, GalleryClient, ImageUpload, ProgressFn, RetryPolicy, UploadedImage,
    retry_with_backoff,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDestination {
    Main,
    Gallery,
    Variant { attribute_value: String },
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub listing_id: String,
    pub destination: UploadDestination,
    pub upload: ImageUpload,
}

/// One upload, settled. The queue injects this seam; tests swap it for
/// scripted implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransferRequest,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<UploadedImage, ApiError>;
}

pub struct ApiTransport {
    client: GalleryClient,
    policy: RetryPolicy,
}

impl ApiTransport {
    pub fn new(client: GalleryClient) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt(
        &self,
        request: TransferRequest,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<UploadedImage, ApiError> {
        let TransferRequest {
            listing_id,
            destination,
            upload,
        } = request;
        match destination {
            UploadDestination::Main => {
                self.client
                    .upload_main_image(&listing_id, upload, progress, cancel)
                    .await
            }
            UploadDestination::Gallery => {
                let mut images = self
                    .client
                    .upload_gallery_images(&listing_id, vec![upload], progress, cancel)
                    .await?;
                images.pop().ok_or(ApiError::MissingImage)
            }
            UploadDestination::Variant { attribute_value } => {
                let image = self
                    .client
                    .upload_variant_image(&listing_id, &attribute_value, upload, progress, cancel)
                    .await?;
                Ok(UploadedImage {
                    url: image.image_url,
                    public_id: image.public_id,
                })
            }
        }
    }
}

#[async_trait]
impl Transport for ApiTransport {
    async fn send(
        &self,
        request: TransferRequest,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<UploadedImage, ApiError> {
        retry_with_backoff(&self.policy, &cancel, |_| {
            self.attempt(request.clone(), progress.clone(), &cancel)
        })
        .await
    }
}
