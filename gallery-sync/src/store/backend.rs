use async_trait::async_trait;
use gallery_core::{ApiError, GalleryClient, ReorderEntry};

use super::gallery::GalleryImage;

/// Remote side of an optimistic mutation. Each method is the commit for
/// one store operation; a failure rolls the local mutation back.
#[async_trait]
pub trait CommitBackend: Send + Sync {
    async fn commit_order(&self, ordered: &[ReorderEntry]) -> Result<(), ApiError>;
    async fn commit_main(&self, image_id: &str) -> Result<(), ApiError>;
    async fn commit_delete(&self, image: &GalleryImage) -> Result<(), ApiError>;
}

/// Backend for galleries with no remote side; every commit succeeds.
pub struct LocalOnly;

#[async_trait]
impl CommitBackend for LocalOnly {
    async fn commit_order(&self, _ordered: &[ReorderEntry]) -> Result<(), ApiError> {
        Ok(())
    }

    async fn commit_main(&self, _image_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn commit_delete(&self, _image: &GalleryImage) -> Result<(), ApiError> {
        Ok(())
    }
}

pub struct ApiBackend {
    client: GalleryClient,
    listing_id: String,
}

impl ApiBackend {
    pub fn new(client: GalleryClient, listing_id: impl Into<String>) -> Self {
        Self {
            client,
            listing_id: listing_id.into(),
        }
    }
}

#[async_trait]
impl CommitBackend for ApiBackend {
    async fn commit_order(&self, ordered: &[ReorderEntry]) -> Result<(), ApiError> {
        self.client.reorder_images(&self.listing_id, ordered).await
    }

    async fn commit_main(&self, image_id: &str) -> Result<(), ApiError> {
        self.client.set_main_image(&self.listing_id, image_id).await
    }

    async fn commit_delete(&self, image: &GalleryImage) -> Result<(), ApiError> {
        self.client.delete_image(&image.id).await
    }
}
