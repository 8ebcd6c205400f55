use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::stream;
use reqwest::{Body, Client, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_MAX_BATCH_FILES: usize = 10;
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("batch of {given} files exceeds the {limit}-file upload limit")]
    BatchTooLarge { given: usize, limit: usize },
    #[error("api response did not include the uploaded image")]
    MissingImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            // Network-level failures (refused, reset, timed out) are worth
            // another attempt; everything the server explicitly rejected is
            // judged by its status code.
            ApiError::Request(_) => true,
            ApiError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    pub fn user_message(&self) -> String {
        match self {
            ApiError::Api { status, .. } => match status.as_u16() {
                400 => "the server rejected the image as invalid input".to_string(),
                401 => "you are not signed in; sign in and try again".to_string(),
                403 => "you do not have permission to manage images for this listing".to_string(),
                413 => "the image is too large for the server to accept".to_string(),
                _ => format!("the image service returned an unexpected error ({status})"),
            },
            ApiError::Request(_) => "a network error interrupted the transfer".to_string(),
            ApiError::Cancelled => "the upload was cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Clone)]
pub struct GalleryClient {
    http: Client,
    base_url: Url,
    token: Option<Arc<dyn TokenSource>>,
    max_batch_files: usize,
}

impl GalleryClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: None,
            max_batch_files: DEFAULT_MAX_BATCH_FILES,
        })
    }

    pub fn with_token_source(
        base_url: &str,
        token: Arc<dyn TokenSource>,
    ) -> Result<Self, ApiError> {
        let mut client = Self::new(base_url)?;
        client.token = Some(token);
        Ok(client)
    }

    pub fn with_static_token(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_token_source(base_url, Arc::new(StaticToken::new(token)))
    }

    pub fn max_batch_files(mut self, limit: usize) -> Self {
        self.max_batch_files = limit.max(1);
        self
    }

    pub async fn upload_main_image(
        &self,
        listing_id: &str,
        upload: ImageUpload,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<UploadedImage, ApiError> {
        let url = self.endpoint(&format!("/v1/listings/{listing_id}/images/main"))?;
        let total = (upload.bytes.len() as u64).max(1);
        let sent = Arc::new(AtomicU64::new(0));
        let form = multipart::Form::new().part("file", stream_part(upload, total, sent, progress)?);
        let request = self.authorized(self.http.post(url)).multipart(form);
        self.send_cancellable(request, cancel).await
    }

    pub async fn upload_gallery_images(
        &self,
        listing_id: &str,
        uploads: Vec<ImageUpload>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadedImage>, ApiError> {
        if uploads.len() > self.max_batch_files {
            return Err(ApiError::BatchTooLarge {
                given: uploads.len(),
                limit: self.max_batch_files,
            });
        }
        if uploads.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint(&format!("/v1/listings/{listing_id}/images"))?;
        let total: u64 = uploads.iter().map(|u| u.bytes.len() as u64).sum();
        let total = total.max(1);
        let sent = Arc::new(AtomicU64::new(0));
        let mut form = multipart::Form::new();
        for upload in uploads {
            form = form.part(
                "files",
                stream_part(upload, total, Arc::clone(&sent), progress.clone())?,
            );
        }
        let request = self.authorized(self.http.post(url)).multipart(form);
        self.send_cancellable(request, cancel).await
    }

    pub async fn upload_variant_image(
        &self,
        listing_id: &str,
        attribute_value: &str,
        upload: ImageUpload,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<VariantImage, ApiError> {
        let mut url = self.endpoint(&format!("/v1/listings/{listing_id}/images/variant"))?;
        url.query_pairs_mut().append_pair("value", attribute_value);
        let total = (upload.bytes.len() as u64).max(1);
        let sent = Arc::new(AtomicU64::new(0));
        let form = multipart::Form::new().part("file", stream_part(upload, total, sent, progress)?);
        let request = self.authorized(self.http.post(url)).multipart(form);
        self.send_cancellable(request, cancel).await
    }

    /// Deleting an image that is already gone is treated as success.
    pub async fn delete_image(&self, public_id: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint("/v1/images")?;
        url.query_pairs_mut().append_pair("publicId", public_id);
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::handle_empty(response).await
    }

    pub async fn reorder_images(
        &self,
        listing_id: &str,
        ordered: &[ReorderEntry],
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/listings/{listing_id}/images/order"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(ordered)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn set_main_image(&self, listing_id: &str, image_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/listings/{listing_id}/images/main"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(&SetMainRequest { image_id })
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // A missing credential never blocks the request; the server answers
        // 401 and that classification propagates to the caller.
        match self.token.as_ref().and_then(|source| source.bearer_token()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn send_cancellable<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            response = request.send() => Self::handle_response(response?).await,
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ApiError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }
}

fn stream_part(
    upload: ImageUpload,
    total: u64,
    sent: Arc<AtomicU64>,
    progress: Option<ProgressFn>,
) -> Result<multipart::Part, ApiError> {
    let len = upload.bytes.len() as u64;
    let body = stream::unfold(upload.bytes, move |mut remaining| {
        let sent = Arc::clone(&sent);
        let progress = progress.clone();
        async move {
            if remaining.is_empty() {
                return None;
            }
            let take = remaining.len().min(UPLOAD_CHUNK_BYTES);
            let chunk = remaining.split_to(take);
            let done = sent.fetch_add(take as u64, Ordering::Relaxed) + take as u64;
            if let Some(report) = &progress {
                report(((done * 100) / total).min(100) as u8);
            }
            Some((Ok::<_, io::Error>(chunk), remaining))
        }
    });
    let part = multipart::Part::stream_with_length(Body::wrap_stream(body), len)
        .file_name(upload.file_name)
        .mime_str(&upload.mime_type)?;
    Ok(part)
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub url: String,
    pub public_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantImage {
    pub id: String,
    pub attribute_value: String,
    pub image_url: String,
    pub public_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderEntry {
    pub image_id: String,
    pub display_order: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetMainRequest<'a> {
    image_id: &'a str,
}
