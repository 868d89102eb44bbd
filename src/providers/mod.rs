//! Bounded contracts with the external providers the pipeline drives.
//!
//! The core consumes only these traits; wire details live in `http` (and
//! in test fakes). Every implementation classifies failures before they
//! cross back into a handler: retryable (network, timeout, rate limit,
//! 5xx) versus fatal (auth, other 4xx, decode).

pub mod http;

use async_trait::async_trait;

use crate::error::KilnError;

/// One generated candidate image, bytes in hand.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// One image per call.
    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, KilnError>;
}

/// Poll result from the asynchronous 3D provider.
#[derive(Debug, Clone)]
pub enum ModelPoll {
    InProgress { progress: Option<u8> },
    Succeeded(ModelResult),
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct ModelResult {
    /// Archive (ZIP for OBJ) or single-file (GLB) payload.
    pub result_url: String,
    pub preview_url: String,
    /// Declared format, e.g. "OBJ" or "GLB"; sniffed from bytes when absent.
    pub format: Option<String>,
}

#[async_trait]
pub trait ModelGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Submit an asynchronous job; returns the provider's job id.
    async fn submit(&self, image_url: &str) -> Result<String, KilnError>;

    async fn poll(&self, provider_job_id: &str) -> Result<ModelPoll, KilnError>;

    /// Fetch a result or preview payload from a provider URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>, KilnError>;
}

#[async_trait]
pub trait PromptRefiner: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<String, KilnError>;

    /// Four style-variant prompts for one user prompt.
    async fn variants(&self, user: &str, system: &str) -> Result<[String; 4], KilnError>;
}

#[derive(Debug, Clone)]
pub struct SliceStatus {
    pub status: String,
    pub progress: Option<u8>,
    pub gcode_url: Option<String>,
}

#[async_trait]
pub trait Slicer: Send + Sync {
    async fn create_slice_task(
        &self,
        object_url: &str,
        file_name: &str,
    ) -> Result<String, KilnError>;

    async fn slice_task_status(&self, slice_task_id: &str) -> Result<SliceStatus, KilnError>;
}
