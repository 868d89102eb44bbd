//! Entity types for the generation pipeline.
//!
//! Entities are plain rows keyed by opaque UUID strings. The request/model/
//! image triangle is expressed through nullable id back-references, never
//! in-memory pointers; traversal always goes through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted prompt length, in chars.
pub const MAX_PROMPT_CHARS: usize = 500;

/// Number of candidate images generated per request.
pub const IMAGES_PER_REQUEST: u8 = 4;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    ImagePending,
    ImageGenerating,
    ImageCompleted,
    ImageFailed,
    ModelPending,
    ModelGenerating,
    ModelCompleted,
    ModelFailed,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPhase {
    ImageGeneration,
    AwaitingSelection,
    ModelGeneration,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

/// Lifecycle of one queued unit of work, mirrored onto the owning entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelSource {
    AiGenerated,
    UserUploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrintStatus {
    NotStarted,
    Slicing,
    SliceComplete,
    Printing,
    PrintComplete,
    Failed,
}

impl PrintStatus {
    /// Fixed progress map surfaced by the print-status read.
    pub fn progress(self) -> u8 {
        match self {
            Self::NotStarted | Self::Failed => 0,
            Self::Slicing => 30,
            Self::SliceComplete => 50,
            Self::Printing => 75,
            Self::PrintComplete => 100,
        }
    }
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($ty))),
                }
            }
        }
    };
}

str_enum!(RequestStatus {
    ImagePending => "IMAGE_PENDING",
    ImageGenerating => "IMAGE_GENERATING",
    ImageCompleted => "IMAGE_COMPLETED",
    ImageFailed => "IMAGE_FAILED",
    ModelPending => "MODEL_PENDING",
    ModelGenerating => "MODEL_GENERATING",
    ModelCompleted => "MODEL_COMPLETED",
    ModelFailed => "MODEL_FAILED",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

str_enum!(RequestPhase {
    ImageGeneration => "IMAGE_GENERATION",
    AwaitingSelection => "AWAITING_SELECTION",
    ModelGeneration => "MODEL_GENERATION",
    Completed => "COMPLETED",
});

str_enum!(ImageStatus {
    Pending => "PENDING",
    Generating => "GENERATING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

str_enum!(JobStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Retrying => "RETRYING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    Timeout => "TIMEOUT",
});

str_enum!(ModelSource {
    AiGenerated => "AI_GENERATED",
    UserUploaded => "USER_UPLOADED",
});

str_enum!(Visibility {
    Private => "PRIVATE",
    Public => "PUBLIC",
});

str_enum!(PrintStatus {
    NotStarted => "NOT_STARTED",
    Slicing => "SLICING",
    SliceComplete => "SLICE_COMPLETE",
    Printing => "PRINTING",
    PrintComplete => "PRINT_COMPLETE",
    Failed => "FAILED",
});

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Parent of a generation: one prompt, four candidate images, at most one
/// model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub external_user_id: String,
    pub original_prompt: String,
    pub status: RequestStatus,
    pub phase: RequestPhase,
    pub selected_image_index: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(external_user_id: &str, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            external_user_id: external_user_id.to_string(),
            original_prompt: prompt.to_string(),
            status: RequestStatus::ImagePending,
            phase: RequestPhase::ImageGeneration,
            selected_image_index: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One of the four candidate artifacts for a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub request_id: String,
    pub index: u8,
    pub image_url: Option<String>,
    /// Per-variant refined prompt, filled by the async refinement task.
    pub image_prompt: Option<String>,
    pub image_status: ImageStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Image {
    pub fn new(request_id: &str, index: u8) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            request_id: request_id.to_string(),
            index,
            image_url: None,
            image_prompt: None,
            image_status: ImageStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Retry/timeout bookkeeping for one image's generation work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJob {
    pub id: String,
    pub image_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub provider_name: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageJob {
    pub fn new(image_id: &str, priority: i32, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            image_id: image_id.to_string(),
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            timeout_at: None,
            provider_name: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The 3D artifact produced from a chosen image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub external_user_id: String,
    pub source: ModelSource,
    pub request_id: Option<String>,
    pub source_image_id: Option<String>,
    pub name: String,
    pub model_url: Option<String>,
    pub mtl_url: Option<String>,
    pub texture_url: Option<String>,
    pub preview_image_url: Option<String>,
    pub format: String,
    pub file_size: Option<u64>,
    pub visibility: Visibility,
    pub published_at: Option<DateTime<Utc>>,
    pub view_count: u64,
    pub like_count: u64,
    pub favorite_count: u64,
    pub download_count: u64,
    pub slice_task_id: Option<String>,
    pub print_status: PrintStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Model {
    /// A model generated from a request's chosen image. Published on
    /// creation so it appears in public listings as soon as it completes.
    pub fn from_selection(
        external_user_id: &str,
        request_id: &str,
        source_image_id: &str,
        prompt: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            external_user_id: external_user_id.to_string(),
            source: ModelSource::AiGenerated,
            request_id: Some(request_id.to_string()),
            source_image_id: Some(source_image_id.to_string()),
            name: derive_model_name(prompt),
            model_url: None,
            mtl_url: None,
            texture_url: None,
            preview_image_url: None,
            format: "OBJ".to_string(),
            file_size: None,
            visibility: Visibility::Public,
            published_at: Some(now),
            view_count: 0,
            like_count: 0,
            favorite_count: 0,
            download_count: 0,
            slice_task_id: None,
            print_status: PrintStatus::NotStarted,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        }
    }
}

/// ImageJob plus polled progress for the asynchronous 3D provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelJob {
    pub id: String,
    pub model_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub provider_name: Option<String>,
    pub provider_job_id: Option<String>,
    /// Monotonically non-decreasing within one job instance.
    pub progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelJob {
    pub fn new(model_id: &str, priority: i32, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            model_id: model_id.to_string(),
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            timeout_at: None,
            provider_name: None,
            provider_job_id: None,
            progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A storage key whose DB row is gone but whose blob may remain.
/// Created when entity deletion succeeds and storage deletion fails.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedFile {
    pub id: String,
    pub s3_key: String,
    pub request_id: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl OrphanedFile {
    pub fn new(s3_key: &str, request_id: &str, last_error: Option<String>) -> Self {
        Self {
            id: new_id(),
            s3_key: s3_key.to_string(),
            request_id: request_id.to_string(),
            retry_count: 0,
            last_error,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

/// Consistent read of a request with its children: the `task:init` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub request: Request,
    pub images: Vec<Image>,
    pub model: Option<Model>,
}

/// Model name from the prompt prefix, trimmed at a char boundary.
pub fn derive_model_name(prompt: &str) -> String {
    const MAX_NAME_CHARS: usize = 60;
    let trimmed = prompt.trim();
    match trimmed.char_indices().nth(MAX_NAME_CHARS) {
        Some((byte_idx, _)) => trimmed[..byte_idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}
