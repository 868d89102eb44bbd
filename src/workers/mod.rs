//! Queue handlers driving the two generation phases.
//!
//! Payloads carry ids only: handlers re-read entity rows after claiming,
//! so a deleted request is discovered as a missing row and the job becomes
//! a successful no-op. Handlers write DB state before publishing the
//! matching event.

pub mod image;
pub mod model;

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageJobPayload {
    pub job_id: String,
    pub image_id: String,
    pub prompt: String,
    pub request_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelJobPayload {
    pub job_id: String,
    pub model_id: String,
    pub image_url: String,
    pub request_id: String,
    pub user_id: String,
}

/// Per-worker tunables lifted from `Config` at wiring time.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub proxy_base: String,
    pub job_timeout: Duration,
    pub backoff_base: Duration,
    pub storage_timeout: Duration,
    pub poll_interval: Duration,
}
