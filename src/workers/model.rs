//! Model worker: asynchronous 3D generation with progress polling,
//! archive unpacking, and multi-part upload.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{Envelope, EventBus, EventType};
use crate::db::fmt_ts;
use crate::error::KilnError;
use crate::model::{Model, ModelJob};
use crate::providers::{ModelGenerator, ModelPoll, ModelResult};
use crate::queue::{ClaimedJob, HandlerOutcome, JobHandler, backoff};
use crate::storage::{ObjectStore, content_type_for, model_key, proxy_url};
use crate::store::{ModelCompletion, Store};
use crate::unpack::{is_zip, unpack_obj_archive};
use crate::workers::{ModelJobPayload, WorkerSettings};

/// Consecutive poll failures tolerated before the attempt is retried.
const MAX_POLL_FAILURES: u32 = 5;

pub struct ModelWorker {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStore>,
    provider: Arc<dyn ModelGenerator>,
    bus: Arc<dyn EventBus>,
    settings: WorkerSettings,
}

impl ModelWorker {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStore>,
        provider: Arc<dyn ModelGenerator>,
        bus: Arc<dyn EventBus>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            storage,
            provider,
            bus,
            settings,
        }
    }

    async fn load(&self, payload: &ModelJobPayload) -> Result<Option<(ModelJob, Model)>, KilnError> {
        let Some(job) = self.store.find_model_job(&payload.job_id).await? else {
            return Ok(None);
        };
        let Some(model) = self.store.find_model(&payload.model_id).await? else {
            return Ok(None);
        };
        Ok(Some((job, model)))
    }

    async fn run(
        &self,
        payload: &ModelJobPayload,
        claimed: &ClaimedJob,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, KilnError> {
        let Some((job, model)) = self.load(payload).await? else {
            tracing::info!(job_key = claimed.job_key, "model rows gone: job cancelled");
            return Ok(HandlerOutcome::Success);
        };

        let timeout_at = Utc::now()
            + chrono::Duration::from_std(self.settings.job_timeout).unwrap_or_default();
        self.store
            .model_job_running(&job.id, &payload.request_id, self.provider.name(), timeout_at)
            .await?;

        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ModelGenerating,
                json!({ "modelId": model.id }),
            ))
            .await;

        match self.drive(payload, &job, &model, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.handle_failure(payload, &model, &job, claimed, err).await,
        }
    }

    /// Submit (or resume), poll to completion, then persist the artifacts.
    async fn drive(
        &self,
        payload: &ModelJobPayload,
        job: &ModelJob,
        model: &Model,
        cancel: &CancellationToken,
    ) -> Result<HandlerOutcome, KilnError> {
        // A retried attempt resumes the provider job it already submitted;
        // re-submitting would orphan the first job and restart progress.
        let provider_job_id = match &job.provider_job_id {
            Some(existing) => existing.clone(),
            None => {
                let submitted = self.provider.submit(&payload.image_url).await?;
                self.store.set_provider_job_id(&job.id, &submitted).await?;
                tracing::info!(
                    model_id = model.id,
                    provider_job_id = submitted,
                    "3D job submitted"
                );
                submitted
            }
        };

        let Some(result) = self.poll_until_done(payload, job, &provider_job_id, cancel).await?
        else {
            tracing::info!(model_id = model.id, "model deleted mid-poll: job no-op");
            return Ok(HandlerOutcome::Success);
        };

        let archive = self.provider.download(&result.result_url).await?;
        let declared_obj = result
            .format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("obj"));

        let (model_url, mtl_url, texture_url, format, file_size) =
            if is_zip(&archive) || declared_obj {
                self.upload_obj_parts(&model.id, &archive).await?
            } else {
                let format = result
                    .format
                    .clone()
                    .unwrap_or_else(|| "GLB".to_string())
                    .to_uppercase();
                let key = model_key(&model.id, &format!("model.{}", format.to_lowercase()));
                let size = archive.len() as u64;
                let url = self.upload(&key, archive).await?;
                (url, None, None, format, size)
            };

        let preview_bytes = self.provider.download(&result.preview_url).await?;
        let preview_key = model_key(&model.id, "preview.png");
        let preview_url = self.upload(&preview_key, preview_bytes).await?;

        let Some(completed_at) = self
            .store
            .complete_model(ModelCompletion {
                model_id: model.id.clone(),
                job_id: job.id.clone(),
                request_id: payload.request_id.clone(),
                model_url: model_url.clone(),
                mtl_url: mtl_url.clone(),
                texture_url: texture_url.clone(),
                preview_image_url: preview_url.clone(),
                format: format.clone(),
                file_size: Some(file_size),
            })
            .await?
        else {
            tracing::info!(model_id = model.id, "model deleted mid-flight: job no-op");
            return Ok(HandlerOutcome::Success);
        };

        let proxy = |kind: &str, url: &str| proxy_url(&self.settings.proxy_base, kind, url);
        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ModelCompleted,
                json!({
                    "modelId": model.id,
                    "modelUrl": proxy("model", &model_url),
                    "mtlUrl": mtl_url.as_deref().map(|u| proxy("model", u)),
                    "textureUrl": texture_url.as_deref().map(|u| proxy("model", u)),
                    "previewImageUrl": proxy("image", &preview_url),
                    "format": format,
                    "completedAt": fmt_ts(completed_at),
                }),
            ))
            .await;
        self.bus
            .publish(Envelope::task_updated(
                &payload.request_id,
                "MODEL_COMPLETED",
                "COMPLETED",
            ))
            .await;

        tracing::info!(
            request_id = payload.request_id,
            model_id = model.id,
            format = format,
            "model generated"
        );
        Ok(HandlerOutcome::Success)
    }

    /// Poll the provider until a terminal result, publishing monotonic
    /// progress along the way. The queue's job timeout bounds the loop.
    /// Returns None when the job row disappears: the request was deleted
    /// while the job was polling, and no further `model:*` events may go
    /// out.
    async fn poll_until_done(
        &self,
        payload: &ModelJobPayload,
        job: &ModelJob,
        provider_job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ModelResult>, KilnError> {
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(KilnError::Timeout(
                        self.settings.job_timeout.as_millis() as u64,
                    ));
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            if self.store.find_model_job(&job.id).await?.is_none() {
                return Ok(None);
            }

            let poll = match self.provider.poll(provider_job_id).await {
                Ok(poll) => {
                    consecutive_failures = 0;
                    poll
                }
                Err(err) if err.retryable() => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        provider_job_id,
                        failures = consecutive_failures,
                        "model poll failed: {err}"
                    );
                    if consecutive_failures >= MAX_POLL_FAILURES {
                        return Err(err);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            match poll {
                ModelPoll::InProgress { progress } => {
                    if let Some(progress) = progress {
                        // Only an actual increase is stored and published.
                        let published =
                            self.store.raise_model_progress(&job.id, progress).await?;
                        if let Some(published) = published {
                            self.bus
                                .publish(Envelope::new(
                                    &payload.request_id,
                                    EventType::ModelProgress,
                                    json!({ "modelId": job.model_id, "progress": published }),
                                ))
                                .await;
                        }
                    }
                }
                ModelPoll::Succeeded(result) => return Ok(Some(result)),
                ModelPoll::Failed { message } => {
                    return Err(KilnError::Upstream {
                        provider: self.provider.name().to_string(),
                        message,
                        status: None,
                    });
                }
            }
        }
    }

    /// Unpack the OBJ archive and upload its parts under stable names.
    async fn upload_obj_parts(
        &self,
        model_id: &str,
        archive: &[u8],
    ) -> Result<(String, Option<String>, Option<String>, String, u64), KilnError> {
        let unpacked = unpack_obj_archive(archive)?;
        let file_size = unpacked.obj.len() as u64;

        let obj_key = model_key(model_id, "model.obj");
        let model_url = self.upload(&obj_key, unpacked.obj).await?;

        let mtl_url = match unpacked.mtl {
            Some(bytes) => {
                let key = model_key(model_id, "material.mtl");
                Some(self.upload(&key, bytes).await?)
            }
            None => None,
        };

        let texture_url = match unpacked.texture {
            Some((bytes, ext)) => {
                let key = model_key(model_id, &format!("material.{ext}"));
                Some(self.upload(&key, bytes).await?)
            }
            None => None,
        };

        Ok((model_url, mtl_url, texture_url, "OBJ".to_string(), file_size))
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String, KilnError> {
        tokio::time::timeout(
            self.settings.storage_timeout,
            self.storage.upload(key, bytes, content_type_for(key)),
        )
        .await
        .map_err(|_| KilnError::Timeout(self.settings.storage_timeout.as_millis() as u64))?
    }

    async fn handle_failure(
        &self,
        payload: &ModelJobPayload,
        model: &Model,
        job: &ModelJob,
        claimed: &ClaimedJob,
        err: KilnError,
    ) -> Result<HandlerOutcome, KilnError> {
        // The row may have vanished mid-flight (request deleted): no-op.
        if self.store.find_model(&model.id).await?.is_none() {
            return Ok(HandlerOutcome::Success);
        }

        if err.retryable() && claimed.attempt < claimed.attempts_max {
            let delay = backoff(self.settings.backoff_base, claimed.attempt);
            let next_retry = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store
                .retry_model_job(&job.id, next_retry, &err.user_message())
                .await?;
            return Ok(HandlerOutcome::Retry(err));
        }

        self.fail_terminal(payload, model, job, &err.user_message(), matches!(err, KilnError::Timeout(_)))
            .await?;
        Ok(HandlerOutcome::Fatal(err))
    }

    async fn fail_terminal(
        &self,
        payload: &ModelJobPayload,
        model: &Model,
        job: &ModelJob,
        message: &str,
        timed_out: bool,
    ) -> Result<(), KilnError> {
        self.store
            .fail_model(&model.id, &job.id, &payload.request_id, message, timed_out)
            .await?;
        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ModelFailed,
                json!({ "modelId": model.id, "errorMessage": message }),
            ))
            .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for ModelWorker {
    async fn handle(&self, job: &ClaimedJob, cancel: &CancellationToken) -> HandlerOutcome {
        let payload: ModelJobPayload = match serde_json::from_str(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return HandlerOutcome::Fatal(KilnError::Parse(format!(
                    "undecodable model payload: {e}"
                )));
            }
        };

        match self.run(&payload, job, cancel).await {
            Ok(outcome) => outcome,
            Err(err) if err.retryable() => HandlerOutcome::Retry(err),
            Err(err) => HandlerOutcome::Fatal(err),
        }
    }

    async fn dead_letter(&self, job: &ClaimedJob, message: &str) {
        let Ok(payload) = serde_json::from_str::<ModelJobPayload>(&job.payload) else {
            return;
        };
        let rows = match self.load(&payload).await {
            Ok(Some(rows)) => rows,
            _ => return,
        };
        let timed_out = message.starts_with("timed out");
        if let Err(e) = self
            .fail_terminal(&payload, &rows.1, &rows.0, message, timed_out)
            .await
        {
            tracing::error!(
                job_key = job.job_key,
                "failed to finalize dead-lettered model job: {e}"
            );
        }
    }
}
