//! Image worker: one external image call per job, upload, state fan-in.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{Envelope, EventBus, EventType};
use crate::db::fmt_ts;
use crate::error::KilnError;
use crate::model::{Image, ImageJob};
use crate::providers::ImageGenerator;
use crate::queue::{ClaimedJob, HandlerOutcome, JobHandler, backoff};
use crate::storage::{ObjectStore, ext_for_content_type, image_key, proxy_url};
use crate::store::{PhaseTransition, Store};
use crate::workers::{ImageJobPayload, WorkerSettings};

pub struct ImageWorker {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStore>,
    provider: Arc<dyn ImageGenerator>,
    bus: Arc<dyn EventBus>,
    settings: WorkerSettings,
}

impl ImageWorker {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStore>,
        provider: Arc<dyn ImageGenerator>,
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

    /// Load the job and image rows; `None` means the parent request was
    /// deleted and the job is a no-op.
    async fn load(&self, payload: &ImageJobPayload) -> Result<Option<(ImageJob, Image)>, KilnError> {
        let Some(job) = self.store.find_image_job(&payload.job_id).await? else {
            return Ok(None);
        };
        let Some(image) = self.store.find_image(&payload.image_id).await? else {
            return Ok(None);
        };
        Ok(Some((job, image)))
    }

    async fn run(
        &self,
        payload: &ImageJobPayload,
        claimed: &ClaimedJob,
    ) -> Result<HandlerOutcome, KilnError> {
        let Some((job, image)) = self.load(payload).await? else {
            tracing::info!(job_key = claimed.job_key, "image rows gone: job cancelled");
            return Ok(HandlerOutcome::Success);
        };

        let prompt = image
            .image_prompt
            .clone()
            .unwrap_or_else(|| payload.prompt.clone());

        let timeout_at = Utc::now()
            + chrono::Duration::from_std(self.settings.job_timeout).unwrap_or_default();
        self.store
            .image_job_running(
                &job.id,
                &image.id,
                &payload.request_id,
                self.provider.name(),
                timeout_at,
            )
            .await?;

        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ImageGenerating,
                json!({
                    "imageId": image.id,
                    "index": image.index,
                    "prompt": prompt,
                }),
            ))
            .await;

        let generated = match self.provider.generate(&prompt).await {
            Ok(generated) => generated,
            Err(err) => return self.handle_failure(payload, &image, &job, claimed, err).await,
        };

        let key = image_key(&image.id, image.index, ext_for_content_type(&generated.content_type));
        let upload = tokio::time::timeout(
            self.settings.storage_timeout,
            self.storage.upload(
                &key,
                generated.bytes,
                crate::storage::content_type_for(&key),
            ),
        )
        .await
        .map_err(|_| KilnError::Timeout(self.settings.storage_timeout.as_millis() as u64))
        .and_then(|r| r);

        let image_url = match upload {
            Ok(url) => url,
            Err(err) => return self.handle_failure(payload, &image, &job, claimed, err).await,
        };

        let Some(completed_at) = self.store.complete_image(&image.id, &job.id, &image_url).await?
        else {
            // Row vanished mid-flight: request deleted, nothing to publish.
            tracing::info!(job_key = claimed.job_key, "image deleted mid-flight: job no-op");
            return Ok(HandlerOutcome::Success);
        };

        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ImageCompleted,
                json!({
                    "imageId": image.id,
                    "index": image.index,
                    "imageUrl": proxy_url(&self.settings.proxy_base, "image", &image_url),
                    "completedAt": fmt_ts(completed_at),
                }),
            ))
            .await;

        self.finish_phase(&payload.request_id).await?;

        tracing::info!(
            request_id = payload.request_id,
            image_id = image.id,
            index = image.index,
            "image generated"
        );
        Ok(HandlerOutcome::Success)
    }

    /// Classify a failure mid-handler: retryable goes back to the queue
    /// with the entity in RETRYING; fatal (or exhausted budget) pushes the
    /// image terminal and emits `image:failed`.
    async fn handle_failure(
        &self,
        payload: &ImageJobPayload,
        image: &Image,
        job: &ImageJob,
        claimed: &ClaimedJob,
        err: KilnError,
    ) -> Result<HandlerOutcome, KilnError> {
        // The row may have vanished mid-flight (request deleted): no-op.
        if self.store.find_image(&image.id).await?.is_none() {
            return Ok(HandlerOutcome::Success);
        }

        if err.retryable() && claimed.attempt < claimed.attempts_max {
            let delay = backoff(self.settings.backoff_base, claimed.attempt);
            let next_retry = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store
                .retry_image_job(&job.id, next_retry, &err.user_message())
                .await?;
            return Ok(HandlerOutcome::Retry(err));
        }

        self.fail_terminal(payload, image, job, &err.user_message(), matches!(err, KilnError::Timeout(_)))
            .await?;
        Ok(HandlerOutcome::Fatal(err))
    }

    async fn fail_terminal(
        &self,
        payload: &ImageJobPayload,
        image: &Image,
        job: &ImageJob,
        message: &str,
        timed_out: bool,
    ) -> Result<(), KilnError> {
        self.store.fail_image(&image.id, &job.id, message, timed_out).await?;
        self.bus
            .publish(Envelope::new(
                &payload.request_id,
                EventType::ImageFailed,
                json!({
                    "imageId": image.id,
                    "index": image.index,
                    "errorMessage": message,
                }),
            ))
            .await;
        self.finish_phase(&payload.request_id).await
    }

    /// Re-read the request's four images; whoever's conditional update wins
    /// publishes the phase transition.
    async fn finish_phase(&self, request_id: &str) -> Result<(), KilnError> {
        match self.store.finish_image_phase(request_id).await? {
            Some(PhaseTransition::Completed) => {
                self.bus
                    .publish(Envelope::task_updated(
                        request_id,
                        "IMAGE_COMPLETED",
                        "AWAITING_SELECTION",
                    ))
                    .await;
            }
            Some(PhaseTransition::Failed) => {
                self.bus
                    .publish(Envelope::task_updated(
                        request_id,
                        "IMAGE_FAILED",
                        "IMAGE_GENERATION",
                    ))
                    .await;
            }
            None => {}
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for ImageWorker {
    async fn handle(&self, job: &ClaimedJob, _cancel: &CancellationToken) -> HandlerOutcome {
        let payload: ImageJobPayload = match serde_json::from_str(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return HandlerOutcome::Fatal(KilnError::Parse(format!(
                    "undecodable image payload: {e}"
                )));
            }
        };

        match self.run(&payload, job).await {
            Ok(outcome) => outcome,
            Err(err) if err.retryable() => HandlerOutcome::Retry(err),
            Err(err) => HandlerOutcome::Fatal(err),
        }
    }

    async fn dead_letter(&self, job: &ClaimedJob, message: &str) {
        let Ok(payload) = serde_json::from_str::<ImageJobPayload>(&job.payload) else {
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
                "failed to finalize dead-lettered image job: {e}"
            );
        }
    }
}
