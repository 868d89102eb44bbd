//! Request orchestration: the only component that mutates more than one
//! entity atomically on behalf of a request.

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::error::KilnError;
use crate::model::{
    IMAGES_PER_REQUEST, Image, ImageJob, MAX_PROMPT_CHARS, Model, ModelJob, OrphanedFile,
    PrintStatus, Request, RequestPhase, RequestSnapshot,
};
use crate::providers::{PromptRefiner, Slicer};
use crate::queue::{EnqueueOptions, JobQueue, QueueName};
use crate::storage::{ObjectStore, key_from_url};
use crate::store::Store;
use crate::workers::{ImageJobPayload, ModelJobPayload};

/// Summary returned by `delete_request`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub images_deleted: u32,
    pub model_deleted: bool,
    pub storage_failures: u32,
}

/// Print-status read: progress comes from the fixed per-status map.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintStatusView {
    pub print_status: PrintStatus,
    pub slice_task_id: Option<String>,
    pub progress: u8,
}

pub struct RequestService {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStore>,
    queue: Arc<JobQueue>,
    refiner: Option<Arc<dyn PromptRefiner>>,
    slicer: Option<Arc<dyn Slicer>>,
    job_attempts: u32,
    backoff_base: std::time::Duration,
    storage_timeout: std::time::Duration,
    storage_public_base: String,
}

impl RequestService {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStore>,
        queue: Arc<JobQueue>,
        refiner: Option<Arc<dyn PromptRefiner>>,
        slicer: Option<Arc<dyn Slicer>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
            refiner,
            slicer,
            job_attempts: config.job_attempts,
            backoff_base: config.backoff_base,
            storage_timeout: config.storage_timeout,
            storage_public_base: config.storage_public_base.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a request with its four pending images and jobs in one
    /// transaction, then kick off the prompt-variant side-task.
    ///
    /// The side-task is fire-and-forget: the durable PENDING rows exist
    /// before it is scheduled, so a crashed side-task loses no
    /// client-visible state, and creation latency is decoupled from LLM
    /// latency.
    pub async fn create_request(
        self: &Arc<Self>,
        external_user_id: &str,
        prompt: &str,
    ) -> Result<Request, KilnError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(KilnError::Validation("prompt must not be empty".to_string()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(KilnError::Validation(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }

        let request = Request::new(external_user_id, prompt);
        let images: Vec<Image> = (0..IMAGES_PER_REQUEST)
            .map(|index| Image::new(&request.id, index))
            .collect();
        let jobs: Vec<ImageJob> = images
            .iter()
            .map(|image| ImageJob::new(&image.id, 0, self.job_attempts))
            .collect();

        self.store
            .insert_request_graph(request.clone(), images.clone(), jobs.clone())
            .await?;

        tracing::info!(
            request_id = request.id,
            user_id = external_user_id,
            "request created"
        );

        let service = self.clone();
        let side_request = request.clone();
        tokio::spawn(async move {
            service.refine_and_enqueue(side_request, images, jobs).await;
        });

        Ok(request)
    }

    /// The prompt-variant side-task: one LLM call for four style variants,
    /// degrading to the original prompt when the LLM is unavailable or
    /// fails. Always enqueues all four image jobs.
    async fn refine_and_enqueue(&self, request: Request, images: Vec<Image>, jobs: Vec<ImageJob>) {
        let variants = match &self.refiner {
            Some(refiner) => match refiner.variants(&request.original_prompt, "").await {
                Ok(variants) => variants.to_vec(),
                Err(e) => {
                    tracing::warn!(
                        request_id = request.id,
                        "prompt refinement failed, using original prompt: {e}"
                    );
                    vec![request.original_prompt.clone(); IMAGES_PER_REQUEST as usize]
                }
            },
            None => vec![request.original_prompt.clone(); IMAGES_PER_REQUEST as usize],
        };

        for ((image, job), variant) in images.iter().zip(&jobs).zip(&variants) {
            if let Err(e) = self.store.set_image_prompt(&image.id, variant).await {
                tracing::warn!(image_id = image.id, "failed to store variant prompt: {e}");
            }

            let payload = ImageJobPayload {
                job_id: job.id.clone(),
                image_id: image.id.clone(),
                prompt: variant.clone(),
                request_id: request.id.clone(),
                user_id: request.external_user_id.clone(),
            };
            let encoded = match serde_json::to_string(&payload) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!(image_id = image.id, "payload encoding failed: {e}");
                    continue;
                }
            };
            if let Err(e) = self
                .queue
                .enqueue(
                    QueueName::Image,
                    &job.id,
                    &request.id,
                    &encoded,
                    EnqueueOptions {
                        priority: 0,
                        attempts: self.job_attempts,
                        backoff_base: self.backoff_base,
                    },
                )
                .await
            {
                tracing::error!(image_id = image.id, "failed to enqueue image job: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Pick one completed candidate and start model generation. Idempotency
    /// guard: a second call for the same request returns InvalidState and
    /// leaves state untouched.
    pub async fn select_image_and_generate_model(
        &self,
        request_id: &str,
        index: u8,
    ) -> Result<Model, KilnError> {
        if index >= IMAGES_PER_REQUEST {
            return Err(KilnError::Validation(format!(
                "index must be 0..{}",
                IMAGES_PER_REQUEST - 1
            )));
        }

        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("request".to_string()))?;

        let images = self.store.images_for_request(request_id).await?;
        let image = images
            .iter()
            .find(|i| i.index == index)
            .ok_or_else(|| KilnError::NotFound("image".to_string()))?;
        let image_url = image
            .image_url
            .clone()
            .ok_or_else(|| KilnError::InvalidState(format!("image {index} is not completed")))?;

        let model = Model::from_selection(
            &request.external_user_id,
            request_id,
            &image.id,
            &request.original_prompt,
        );
        let job = ModelJob::new(&model.id, 0, self.job_attempts);

        // The transaction re-validates phase, image state, and the
        // one-model-per-request guard against current rows.
        self.store
            .select_image(request_id, index, model.clone(), job.clone())
            .await?;

        let payload = ModelJobPayload {
            job_id: job.id.clone(),
            model_id: model.id.clone(),
            image_url,
            request_id: request_id.to_string(),
            user_id: request.external_user_id.clone(),
        };
        self.queue
            .enqueue(
                QueueName::Model,
                &job.id,
                request_id,
                &serde_json::to_string(&payload)
                    .map_err(|e| KilnError::Parse(format!("payload encoding: {e}")))?,
                EnqueueOptions {
                    priority: 0,
                    attempts: self.job_attempts,
                    backoff_base: self.backoff_base,
                },
            )
            .await?;

        tracing::info!(request_id, index, model_id = model.id, "image selected");
        Ok(model)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Delete a request and all owned artifacts. Storage deletions are
    /// best-effort; every failed key becomes an orphan row for the sweeper.
    pub async fn delete_request(&self, request_id: &str) -> Result<DeleteOutcome, KilnError> {
        self.store
            .find_request(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("request".to_string()))?;

        let images = self.store.images_for_request(request_id).await?;
        let model = self.store.find_model_by_request(request_id).await?;

        let mut keys: Vec<String> = Vec::new();
        for image in &images {
            if let Some(url) = &image.image_url
                && let Some(key) = key_from_url(&self.storage_public_base, url)
            {
                keys.push(key.to_string());
            }
        }
        if let Some(model) = &model {
            for url in [
                &model.model_url,
                &model.mtl_url,
                &model.texture_url,
                &model.preview_image_url,
            ]
            .into_iter()
            .flatten()
            {
                if let Some(key) = key_from_url(&self.storage_public_base, url) {
                    keys.push(key.to_string());
                }
            }
        }

        let mut orphans: Vec<OrphanedFile> = Vec::new();
        for key in &keys {
            let deleted = tokio::time::timeout(self.storage_timeout, self.storage.delete(key))
                .await
                .map_err(|_| KilnError::Timeout(self.storage_timeout.as_millis() as u64))
                .and_then(|r| r);
            if let Err(e) = deleted {
                tracing::warn!(key, "storage deletion failed, recording orphan: {e}");
                orphans.push(OrphanedFile::new(key, request_id, Some(e.user_message())));
            }
        }

        let (images_deleted, model_deleted) = self.store.delete_request_rows(request_id).await?;
        let cancelled = self.queue.cancel_for_request(request_id).await?;
        let storage_failures = orphans.len() as u32;
        self.store.insert_orphans(orphans).await?;

        tracing::info!(
            request_id,
            images_deleted,
            model_deleted,
            cancelled_jobs = cancelled,
            storage_failures,
            "request deleted"
        );

        Ok(DeleteOutcome {
            images_deleted,
            model_deleted,
            storage_failures,
        })
    }

    // -----------------------------------------------------------------------
    // Printing
    // -----------------------------------------------------------------------

    /// Hand the finished model to the slicer. Re-submission is only allowed
    /// after a failed print.
    pub async fn submit_print_task(
        &self,
        request_id: &str,
        external_user_id: &str,
    ) -> Result<String, KilnError> {
        let request = self.owned_request(request_id, external_user_id).await?;
        if !matches!(
            request.phase,
            RequestPhase::ModelGeneration | RequestPhase::Completed
        ) {
            return Err(KilnError::InvalidState(format!(
                "request is in phase {}, expected MODEL_GENERATION or COMPLETED",
                request.phase.as_str()
            )));
        }

        let model = self
            .store
            .find_model_by_request(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("model".to_string()))?;
        let model_url = model
            .model_url
            .clone()
            .ok_or_else(|| KilnError::InvalidState("model has no file yet".to_string()))?;

        if model.slice_task_id.is_some() && model.print_status != PrintStatus::Failed {
            return Err(KilnError::InvalidState(
                "a slice task is already in flight".to_string(),
            ));
        }

        let slicer = self
            .slicer
            .as_ref()
            .ok_or_else(|| KilnError::InvalidState("no slicer configured".to_string()))?;
        let file_name = format!("{}.{}", model.name, model.format.to_lowercase());
        let slice_task_id = slicer.create_slice_task(&model_url, &file_name).await?;

        self.store.set_slice_task(&model.id, &slice_task_id).await?;

        tracing::info!(request_id, model_id = model.id, slice_task_id, "print submitted");
        Ok(slice_task_id)
    }

    pub async fn get_print_status(
        &self,
        request_id: &str,
        external_user_id: &str,
    ) -> Result<PrintStatusView, KilnError> {
        self.owned_request(request_id, external_user_id).await?;
        let model = self
            .store
            .find_model_by_request(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("model".to_string()))?;

        Ok(PrintStatusView {
            print_status: model.print_status,
            slice_task_id: model.slice_task_id,
            progress: model.print_status.progress(),
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_request(
        &self,
        request_id: &str,
        external_user_id: &str,
    ) -> Result<RequestSnapshot, KilnError> {
        self.owned_request(request_id, external_user_id).await?;
        self.store
            .request_snapshot(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("request".to_string()))
    }

    pub async fn list_requests(
        &self,
        external_user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Request>, KilnError> {
        self.store.list_requests(external_user_id, limit, offset).await
    }

    async fn owned_request(
        &self,
        request_id: &str,
        external_user_id: &str,
    ) -> Result<Request, KilnError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("request".to_string()))?;
        if request.external_user_id != external_user_id {
            return Err(KilnError::Forbidden(
                "request belongs to another user".to_string(),
            ));
        }
        Ok(request)
    }
}
