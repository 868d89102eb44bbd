//! Typed accessors over the embedded database.
//!
//! The store is the single writer of entity state. Every multi-row mutation
//! that crosses entities runs inside one transaction on the db worker
//! thread. `Option` is the normal "not found" result; integrity violations
//! surface as `KilnError::Integrity`.
//!
//! Reads that feed external consumers (snapshots, model listings) rewrite
//! storage URLs into client-facing proxy URLs; raw rows keep the originals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::db::{Db, fmt_ts, parse_ts, parse_ts_opt};
use crate::error::KilnError;
use crate::model::{
    Image, ImageJob, JobStatus, Model, ModelJob, OrphanedFile, PrintStatus, Request, RequestPhase,
    RequestSnapshot, RequestStatus,
};
use crate::storage::proxy_url;

/// Outcome of the image-phase fan-in check, made by whichever worker's
/// conditional update actually changed the request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Completed,
    Failed,
}

pub struct Store {
    db: Arc<Db>,
    proxy_base: String,
}

impl Store {
    pub fn new(db: Arc<Db>, proxy_base: impl Into<String>) -> Self {
        Self {
            db,
            proxy_base: proxy_base.into(),
        }
    }

    pub fn db(&self) -> Arc<Db> {
        self.db.clone()
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Insert a request with its four images and four image jobs atomically.
    pub async fn insert_request_graph(
        &self,
        request: Request,
        images: Vec<Image>,
        jobs: Vec<ImageJob>,
    ) -> Result<(), KilnError> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                insert_request(&tx, &request)?;
                for image in &images {
                    insert_image(&tx, image)?;
                }
                for job in &jobs {
                    insert_image_job(&tx, job)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn find_request(&self, id: &str) -> Result<Option<Request>, KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM requests WHERE id = ?1",
                    params![id],
                    row_to_request,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_requests(
        &self,
        external_user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Request>, KilnError> {
        let user = external_user_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM requests WHERE external_user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![user, limit, offset], row_to_request)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    /// Request + images + model in one consistent read, with URLs rewritten
    /// to proxy form. This is the `task:init` payload.
    pub async fn request_snapshot(&self, id: &str) -> Result<Option<RequestSnapshot>, KilnError> {
        let id = id.to_string();
        let proxy_base = self.proxy_base.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(request) = tx
                    .query_row(
                        "SELECT * FROM requests WHERE id = ?1",
                        params![id],
                        row_to_request,
                    )
                    .optional()?
                else {
                    return Ok(None);
                };
                let images = images_for_request(&tx, &id)?;
                let model = tx
                    .query_row(
                        "SELECT * FROM models WHERE request_id = ?1",
                        params![id],
                        row_to_model,
                    )
                    .optional()?;
                tx.commit()?;

                let mut snapshot = RequestSnapshot {
                    request,
                    images,
                    model,
                };
                rewrite_snapshot(&mut snapshot, &proxy_base);
                Ok(Some(snapshot))
            })
            .await
    }

    /// Delete the model row (if any) and the request row; images and jobs
    /// go with the request via cascade. Returns (images_deleted,
    /// model_deleted).
    pub async fn delete_request_rows(&self, id: &str) -> Result<(u32, bool), KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let image_count: u32 = tx.query_row(
                    "SELECT COUNT(*) FROM images WHERE request_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let model_deleted =
                    tx.execute("DELETE FROM models WHERE request_id = ?1", params![id])? > 0;
                let removed = tx.execute("DELETE FROM requests WHERE id = ?1", params![id])?;
                if removed == 0 {
                    return Err(KilnError::NotFound("request".to_string()));
                }
                tx.commit()?;
                Ok((image_count, model_deleted))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Images & image jobs
    // -----------------------------------------------------------------------

    pub async fn find_image(&self, id: &str) -> Result<Option<Image>, KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row("SELECT * FROM images WHERE id = ?1", params![id], row_to_image)
                    .optional()
                    .map_err(Into::into)
            })
            .await
    }

    pub async fn images_for_request(&self, request_id: &str) -> Result<Vec<Image>, KilnError> {
        let request_id = request_id.to_string();
        self.db
            .call(move |conn| images_for_request(conn, &request_id))
            .await
    }

    pub async fn find_image_job(&self, id: &str) -> Result<Option<ImageJob>, KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM image_jobs WHERE id = ?1",
                    params![id],
                    row_to_image_job,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Write the refined per-variant prompt produced by the LLM side-task.
    pub async fn set_image_prompt(&self, image_id: &str, prompt: &str) -> Result<(), KilnError> {
        let image_id = image_id.to_string();
        let prompt = prompt.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE images SET image_prompt = ?2, updated_at = ?3 WHERE id = ?1",
                    params![image_id, prompt, now()],
                )?;
                Ok(())
            })
            .await
    }

    /// Transition job → RUNNING and image → GENERATING, and flip the parent
    /// request to IMAGE_GENERATING if this is the first job to run.
    /// Idempotent across retries: a RETRYING job re-enters RUNNING, an
    /// already-GENERATING image stays put.
    pub async fn image_job_running(
        &self,
        job_id: &str,
        image_id: &str,
        request_id: &str,
        provider: &str,
        timeout_at: DateTime<Utc>,
    ) -> Result<(), KilnError> {
        let (job_id, image_id, request_id, provider) = (
            job_id.to_string(),
            image_id.to_string(),
            request_id.to_string(),
            provider.to_string(),
        );
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE image_jobs SET status = 'RUNNING', provider_name = ?2,
                         timeout_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND status IN ('PENDING', 'RETRYING')",
                    params![job_id, provider, fmt_ts(timeout_at), now()],
                )?;
                tx.execute(
                    "UPDATE images SET image_status = 'GENERATING', updated_at = ?2
                     WHERE id = ?1 AND image_status = 'PENDING'",
                    params![image_id, now()],
                )?;
                tx.execute(
                    "UPDATE requests SET status = 'IMAGE_GENERATING', updated_at = ?2
                     WHERE id = ?1 AND status = 'IMAGE_PENDING'",
                    params![request_id, now()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Terminal success for one image: URL + COMPLETED + completed_at on the
    /// image, COMPLETED on its job, in a single transaction. Returns None
    /// when the image row is gone (request deleted mid-flight): the caller
    /// treats that as a successful no-op and publishes nothing.
    pub async fn complete_image(
        &self,
        image_id: &str,
        job_id: &str,
        image_url: &str,
    ) -> Result<Option<DateTime<Utc>>, KilnError> {
        let (image_id, job_id, image_url) =
            (image_id.to_string(), job_id.to_string(), image_url.to_string());
        self.db
            .call(move |conn| {
                let completed_at = Utc::now();
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE images SET image_url = ?2, image_status = 'COMPLETED',
                         error_message = NULL, completed_at = ?3, updated_at = ?3
                     WHERE id = ?1",
                    params![image_id, image_url, fmt_ts(completed_at)],
                )?;
                tx.execute(
                    "UPDATE image_jobs SET status = 'COMPLETED', updated_at = ?2 WHERE id = ?1",
                    params![job_id, now()],
                )?;
                tx.commit()?;
                Ok((changed > 0).then_some(completed_at))
            })
            .await
    }

    /// Terminal failure for one image.
    pub async fn fail_image(
        &self,
        image_id: &str,
        job_id: &str,
        message: &str,
        timed_out: bool,
    ) -> Result<(), KilnError> {
        let (image_id, job_id, message) =
            (image_id.to_string(), job_id.to_string(), message.to_string());
        let job_status = if timed_out { JobStatus::Timeout } else { JobStatus::Failed };
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE images SET image_status = 'FAILED', error_message = ?2,
                         updated_at = ?3
                     WHERE id = ?1",
                    params![image_id, message, now()],
                )?;
                tx.execute(
                    "UPDATE image_jobs SET status = ?2, error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![job_id, job_status.as_str(), message, now()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Record a retryable failure: bump retry_count, schedule next_retry_at.
    pub async fn retry_image_job(
        &self,
        job_id: &str,
        next_retry_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), KilnError> {
        let (job_id, message) = (job_id.to_string(), message.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE image_jobs SET status = 'RETRYING',
                         retry_count = retry_count + 1, next_retry_at = ?2,
                         error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![job_id, fmt_ts(next_retry_at), message, now()],
                )?;
                Ok(())
            })
            .await
    }

    /// Fan-in after a terminal image outcome. Re-reads the request's images
    /// and, when all four are terminal, transitions the request with a
    /// conditional update so only one concurrent worker wins.
    pub async fn finish_image_phase(
        &self,
        request_id: &str,
    ) -> Result<Option<PhaseTransition>, KilnError> {
        let request_id = request_id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let images = images_for_request(&tx, &request_id)?;
                let completed = images
                    .iter()
                    .filter(|i| i.image_status == crate::model::ImageStatus::Completed)
                    .count();
                let failed = images
                    .iter()
                    .filter(|i| i.image_status == crate::model::ImageStatus::Failed)
                    .count();

                let transition = if !images.is_empty() && completed == images.len() {
                    let changed = tx.execute(
                        "UPDATE requests SET status = 'IMAGE_COMPLETED',
                             phase = 'AWAITING_SELECTION', updated_at = ?2
                         WHERE id = ?1 AND status IN ('IMAGE_PENDING', 'IMAGE_GENERATING')",
                        params![request_id, now()],
                    )?;
                    (changed > 0).then_some(PhaseTransition::Completed)
                } else if failed > 0 && completed + failed == images.len() {
                    let changed = tx.execute(
                        "UPDATE requests SET status = 'IMAGE_FAILED', updated_at = ?2
                         WHERE id = ?1 AND status IN ('IMAGE_PENDING', 'IMAGE_GENERATING')",
                        params![request_id, now()],
                    )?;
                    (changed > 0).then_some(PhaseTransition::Failed)
                } else {
                    None
                };
                tx.commit()?;
                Ok(transition)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// The selection transaction: re-validates phase, image readiness, and
    /// the one-model-per-request guard, then updates the request and inserts
    /// the model and its job atomically.
    pub async fn select_image(
        &self,
        request_id: &str,
        index: u8,
        model: Model,
        job: ModelJob,
    ) -> Result<(), KilnError> {
        let request_id = request_id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let request = tx
                    .query_row(
                        "SELECT * FROM requests WHERE id = ?1",
                        params![request_id],
                        row_to_request,
                    )
                    .optional()?
                    .ok_or_else(|| KilnError::NotFound("request".to_string()))?;
                if request.phase != RequestPhase::AwaitingSelection {
                    return Err(KilnError::InvalidState(format!(
                        "request is in phase {}, expected AWAITING_SELECTION",
                        request.phase.as_str()
                    )));
                }
                let image = tx
                    .query_row(
                        "SELECT * FROM images WHERE request_id = ?1 AND image_index = ?2",
                        params![request_id, index],
                        row_to_image,
                    )
                    .optional()?
                    .ok_or_else(|| KilnError::NotFound("image".to_string()))?;
                if image.image_status != crate::model::ImageStatus::Completed
                    || image.image_url.is_none()
                {
                    return Err(KilnError::InvalidState(format!(
                        "image {index} is not completed"
                    )));
                }
                let existing: u32 = tx.query_row(
                    "SELECT COUNT(*) FROM models WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )?;
                if existing > 0 {
                    return Err(KilnError::InvalidState(
                        "a model already exists for this request".to_string(),
                    ));
                }

                tx.execute(
                    "UPDATE requests SET selected_image_index = ?2,
                         phase = 'MODEL_GENERATION', status = 'MODEL_PENDING', updated_at = ?3
                     WHERE id = ?1",
                    params![request_id, index, now()],
                )?;
                insert_model(&tx, &model)?;
                insert_model_job(&tx, &job)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Models & model jobs
    // -----------------------------------------------------------------------

    pub async fn find_model(&self, id: &str) -> Result<Option<Model>, KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row("SELECT * FROM models WHERE id = ?1", params![id], row_to_model)
                    .optional()
                    .map_err(Into::into)
            })
            .await
    }

    pub async fn find_model_by_request(
        &self,
        request_id: &str,
    ) -> Result<Option<Model>, KilnError> {
        let request_id = request_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM models WHERE request_id = ?1",
                    params![request_id],
                    row_to_model,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Model read for external consumers: URLs rewritten to proxy form.
    pub async fn model_for_client(&self, id: &str) -> Result<Option<Model>, KilnError> {
        let mut model = self.find_model(id).await?;
        if let Some(ref mut m) = model {
            rewrite_model(m, &self.proxy_base);
        }
        Ok(model)
    }

    pub async fn list_public_models(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Model>, KilnError> {
        let proxy_base = self.proxy_base.clone();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM models WHERE visibility = 'PUBLIC'
                     ORDER BY published_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], row_to_model)?;
                let mut models = rows.collect::<Result<Vec<_>, _>>()?;
                for m in &mut models {
                    rewrite_model(m, &proxy_base);
                }
                Ok(models)
            })
            .await
    }

    pub async fn list_models(
        &self,
        external_user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Model>, KilnError> {
        let user = external_user_id.to_string();
        let proxy_base = self.proxy_base.clone();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM models WHERE external_user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![user, limit, offset], row_to_model)?;
                let mut models = rows.collect::<Result<Vec<_>, _>>()?;
                for m in &mut models {
                    rewrite_model(m, &proxy_base);
                }
                Ok(models)
            })
            .await
    }

    pub async fn find_model_job(&self, id: &str) -> Result<Option<ModelJob>, KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM model_jobs WHERE id = ?1",
                    params![id],
                    row_to_model_job,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Transition model job → RUNNING and the request MODEL_PENDING →
    /// MODEL_GENERATING.
    pub async fn model_job_running(
        &self,
        job_id: &str,
        request_id: &str,
        provider: &str,
        timeout_at: DateTime<Utc>,
    ) -> Result<(), KilnError> {
        let (job_id, request_id, provider) =
            (job_id.to_string(), request_id.to_string(), provider.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE model_jobs SET status = 'RUNNING', provider_name = ?2,
                         timeout_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND status IN ('PENDING', 'RETRYING')",
                    params![job_id, provider, fmt_ts(timeout_at), now()],
                )?;
                tx.execute(
                    "UPDATE requests SET status = 'MODEL_GENERATING', updated_at = ?2
                     WHERE id = ?1 AND status = 'MODEL_PENDING'",
                    params![request_id, now()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn set_provider_job_id(
        &self,
        job_id: &str,
        provider_job_id: &str,
    ) -> Result<(), KilnError> {
        let (job_id, provider_job_id) = (job_id.to_string(), provider_job_id.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE model_jobs SET provider_job_id = ?2, updated_at = ?3 WHERE id = ?1",
                    params![job_id, provider_job_id, now()],
                )?;
                Ok(())
            })
            .await
    }

    /// Raise progress if the reported value exceeds the stored one. Returns
    /// the value to publish, or None when the report would regress (a retry
    /// never regresses a previously observed maximum).
    pub async fn raise_model_progress(
        &self,
        job_id: &str,
        progress: u8,
    ) -> Result<Option<u8>, KilnError> {
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE model_jobs SET progress = ?2, updated_at = ?3
                     WHERE id = ?1 AND progress < ?2",
                    params![job_id, progress.min(100), now()],
                )?;
                Ok((changed > 0).then_some(progress.min(100)))
            })
            .await
    }

    /// Terminal success for the model: artifact URLs and format on the
    /// model, COMPLETED/100 on the job, COMPLETED on the request: one
    /// transaction. None means the model row vanished mid-flight.
    pub async fn complete_model(
        &self,
        outcome: ModelCompletion,
    ) -> Result<Option<DateTime<Utc>>, KilnError> {
        self.db
            .call(move |conn| {
                let completed_at = Utc::now();
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE models SET model_url = ?2, mtl_url = ?3, texture_url = ?4,
                         preview_image_url = ?5, format = ?6, file_size = ?7,
                         error_message = NULL, completed_at = ?8, updated_at = ?8
                     WHERE id = ?1",
                    params![
                        outcome.model_id,
                        outcome.model_url,
                        outcome.mtl_url,
                        outcome.texture_url,
                        outcome.preview_image_url,
                        outcome.format,
                        outcome.file_size,
                        fmt_ts(completed_at),
                    ],
                )?;
                tx.execute(
                    "UPDATE model_jobs SET status = 'COMPLETED', progress = 100,
                         updated_at = ?2
                     WHERE id = ?1",
                    params![outcome.job_id, now()],
                )?;
                tx.execute(
                    "UPDATE requests SET status = 'MODEL_COMPLETED', phase = 'COMPLETED',
                         completed_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status IN ('MODEL_PENDING', 'MODEL_GENERATING')",
                    params![outcome.request_id, fmt_ts(completed_at)],
                )?;
                tx.commit()?;
                Ok((changed > 0).then_some(completed_at))
            })
            .await
    }

    /// Terminal failure for the model. The request's phase stays
    /// MODEL_GENERATION; only the status reflects failure.
    pub async fn fail_model(
        &self,
        model_id: &str,
        job_id: &str,
        request_id: &str,
        message: &str,
        timed_out: bool,
    ) -> Result<(), KilnError> {
        let (model_id, job_id, request_id, message) = (
            model_id.to_string(),
            job_id.to_string(),
            request_id.to_string(),
            message.to_string(),
        );
        let job_status = if timed_out { JobStatus::Timeout } else { JobStatus::Failed };
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE models SET error_message = ?2, failed_at = ?3, updated_at = ?3
                     WHERE id = ?1",
                    params![model_id, message, now()],
                )?;
                tx.execute(
                    "UPDATE model_jobs SET status = ?2, error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![job_id, job_status.as_str(), message, now()],
                )?;
                tx.execute(
                    "UPDATE requests SET status = 'MODEL_FAILED', updated_at = ?2
                     WHERE id = ?1 AND status IN ('MODEL_PENDING', 'MODEL_GENERATING')",
                    params![request_id, now()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn retry_model_job(
        &self,
        job_id: &str,
        next_retry_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), KilnError> {
        let (job_id, message) = (job_id.to_string(), message.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE model_jobs SET status = 'RETRYING',
                         retry_count = retry_count + 1, next_retry_at = ?2,
                         error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![job_id, fmt_ts(next_retry_at), message, now()],
                )?;
                Ok(())
            })
            .await
    }

    /// Record the slicer handoff: slice task id + SLICING print status.
    pub async fn set_slice_task(
        &self,
        model_id: &str,
        slice_task_id: &str,
    ) -> Result<(), KilnError> {
        let (model_id, slice_task_id) = (model_id.to_string(), slice_task_id.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE models SET slice_task_id = ?2, print_status = 'SLICING',
                         updated_at = ?3
                     WHERE id = ?1",
                    params![model_id, slice_task_id, now()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_print_status(
        &self,
        model_id: &str,
        status: PrintStatus,
    ) -> Result<(), KilnError> {
        let model_id = model_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE models SET print_status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![model_id, status.as_str(), now()],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Orphaned files
    // -----------------------------------------------------------------------

    pub async fn insert_orphans(&self, orphans: Vec<OrphanedFile>) -> Result<(), KilnError> {
        if orphans.is_empty() {
            return Ok(());
        }
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for orphan in &orphans {
                    tx.execute(
                        "INSERT INTO orphaned_files
                             (id, s3_key, request_id, retry_count, last_error, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            orphan.id,
                            orphan.s3_key,
                            orphan.request_id,
                            orphan.retry_count,
                            orphan.last_error,
                            fmt_ts(orphan.created_at),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Undeleted orphans still within their retry budget, oldest first.
    pub async fn orphan_batch(
        &self,
        batch_size: u32,
        max_retries: u32,
    ) -> Result<Vec<OrphanedFile>, KilnError> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM orphaned_files
                     WHERE deleted_at IS NULL AND retry_count < ?1
                     ORDER BY created_at ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![max_retries, batch_size], row_to_orphan)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    pub async fn orphan_deleted(&self, id: &str) -> Result<(), KilnError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE orphaned_files SET deleted_at = ?2 WHERE id = ?1",
                    params![id, now()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn orphan_failed(&self, id: &str, error: &str) -> Result<(), KilnError> {
        let (id, error) = (id.to_string(), error.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE orphaned_files SET retry_count = retry_count + 1,
                         last_error = ?2
                     WHERE id = ?1",
                    params![id, error],
                )?;
                Ok(())
            })
            .await
    }

    /// All orphan rows, newest first, exhausted ones included: the
    /// operator view.
    pub async fn orphaned_files(&self, limit: u32) -> Result<Vec<OrphanedFile>, KilnError> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM orphaned_files ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], row_to_orphan)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }
}

/// Inputs for the model-completion transaction.
pub struct ModelCompletion {
    pub model_id: String,
    pub job_id: String,
    pub request_id: String,
    pub model_url: String,
    pub mtl_url: Option<String>,
    pub texture_url: Option<String>,
    pub preview_image_url: String,
    pub format: String,
    pub file_size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn now() -> String {
    fmt_ts(Utc::now())
}

fn parse_enum<T>(raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn get_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn get_ts_opt(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    parse_ts_opt(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<Request> {
    Ok(Request {
        id: row.get("id")?,
        external_user_id: row.get("external_user_id")?,
        original_prompt: row.get("original_prompt")?,
        status: parse_enum::<RequestStatus>(row.get("status")?)?,
        phase: parse_enum::<RequestPhase>(row.get("phase")?)?,
        selected_image_index: row.get("selected_image_index")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        completed_at: get_ts_opt(row, "completed_at")?,
    })
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        index: row.get("image_index")?,
        image_url: row.get("image_url")?,
        image_prompt: row.get("image_prompt")?,
        image_status: parse_enum(row.get("image_status")?)?,
        error_message: row.get("error_message")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        completed_at: get_ts_opt(row, "completed_at")?,
    })
}

fn row_to_image_job(row: &Row<'_>) -> rusqlite::Result<ImageJob> {
    Ok(ImageJob {
        id: row.get("id")?,
        image_id: row.get("image_id")?,
        status: parse_enum(row.get("status")?)?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        next_retry_at: get_ts_opt(row, "next_retry_at")?,
        timeout_at: get_ts_opt(row, "timeout_at")?,
        provider_name: row.get("provider_name")?,
        error_message: row.get("error_message")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        id: row.get("id")?,
        external_user_id: row.get("external_user_id")?,
        source: parse_enum(row.get("source")?)?,
        request_id: row.get("request_id")?,
        source_image_id: row.get("source_image_id")?,
        name: row.get("name")?,
        model_url: row.get("model_url")?,
        mtl_url: row.get("mtl_url")?,
        texture_url: row.get("texture_url")?,
        preview_image_url: row.get("preview_image_url")?,
        format: row.get("format")?,
        file_size: row.get("file_size")?,
        visibility: parse_enum(row.get("visibility")?)?,
        published_at: get_ts_opt(row, "published_at")?,
        view_count: row.get("view_count")?,
        like_count: row.get("like_count")?,
        favorite_count: row.get("favorite_count")?,
        download_count: row.get("download_count")?,
        slice_task_id: row.get("slice_task_id")?,
        print_status: parse_enum(row.get("print_status")?)?,
        error_message: row.get("error_message")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        completed_at: get_ts_opt(row, "completed_at")?,
        failed_at: get_ts_opt(row, "failed_at")?,
    })
}

fn row_to_model_job(row: &Row<'_>) -> rusqlite::Result<ModelJob> {
    Ok(ModelJob {
        id: row.get("id")?,
        model_id: row.get("model_id")?,
        status: parse_enum(row.get("status")?)?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        next_retry_at: get_ts_opt(row, "next_retry_at")?,
        timeout_at: get_ts_opt(row, "timeout_at")?,
        provider_name: row.get("provider_name")?,
        provider_job_id: row.get("provider_job_id")?,
        progress: row.get("progress")?,
        error_message: row.get("error_message")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_orphan(row: &Row<'_>) -> rusqlite::Result<OrphanedFile> {
    Ok(OrphanedFile {
        id: row.get("id")?,
        s3_key: row.get("s3_key")?,
        request_id: row.get("request_id")?,
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
        created_at: get_ts(row, "created_at")?,
        deleted_at: get_ts_opt(row, "deleted_at")?,
    })
}

// ---------------------------------------------------------------------------
// Inserts
// ---------------------------------------------------------------------------

fn insert_request(conn: &Connection, r: &Request) -> Result<(), KilnError> {
    conn.execute(
        "INSERT INTO requests
             (id, external_user_id, original_prompt, status, phase,
              selected_image_index, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            r.id,
            r.external_user_id,
            r.original_prompt,
            r.status.as_str(),
            r.phase.as_str(),
            r.selected_image_index,
            fmt_ts(r.created_at),
            fmt_ts(r.updated_at),
            r.completed_at.map(fmt_ts),
        ],
    )?;
    Ok(())
}

fn insert_image(conn: &Connection, i: &Image) -> Result<(), KilnError> {
    conn.execute(
        "INSERT INTO images
             (id, request_id, image_index, image_url, image_prompt, image_status,
              error_message, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            i.id,
            i.request_id,
            i.index,
            i.image_url,
            i.image_prompt,
            i.image_status.as_str(),
            i.error_message,
            fmt_ts(i.created_at),
            fmt_ts(i.updated_at),
            i.completed_at.map(fmt_ts),
        ],
    )?;
    Ok(())
}

fn insert_image_job(conn: &Connection, j: &ImageJob) -> Result<(), KilnError> {
    conn.execute(
        "INSERT INTO image_jobs
             (id, image_id, status, priority, retry_count, max_retries,
              next_retry_at, timeout_at, provider_name, error_message,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            j.id,
            j.image_id,
            j.status.as_str(),
            j.priority,
            j.retry_count,
            j.max_retries,
            j.next_retry_at.map(fmt_ts),
            j.timeout_at.map(fmt_ts),
            j.provider_name,
            j.error_message,
            fmt_ts(j.created_at),
            fmt_ts(j.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_model(conn: &Connection, m: &Model) -> Result<(), KilnError> {
    conn.execute(
        "INSERT INTO models
             (id, external_user_id, source, request_id, source_image_id, name,
              model_url, mtl_url, texture_url, preview_image_url, format,
              file_size, visibility, published_at, view_count, like_count,
              favorite_count, download_count, slice_task_id, print_status,
              error_message, created_at, updated_at, completed_at, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            m.id,
            m.external_user_id,
            m.source.as_str(),
            m.request_id,
            m.source_image_id,
            m.name,
            m.model_url,
            m.mtl_url,
            m.texture_url,
            m.preview_image_url,
            m.format,
            m.file_size,
            m.visibility.as_str(),
            m.published_at.map(fmt_ts),
            m.view_count,
            m.like_count,
            m.favorite_count,
            m.download_count,
            m.slice_task_id,
            m.print_status.as_str(),
            m.error_message,
            fmt_ts(m.created_at),
            fmt_ts(m.updated_at),
            m.completed_at.map(fmt_ts),
            m.failed_at.map(fmt_ts),
        ],
    )?;
    Ok(())
}

fn insert_model_job(conn: &Connection, j: &ModelJob) -> Result<(), KilnError> {
    conn.execute(
        "INSERT INTO model_jobs
             (id, model_id, status, priority, retry_count, max_retries,
              next_retry_at, timeout_at, provider_name, provider_job_id,
              progress, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            j.id,
            j.model_id,
            j.status.as_str(),
            j.priority,
            j.retry_count,
            j.max_retries,
            j.next_retry_at.map(fmt_ts),
            j.timeout_at.map(fmt_ts),
            j.provider_name,
            j.provider_job_id,
            j.progress,
            j.error_message,
            fmt_ts(j.created_at),
            fmt_ts(j.updated_at),
        ],
    )?;
    Ok(())
}

fn images_for_request(conn: &Connection, request_id: &str) -> Result<Vec<Image>, KilnError> {
    let mut stmt =
        conn.prepare("SELECT * FROM images WHERE request_id = ?1 ORDER BY image_index ASC")?;
    let rows = stmt.query_map(params![request_id], row_to_image)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Proxy URL rewriting
// ---------------------------------------------------------------------------

fn rewrite_snapshot(snapshot: &mut RequestSnapshot, proxy_base: &str) {
    for image in &mut snapshot.images {
        if let Some(url) = image.image_url.take() {
            image.image_url = Some(proxy_url(proxy_base, "image", &url));
        }
    }
    if let Some(ref mut model) = snapshot.model {
        rewrite_model(model, proxy_base);
    }
}

fn rewrite_model(model: &mut Model, proxy_base: &str) {
    for url in [&mut model.model_url, &mut model.mtl_url, &mut model.texture_url] {
        if let Some(original) = url.take() {
            *url = Some(proxy_url(proxy_base, "model", &original));
        }
    }
    if let Some(original) = model.preview_image_url.take() {
        model.preview_image_url = Some(proxy_url(proxy_base, "image", &original));
    }
}
