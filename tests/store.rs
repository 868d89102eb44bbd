//! Tests for the data store: request-graph creation, phase fan-in with the
//! conditional single-winner update, the selection transaction, cascading
//! deletes, progress monotonicity, and orphan bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use kiln::db::Db;
use kiln::error::KilnError;
use kiln::model::{
    Image, ImageJob, ImageStatus, JobStatus, Model, ModelJob, OrphanedFile, Request, RequestPhase,
    RequestStatus,
};
use kiln::store::{ModelCompletion, PhaseTransition, Store};

const PROXY: &str = "http://proxy.local";

fn test_store() -> Arc<Store> {
    let db = Arc::new(Db::open_in_memory().unwrap());
    Arc::new(Store::new(db, PROXY))
}

/// Insert a request with four pending images and jobs, returning all rows.
async fn seed_request(store: &Store) -> (Request, Vec<Image>, Vec<ImageJob>) {
    let request = Request::new("user-1", "a small pink donkey");
    let images: Vec<Image> = (0..4).map(|i| Image::new(&request.id, i)).collect();
    let jobs: Vec<ImageJob> = images.iter().map(|img| ImageJob::new(&img.id, 0, 3)).collect();
    store
        .insert_request_graph(request.clone(), images.clone(), jobs.clone())
        .await
        .unwrap();
    (request, images, jobs)
}

async fn complete_all_images(store: &Store, images: &[Image], jobs: &[ImageJob]) {
    for (image, job) in images.iter().zip(jobs) {
        let url = format!("http://storage/images/{}/{}.png", image.id, image.index);
        store.complete_image(&image.id, &job.id, &url).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_graph_creates_exactly_four_images() {
    let store = test_store();
    let (request, _, _) = seed_request(&store).await;

    let images = store.images_for_request(&request.id).await.unwrap();
    assert_eq!(images.len(), 4);
    let mut indices: Vec<u8> = images.iter().map(|i| i.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    for image in &images {
        assert_eq!(image.image_status, ImageStatus::Pending);
        assert!(image.image_url.is_none());
        assert!(image.image_prompt.is_none());
    }
}

#[tokio::test]
async fn duplicate_image_index_violates_integrity() {
    let store = test_store();
    let request = Request::new("user-1", "prompt");
    let a = Image::new(&request.id, 0);
    let b = Image::new(&request.id, 0);
    let err = store
        .insert_request_graph(request, vec![a, b], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Integrity(_)));
}

// ---------------------------------------------------------------------------
// Image lifecycle & fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_url_set_only_with_completed_status() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;

    store
        .complete_image(&images[0].id, &jobs[0].id, "http://storage/images/x/0.png")
        .await
        .unwrap();
    store.fail_image(&images[1].id, &jobs[1].id, "boom", false).await.unwrap();

    let rows = store.images_for_request(&request.id).await.unwrap();
    assert_eq!(rows[0].image_status, ImageStatus::Completed);
    assert!(rows[0].image_url.is_some());
    assert!(rows[0].completed_at.is_some());
    assert_eq!(rows[1].image_status, ImageStatus::Failed);
    assert!(rows[1].image_url.is_none());
    assert_eq!(rows[1].error_message.as_deref(), Some("boom"));

    let job = store.find_image_job(&jobs[1].id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn first_running_job_flips_request_to_generating() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;

    store
        .image_job_running(&jobs[0].id, &images[0].id, &request.id, "image-http", Utc::now())
        .await
        .unwrap();

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ImageGenerating);
    assert_eq!(row.phase, RequestPhase::ImageGeneration);
}

#[tokio::test]
async fn phase_completes_once_when_all_four_finish() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;
    complete_all_images(&store, &images, &jobs).await;

    // First fan-in check wins the conditional update; a concurrent second
    // check sees the row already transitioned and stays silent.
    let first = store.finish_image_phase(&request.id).await.unwrap();
    assert_eq!(first, Some(PhaseTransition::Completed));
    let second = store.finish_image_phase(&request.id).await.unwrap();
    assert_eq!(second, None);

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ImageCompleted);
    assert_eq!(row.phase, RequestPhase::AwaitingSelection);
}

#[tokio::test]
async fn phase_fails_when_any_image_failed_and_all_terminal() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;

    for (image, job) in images.iter().zip(&jobs).take(3) {
        let url = format!("http://storage/images/{}/{}.png", image.id, image.index);
        store.complete_image(&image.id, &job.id, &url).await.unwrap();
    }
    store.fail_image(&images[3].id, &jobs[3].id, "provider 500", false).await.unwrap();

    let transition = store.finish_image_phase(&request.id).await.unwrap();
    assert_eq!(transition, Some(PhaseTransition::Failed));

    // Status reflects failure; phase stays IMAGE_GENERATION.
    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ImageFailed);
    assert_eq!(row.phase, RequestPhase::ImageGeneration);
}

#[tokio::test]
async fn phase_does_not_move_while_images_remain() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;

    store
        .complete_image(&images[0].id, &jobs[0].id, "http://storage/images/x/0.png")
        .await
        .unwrap();
    assert_eq!(store.finish_image_phase(&request.id).await.unwrap(), None);
}

#[tokio::test]
async fn completing_a_deleted_image_is_a_no_op() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;
    store.delete_request_rows(&request.id).await.unwrap();

    let outcome = store
        .complete_image(&images[0].id, &jobs[0].id, "http://storage/x.png")
        .await
        .unwrap();
    assert!(outcome.is_none());
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

async fn ready_for_selection(store: &Store) -> (Request, Vec<Image>) {
    let (request, images, jobs) = seed_request(store).await;
    complete_all_images(store, &images, &jobs).await;
    store.finish_image_phase(&request.id).await.unwrap();
    let images = store.images_for_request(&request.id).await.unwrap();
    (request, images)
}

fn model_for(request: &Request, image: &Image) -> (Model, ModelJob) {
    let model = Model::from_selection(
        &request.external_user_id,
        &request.id,
        &image.id,
        &request.original_prompt,
    );
    let job = ModelJob::new(&model.id, 0, 3);
    (model, job)
}

#[tokio::test]
async fn selection_moves_request_into_model_generation() {
    let store = test_store();
    let (request, images) = ready_for_selection(&store).await;
    let (model, job) = model_for(&request, &images[2]);

    store.select_image(&request.id, 2, model.clone(), job).await.unwrap();

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ModelPending);
    assert_eq!(row.phase, RequestPhase::ModelGeneration);
    assert_eq!(row.selected_image_index, Some(2));

    let stored = store.find_model_by_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.id, model.id);
    assert_eq!(stored.source_image_id.as_deref(), Some(images[2].id.as_str()));
    assert!(stored.published_at.is_some());
}

#[tokio::test]
async fn second_selection_is_rejected_and_state_untouched() {
    let store = test_store();
    let (request, images) = ready_for_selection(&store).await;
    let (model, job) = model_for(&request, &images[2]);
    store.select_image(&request.id, 2, model.clone(), job).await.unwrap();

    let (other_model, other_job) = model_for(&request, &images[0]);
    let err = store
        .select_image(&request.id, 0, other_model, other_job)
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::InvalidState(_)));

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.selected_image_index, Some(2));
    let stored = store.find_model_by_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.id, model.id);
}

#[tokio::test]
async fn selection_requires_awaiting_selection_phase() {
    let store = test_store();
    let (request, images, _) = seed_request(&store).await;
    let (model, job) = model_for(&request, &images[0]);

    let err = store.select_image(&request.id, 0, model, job).await.unwrap_err();
    assert!(matches!(err, KilnError::InvalidState(_)));
}

// ---------------------------------------------------------------------------
// Model lifecycle
// ---------------------------------------------------------------------------

async fn selected(store: &Store) -> (Request, Model, ModelJob) {
    let (request, images) = ready_for_selection(store).await;
    let (model, job) = model_for(&request, &images[1]);
    store.select_image(&request.id, 1, model.clone(), job.clone()).await.unwrap();
    (request, model, job)
}

#[tokio::test]
async fn progress_never_regresses() {
    let store = test_store();
    let (_, _, job) = selected(&store).await;

    assert_eq!(store.raise_model_progress(&job.id, 25).await.unwrap(), Some(25));
    assert_eq!(store.raise_model_progress(&job.id, 60).await.unwrap(), Some(60));
    // A late or retried report below the observed maximum publishes nothing.
    assert_eq!(store.raise_model_progress(&job.id, 40).await.unwrap(), None);
    assert_eq!(store.raise_model_progress(&job.id, 60).await.unwrap(), None);

    let row = store.find_model_job(&job.id).await.unwrap().unwrap();
    assert_eq!(row.progress, 60);
}

#[tokio::test]
async fn completing_model_completes_request() {
    let store = test_store();
    let (request, model, job) = selected(&store).await;

    let completed_at = store
        .complete_model(ModelCompletion {
            model_id: model.id.clone(),
            job_id: job.id.clone(),
            request_id: request.id.clone(),
            model_url: "http://storage/models/m/model.obj".to_string(),
            mtl_url: Some("http://storage/models/m/material.mtl".to_string()),
            texture_url: Some("http://storage/models/m/material.png".to_string()),
            preview_image_url: "http://storage/models/m/preview.png".to_string(),
            format: "OBJ".to_string(),
            file_size: Some(1234),
        })
        .await
        .unwrap();
    assert!(completed_at.is_some());

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ModelCompleted);
    assert_eq!(row.phase, RequestPhase::Completed);
    assert!(row.completed_at.is_some());

    let job_row = store.find_model_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_row.status, JobStatus::Completed);
    assert_eq!(job_row.progress, 100);
}

#[tokio::test]
async fn failing_model_keeps_phase() {
    let store = test_store();
    let (request, model, job) = selected(&store).await;

    store
        .fail_model(&model.id, &job.id, &request.id, "provider exploded", false)
        .await
        .unwrap();

    let row = store.find_request(&request.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::ModelFailed);
    assert_eq!(row.phase, RequestPhase::ModelGeneration);

    let model_row = store.find_model(&model.id).await.unwrap().unwrap();
    assert!(model_row.failed_at.is_some());
    assert_eq!(model_row.error_message.as_deref(), Some("provider exploded"));
}

// ---------------------------------------------------------------------------
// Snapshot & URL rewriting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_rewrites_urls_but_rows_keep_originals() {
    let store = test_store();
    let (request, images, jobs) = seed_request(&store).await;
    let original = format!("http://storage/images/{}/0.png", images[0].id);
    store.complete_image(&images[0].id, &jobs[0].id, &original).await.unwrap();

    let snapshot = store.request_snapshot(&request.id).await.unwrap().unwrap();
    let rewritten = snapshot.images[0].image_url.as_deref().unwrap();
    assert!(rewritten.starts_with(&format!("{PROXY}/proxy/image?url=")));
    assert!(rewritten.contains("http%3A%2F%2Fstorage"));

    // The raw row is untouched: the store owns the rewrite on read only.
    let raw = store.find_image(&images[0].id).await.unwrap().unwrap();
    assert_eq!(raw.image_url.as_deref(), Some(original.as_str()));
}

#[tokio::test]
async fn snapshot_of_missing_request_is_none() {
    let store = test_store();
    assert!(store.request_snapshot("nope").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_cascades_to_images_jobs_and_model() {
    let store = test_store();
    let (request, model, job) = selected(&store).await;
    let images = store.images_for_request(&request.id).await.unwrap();

    let (images_deleted, model_deleted) = store.delete_request_rows(&request.id).await.unwrap();
    assert_eq!(images_deleted, 4);
    assert!(model_deleted);

    assert!(store.find_request(&request.id).await.unwrap().is_none());
    assert!(store.images_for_request(&request.id).await.unwrap().is_empty());
    for image in &images {
        assert!(store.find_image(&image.id).await.unwrap().is_none());
    }
    assert!(store.find_model(&model.id).await.unwrap().is_none());
    assert!(store.find_model_job(&job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_missing_request_is_not_found() {
    let store = test_store();
    let err = store.delete_request_rows("ghost").await.unwrap_err();
    assert!(matches!(err, KilnError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphan_batch_skips_deleted_and_exhausted_rows() {
    let store = test_store();
    let fresh = OrphanedFile::new("images/a/0.png", "req-1", None);
    let tired = OrphanedFile::new("images/b/0.png", "req-1", None);
    store.insert_orphans(vec![fresh.clone(), tired.clone()]).await.unwrap();

    for _ in 0..10 {
        store.orphan_failed(&tired.id, "still failing").await.unwrap();
    }
    store.orphan_deleted(&fresh.id).await.unwrap();

    let batch = store.orphan_batch(100, 10).await.unwrap();
    assert!(batch.is_empty());

    // Exhausted rows stay visible to operators.
    let all = store.orphaned_files(100).await.unwrap();
    assert_eq!(all.len(), 2);
    let tired_row = all.iter().find(|o| o.id == tired.id).unwrap();
    assert_eq!(tired_row.retry_count, 10);
    assert_eq!(tired_row.last_error.as_deref(), Some("still failing"));
}
