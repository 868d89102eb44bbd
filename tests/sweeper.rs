//! Tests for the orphan sweeper: successful reaps, retry accounting on
//! failure, and the retry-budget cutoff that leaves rows to an operator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln::db::Db;
use kiln::error::KilnError;
use kiln::model::OrphanedFile;
use kiln::storage::ObjectStore;
use kiln::store::Store;
use kiln::sweeper::OrphanSweeper;

/// In-memory object store whose deletes fail for a configured key set.
struct StubbornStore {
    refuse: HashSet<String>,
    deleted: Mutex<Vec<String>>,
}

impl StubbornStore {
    fn refusing(keys: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            refuse: keys.iter().map(|k| k.to_string()).collect(),
            deleted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ObjectStore for StubbornStore {
    async fn upload(
        &self,
        key: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, KilnError> {
        Ok(format!("http://stub/{key}"))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, KilnError> {
        Err(KilnError::NotFound(format!("object {key}")))
    }

    async fn delete(&self, key: &str) -> Result<(), KilnError> {
        if self.refuse.contains(key) {
            return Err(KilnError::Storage(format!("backend refused {key}")));
        }
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn presign(&self, key: &str, _ttl_secs: u64) -> Result<String, KilnError> {
        Ok(format!("http://stub/{key}"))
    }
}

fn test_store() -> Arc<Store> {
    let db = Arc::new(Db::open_in_memory().unwrap());
    Arc::new(Store::new(db, "http://proxy.local"))
}

fn sweeper(store: &Arc<Store>, storage: &Arc<StubbornStore>, max_retries: u32) -> OrphanSweeper {
    let storage: Arc<dyn ObjectStore> = storage.clone();
    OrphanSweeper::new(
        store.clone(),
        storage,
        Duration::from_secs(3600),
        100,
        max_retries,
    )
}

#[tokio::test]
async fn sweep_deletes_reachable_orphans_and_marks_them() {
    let store = test_store();
    let storage = StubbornStore::refusing(&[]);
    store
        .insert_orphans(vec![
            OrphanedFile::new("images/a/0.png", "req-1", None),
            OrphanedFile::new("models/m/model.obj", "req-1", None),
        ])
        .await
        .unwrap();

    let report = sweeper(&store, &storage, 10).sweep_once().await.unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(storage.deleted.lock().unwrap().len(), 2);

    // Marked rows leave the work queue but stay in the table.
    assert!(store.orphan_batch(100, 10).await.unwrap().is_empty());
    let all = store.orphaned_files(100).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|o| o.deleted_at.is_some()));
}

#[tokio::test]
async fn failed_deletions_increment_retry_count_and_keep_the_row() {
    let store = test_store();
    let storage = StubbornStore::refusing(&["images/stuck/0.png"]);
    let stuck = OrphanedFile::new("images/stuck/0.png", "req-1", None);
    store.insert_orphans(vec![stuck.clone()]).await.unwrap();

    let s = sweeper(&store, &storage, 10);
    for _ in 0..3 {
        let report = s.sweep_once().await.unwrap();
        assert_eq!(report.failed, 1);
    }

    let row = &store.orphaned_files(10).await.unwrap()[0];
    assert_eq!(row.retry_count, 3);
    assert!(row.deleted_at.is_none());
    assert!(row.last_error.as_deref().unwrap().contains("storage"));
}

#[tokio::test]
async fn exhausted_orphans_are_left_to_the_operator() {
    let store = test_store();
    let storage = StubbornStore::refusing(&["images/stuck/0.png"]);
    store
        .insert_orphans(vec![OrphanedFile::new("images/stuck/0.png", "req-1", None)])
        .await
        .unwrap();

    let s = sweeper(&store, &storage, 2);
    assert_eq!(s.sweep_once().await.unwrap().failed, 1);
    assert_eq!(s.sweep_once().await.unwrap().failed, 1);

    // Budget exhausted: no further attempts, row still visible.
    let report = s.sweep_once().await.unwrap();
    assert_eq!(report.deleted + report.failed, 0);
    let row = &store.orphaned_files(10).await.unwrap()[0];
    assert_eq!(row.retry_count, 2);
    assert!(row.deleted_at.is_none());
}
