use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use herald_core::{
    types::{NewPlatform, NewPost},
    PublicationStore,
};
use herald_store::SqliteStore;

struct TempDb(std::path::PathBuf);

impl TempDb {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("herald-race-{}.db", uuid::Uuid::new_v4())))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.0.display()));
        }
    }
}

/// Two stores on the same file stand in for two scheduler instances.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let db = TempDb::new();
    let a = Arc::new(SqliteStore::open(&db.0).unwrap());
    let b = Arc::new(SqliteStore::open(&db.0).unwrap());

    let platform = a
        .create_platform(&NewPlatform {
            user_id: 7,
            name: "Telegram".into(),
            credentials: BTreeMap::from([("@chan".to_string(), "tok".to_string())]),
            is_active: true,
        })
        .unwrap();
    let past = Utc::now() - Duration::minutes(1);
    for n in 0..40 {
        a.create_post(&NewPost {
            user_id: 7,
            title: format!("post {n}"),
            content: "body".into(),
            platform_ids: vec![platform.id],
            scheduled_for: Some(past),
        })
        .unwrap();
    }

    let mut handles = Vec::new();
    for store in [a.clone(), b.clone(), a.clone(), b.clone()] {
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.fetch_due(3, Utc::now()).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|d| d.destination_id));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "destination {id} claimed twice");
        }
    }
    assert_eq!(total, 40);
}
