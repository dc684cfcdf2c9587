mod common;

use common::{Behaviour, FakeRuntime};
use docksentinel::jobs::{EnqueueItem, JobRepository, JobStatus, UpdateJob};
use docksentinel::outbound::sqlite::Sqlite;
use docksentinel::recreate::{RecreateOptions, RecreationEngine};
use docksentinel::worker::{MISSING_IMAGE, Worker};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    runtime: FakeRuntime,
    store: Arc<Sqlite>,
    worker: Arc<Worker<FakeRuntime, Sqlite>>,
}

async fn fixture() -> Fixture {
    let runtime = FakeRuntime::new();
    let store = Arc::new(common::store().await);
    let shared = Arc::new(runtime.clone());
    let engine = Arc::new(RecreationEngine::new(
        Arc::clone(&shared),
        RecreateOptions {
            stop_timeout: 1,
            health_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        },
    ));
    let worker = Arc::new(Worker::new("test-worker", shared, Arc::clone(&store), engine));
    Fixture {
        runtime,
        store,
        worker,
    }
}

impl Fixture {
    async fn enqueue(&self, item: EnqueueItem) -> UpdateJob {
        let outcome = self.store.enqueue_many(&[item]).await.unwrap();
        let id = &outcome.queued[0].id;
        self.store.get_job(id).await.unwrap().unwrap()
    }

    async fn reload(&self, job: &UpdateJob) -> UpdateJob {
        self.store.get_job(&job.id).await.unwrap().unwrap()
    }
}

fn item(container: &str, image: &str, force: bool, pull: bool) -> EnqueueItem {
    EnqueueItem {
        container: container.to_string(),
        image: Some(image.to_string()),
        force,
        pull,
    }
}

#[tokio::test]
async fn test_update_job_pulls_and_recreates() {
    let f = fixture().await;
    let old_id = f.runtime.add_container("web", "nginx:1.0", "sha256:old");
    f.runtime.publish("nginx:1.0", "sha256:new");
    let job = f.enqueue(item("web", "nginx:1.0", false, true)).await;

    assert_eq!(f.worker.drain().await, Some(1));

    let done = f.reload(&job).await;
    assert_eq!(done.status, JobStatus::Success);
    let result = done.result.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["old"], json!(old_id));
    assert!(f.runtime.calls().contains(&"pull nginx:1.0".to_string()));
    assert_ne!(f.runtime.container("web").unwrap().id, old_id);
}

#[tokio::test]
async fn test_job_without_image_fails() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:old");
    let job = f
        .enqueue(EnqueueItem {
            container: "web".to_string(),
            image: None,
            force: true,
            pull: false,
        })
        .await;

    f.worker.drain().await;

    let failed = f.reload(&job).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(MISSING_IMAGE));
    assert!(f.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_job_without_update_is_skipped() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:same");
    f.runtime.publish("nginx:1.0", "sha256:same");
    let job = f.enqueue(item("web", "nginx:1.0", false, true)).await;

    f.worker.drain().await;

    let done = f.reload(&job).await;
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(
        done.result,
        Some(json!({"skipped": "no_update", "reason": "up_to_date"}))
    );
    assert!(f.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_job_for_new_tag_recreates_without_force() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:same");
    f.runtime.publish("nginx:1.0", "sha256:same");
    f.runtime.publish("nginx:1.1", "sha256:next");
    let job = f.enqueue(EnqueueItem::new("web", "nginx:1.1")).await;

    f.worker.drain().await;

    let done = f.reload(&job).await;
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.result.unwrap()["status"], "success");
    assert_eq!(f.runtime.container("web").unwrap().image, "nginx:1.1");
}

#[tokio::test]
async fn test_forced_job_recreates_without_update() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:same");
    f.runtime.publish("nginx:1.0", "sha256:same");
    let job = f.enqueue(item("web", "nginx:1.0", true, false)).await;

    f.worker.drain().await;

    assert_eq!(f.reload(&job).await.status, JobStatus::Success);
    let calls = f.runtime.calls();
    assert!(calls.contains(&"create web".to_string()));
    assert!(!calls.iter().any(|call| call.starts_with("pull")));
}

#[tokio::test]
async fn test_rolled_back_job_fails_and_emits_event() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:old");
    f.runtime.behave("nginx:1.1", Behaviour::Unhealthy);
    let job = f.enqueue(item("web", "nginx:1.1", true, false)).await;
    let mut events = f.worker.subscribe();

    f.worker.drain().await;

    let failed = f.reload(&job).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().unwrap().starts_with("rolled_back:"));

    let event = events.recv().await.unwrap();
    assert_eq!(event.job_id, job.id);
    assert_eq!(event.container, "web");
    assert_eq!(event.status, JobStatus::Failed);
    assert!(event.message.is_some());
}

#[tokio::test]
async fn test_failed_pull_fails_job() {
    let f = fixture().await;
    f.runtime.add_container("web", "nginx:1.0", "sha256:old");
    let job = f.enqueue(item("web", "nginx:9.9", true, true)).await;

    f.worker.drain().await;

    let failed = f.reload(&job).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("nginx:9.9"));
    assert!(!f.runtime.calls().iter().any(|call| call.starts_with("create")));
}

#[tokio::test]
async fn test_kick_is_single_flight() {
    let f = fixture().await;
    for name in ["a", "b"] {
        f.runtime.add_container(name, "app:1", "sha256:old");
        f.enqueue(item(name, "app:1", true, false)).await;
    }
    let mut events = f.worker.subscribe();

    assert!(f.worker.kick());
    assert!(!f.worker.kick());
    assert!(f.worker.is_draining());
    assert_eq!(f.worker.drain().await, None);

    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, JobStatus::Success);
    }
    for _ in 0..100 {
        if !f.worker.is_draining() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!f.worker.is_draining());
    assert_eq!(f.worker.drain().await, Some(0));
}
