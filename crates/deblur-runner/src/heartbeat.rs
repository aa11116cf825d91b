use std::sync::Arc;
use std::time::Duration;

use deblur_core::TaskId;
use deblur_storage::TaskStore;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

/// Background heartbeat for one running task. Stops when dropped.
pub struct HeartbeatTicker {
    handle: JoinHandle<()>,
}

impl HeartbeatTicker {
    pub fn spawn(store: Arc<dyn TaskStore>, task_id: TaskId, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            loop {
                ticker.tick().await;
                debug!(task = %task_id, "heartbeat");
                if let Err(e) = store.heartbeat(&task_id) {
                    warn!(task = %task_id, error = %e, "failed to record heartbeat");
                }
            }
        });
        Self { handle }
    }

    /// Stops ticking now rather than at the end of the enclosing scope.
    pub fn stop(self) {}
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deblur_storage::{InMemoryTaskStore, NewTask};
    use std::sync::atomic::{AtomicI64, Ordering};

    #[tokio::test]
    async fn ticks_until_dropped() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let c = clock.clone();
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_clock(move || c.load(Ordering::SeqCst)));
        let mut new = NewTask::new("/in", "/out", "p", "m", serde_json::json!({}));
        new.input_fingerprint = Some("fp".into());
        let id = store.create_task(new).unwrap().task.id;

        clock.store(2_000, Ordering::SeqCst);
        let ticker = HeartbeatTicker::spawn(store.clone(), id.clone(), Duration::from_millis(10));
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.require_task(&id).unwrap().last_heartbeat_at, Some(2_000));

        ticker.stop();
        clock.store(3_000, Ordering::SeqCst);
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.require_task(&id).unwrap().last_heartbeat_at, Some(2_000));
    }
}
