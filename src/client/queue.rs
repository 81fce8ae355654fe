//! Per-key ordered work lanes.
//!
//! Each key owns an unbounded channel drained by one worker task, so jobs
//! pushed for the same key run one at a time in push order while jobs for
//! different keys run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordered job lanes keyed by container ID.
#[derive(Debug)]
pub struct KeyedQueue {
    name: &'static str,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl KeyedQueue {
    /// Creates an empty queue. `name` only appears in traces.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `job` to the lane for `key`, starting the lane if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let job: Job = Box::pin(job);
        let job = match lanes.get(key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // Worker is gone; start a new one below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        let tx = self.spawn_lane(key);
        let _ = tx.send(job);
        lanes.insert(key.to_string(), tx);
    }

    /// Closes the lane for `key`. Already queued jobs still run.
    pub fn remove(&self, key: &str) {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of open lanes.
    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_lane(&self, key: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = self.name;
        let key = key.to_string();
        trace!(queue = name, key = %key, "lane started");
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!(queue = name, key = %key, "lane closed");
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run_in_push_order() {
        let queue = KeyedQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..5u64 {
            let seen = Arc::clone(&seen);
            queue.push("a", async move {
                // Earlier jobs sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                seen.lock().unwrap().push(i);
            });
        }
        queue.push("a", async move {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let queue = KeyedQueue::new("test");
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (b_tx, b_rx) = oneshot::channel();

        queue.push("a", async move {
            let _ = release_rx.await;
        });
        queue.push("b", async move {
            let _ = b_tx.send(());
        });

        // "b" completes while "a" is still blocked.
        tokio::time::timeout(Duration::from_secs(1), b_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 2);
        let _ = release_tx.send(());
    }
}
