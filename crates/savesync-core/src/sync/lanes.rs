//! Per-key ordering of background remote writes.
//!
//! Writes for one key run one at a time in submission order. A write that
//! is still queued when a newer one for the same key is submitted is
//! skipped, so the remote converges on the latest value. A write that has
//! already started is never interrupted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Lane {
    latest: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
pub(crate) struct WriteLanes {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

pub(crate) struct WriteTicket {
    lane: Arc<Lane>,
    generation: u64,
}

impl WriteLanes {
    /// Take a ticket for `key`, superseding every earlier queued ticket.
    pub(crate) fn ticket(&self, key: &str) -> WriteTicket {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
            lanes.entry(key.to_string()).or_default().clone()
        };
        let generation = lane.latest.fetch_add(1, Ordering::SeqCst) + 1;
        WriteTicket { lane, generation }
    }
}

impl WriteTicket {
    /// Run `write` once earlier writes for the key are done. Returns `None`
    /// if a newer ticket was issued while this one waited.
    pub(crate) async fn run<F, T>(self, write: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _gate = self.lane.gate.lock().await;
        if self.lane.latest.load(Ordering::SeqCst) != self.generation {
            return None;
        }
        Some(write.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_queued_writes_are_superseded() {
        let lanes = Arc::new(WriteLanes::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let ticket = lanes.ticket("k");
            let log = log.clone();
            handles.push(tokio::spawn(ticket.run(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.lock().unwrap().push(i);
            })));
        }
        let results: Vec<Option<()>> = {
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            results
        };

        // Only the newest write runs; the earlier two were still queued.
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert_eq!(results, vec![None, None, Some(())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_write_is_not_interrupted() {
        let lanes = Arc::new(WriteLanes::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let log = log.clone();
            tokio::spawn(lanes.ticket("k").run(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                log.lock().unwrap().push("first");
            }))
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let log = log.clone();
            tokio::spawn(lanes.ticket("k").run(async move {
                log.lock().unwrap().push("second");
            }))
        };

        assert_eq!(first.await.unwrap(), Some(()));
        assert_eq!(second.await.unwrap(), Some(()));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let lanes = WriteLanes::default();
        let a = lanes.ticket("a");
        let b = lanes.ticket("b");
        assert_eq!(a.run(async { 1 }).await, Some(1));
        assert_eq!(b.run(async { 2 }).await, Some(2));
    }
}
