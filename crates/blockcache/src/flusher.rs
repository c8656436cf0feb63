//! The background flush loop: periodically runs the same drain
//! [`crate::BlockStore::flush_cache`] performs on demand.
//!
//! Grounded on `bin/objectio-block-gateway/src/flush.rs`'s `flush_loop`,
//! which drives `flush_volume_all` off a `tokio::time::interval` with
//! `MissedTickBehavior::Delay`. That loop lived in a gateway binary; this
//! crate has no binary target, so it's generalized into a library-level
//! task a host process can spawn instead of hand-rolling it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::store::BlockStore;

/// Default tick period for [`spawn`] when a caller has no opinion of its own.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to a spawned background flusher. Dropping it aborts the task;
/// call [`FlusherHandle::stop`] to wait for the current pass to finish
/// instead.
pub struct FlusherHandle {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl FlusherHandle {
    /// Signal the loop to stop after its current tick and wait for it to
    /// exit.
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the periodic flusher. Each tick runs [`BlockStore::flush_cache`];
/// a failed backing-store write for one entry is logged and the pass
/// continues onto the next entry.
pub fn spawn(store: Arc<BlockStore>, interval: Duration) -> FlusherHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if stop_signal.load(Ordering::SeqCst) {
                break;
            }
            if let Err(error) = store.flush_cache().await {
                tracing::error!(%error, "flush pass failed");
            }
        }
    });

    FlusherHandle {
        stop,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryBackingStore;
    use std::collections::HashMap;

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_drains_dirty_entries() {
        let backend = Arc::new(InMemoryBackingStore::new());
        let store = Arc::new(BlockStore::new(backend.clone()));
        store
            .make_file("ns", "a", HashMap::new(), crate::file::FileOpts {
                max_size: 0,
                circular: false,
                ijson: false,
            })
            .await
            .unwrap();
        store.append_data("ns", "a", b"payload").await.unwrap();

        let handle = spawn(Arc::clone(&store), Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(25)).await;
        // Give the spawned task a chance to run after the timer advance.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;

        let key = crate::file::FileKey::new("ns", "a");
        let durable = backend.durable_parts(&key);
        assert_eq!(durable.get(&0).map(|b| b.as_ref()), Some(&b"payload"[..]));

        handle.stop().await;
    }
}
