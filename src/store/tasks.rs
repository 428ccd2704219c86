//! Background workers owned by the store.
//!
//! The store runs a fixed set of loops: `flush_workers` flush loops draining
//! the immutable memtable queue, one compaction backstop re-evaluating the
//! soft-limit triggers, and one metrics loop. They are spawned together by
//! [`Workers::start`] and share a broadcast shutdown signal.
//!
//! Teardown comes in two shapes. [`Workers::shutdown`] is the graceful path
//! used by `close()`: it signals every loop and joins them, so a loop that
//! is mid-round (say, halfway through an SSTable install) finishes the
//! round before exiting, and nothing touches the directory afterwards.
//! [`Workers::shutdown_now`] is for `Drop` on a store that was never
//! closed: `Drop` cannot await, so it signals and aborts the handles
//! instead; each loop dies at its next await point.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::store::state::LsmState;
use crate::store::{compaction, flush, metrics};

/// Handles to the store's background loops.
pub(crate) struct Workers {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    /// Spawns the store's background loops on the ambient tokio runtime:
    /// `config.flush_workers` flush loops, the compaction backstop, and the
    /// metrics loop.
    pub fn start(state: Arc<LsmState>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        for worker in 0..config.flush_workers.max(1) {
            handles.push(tokio::spawn(flush_loop(
                worker,
                state.clone(),
                config.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        handles.push(tokio::spawn(compaction_loop(
            state.clone(),
            config.clone(),
            shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(metrics_loop(
            state,
            config.clone(),
            shutdown_tx.subscribe(),
        )));

        Self {
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Graceful shutdown: signal every loop, then wait for each to exit. A
    /// loop that is mid-round finishes the round first.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        for handle in self.handles.lock()?.drain(..) {
            handle.await?;
        }

        Ok(())
    }

    /// Immediate teardown for contexts that cannot await: signal the loops
    /// and abort their handles without joining.
    pub fn shutdown_now(&self) {
        self.shutdown_tx.send(()).ok();

        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handles.lock().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Workers").field("loops", &count).finish()
    }
}

/// Drains the immutable memtable queue on an interval. Several instances
/// run concurrently; the flush mutex and per-memtable claims keep installs
/// ordered and exclusive, so the copies only add drain throughput.
async fn flush_loop(
    worker: usize,
    state: Arc<LsmState>,
    config: Config,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.workers.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                loop {
                    match flush::flush_oldest(&state, &config) {
                        Ok(Some(_)) => state.memtables.note_async_flush(),
                        Ok(None) => break,
                        Err(e) => {
                            // The claim was returned; the next round or
                            // another flusher retries the memtable.
                            tracing::error!(worker, error = %e, "Background flush failed");
                            break;
                        }
                    }
                }
            }

            _ = shutdown.recv() => {
                tracing::info!(worker, "Flush worker shutting down");
                break;
            }
        }
    }
}

/// Re-evaluates the compaction triggers on an interval. The primary trigger
/// runs inline after every SSTable install; this loop catches work that was
/// skipped because a compaction was already in flight at that moment.
async fn compaction_loop(
    state: Arc<LsmState>,
    config: Config,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.workers.compaction_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = compaction::auto_compact(&state, &config) {
                    // Rescheduled by the next tick or the next install.
                    tracing::error!(error = %e, "Background compaction failed");
                }
            }

            _ = shutdown.recv() => {
                tracing::info!("Compaction worker shutting down");
                break;
            }
        }
    }
}

/// Periodically logs a metrics snapshot.
async fn metrics_loop(
    state: Arc<LsmState>,
    config: Config,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.workers.metrics_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = metrics::log_metrics(&state, &config) {
                    tracing::warn!(error = %e, "Metrics collection failed");
                }
            }

            _ = shutdown.recv() => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::entry::Entry;
    use crate::store::recovery;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn fast_config(dir: &TempDir) -> Config {
        Config::new(dir.path()).memtable_size(2).workers(
            WorkerConfig::default()
                .flush_interval(Duration::from_millis(10))
                .compaction_interval(Duration::from_millis(20))
                .metrics_interval(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_flush_loop_drains_queue() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir);
        let state = Arc::new(recovery::recover_state(&config)?);

        // Two entries fill the active memtable and rotate it.
        state
            .memtables
            .apply(Entry::put(b"a".to_vec(), b"v".to_vec(), 1))?;
        state
            .memtables
            .apply(Entry::put(b"b".to_vec(), b"v".to_vec(), 2))?;
        assert_eq!(state.memtables.immutable_count()?, 1);

        let workers = Workers::start(state.clone(), &config);

        // A flush loop should claim the immutable and install it at L0.
        for _ in 0..100 {
            if state.memtables.immutable_count()? == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.memtables.immutable_count()?, 0);
        assert_eq!(state.num_sstables()?, 1);
        assert!(state.memtables.async_flushes() >= 1);

        workers.shutdown().await
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir);
        let state = Arc::new(recovery::recover_state(&config)?);

        let workers = Workers::start(state.clone(), &config);
        tokio::time::sleep(Duration::from_millis(30)).await;
        workers.shutdown().await?;

        // With the loops gone, a rotated memtable stays queued.
        state
            .memtables
            .apply(Entry::put(b"x".to_vec(), b"v".to_vec(), 10))?;
        state
            .memtables
            .apply(Entry::put(b"y".to_vec(), b"v".to_vec(), 11))?;
        assert_eq!(state.memtables.immutable_count()?, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.memtables.immutable_count()?, 1);
        assert_eq!(state.num_sstables()?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_now_aborts() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir);
        let state = Arc::new(recovery::recover_state(&config)?);

        let workers = Workers::start(state.clone(), &config);
        workers.shutdown_now();

        state
            .memtables
            .apply(Entry::put(b"x".to_vec(), b"v".to_vec(), 10))?;
        state
            .memtables
            .apply(Entry::put(b"y".to_vec(), b"v".to_vec(), 11))?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.memtables.immutable_count()?, 1);

        Ok(())
    }
}
