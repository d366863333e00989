//! Background checkpoint and garbage collection tasks.
//!
//! Storage operations block on disk, so every run is moved onto the
//! blocking pool. A checkpoint is taken on each tick of its interval and
//! whenever the write buffer asks for one early.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ledger::{
    BookieStorage, CheckpointOutcome, GcStats, LedgerStorage, Result, StorageError,
};

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub checkpoint_interval: Duration,
    pub gc_interval: Duration,
}

impl From<&Config> for MaintenanceSettings {
    fn from(config: &Config) -> Self {
        Self {
            checkpoint_interval: config.checkpoint_interval(),
            gc_interval: config.gc_interval(),
        }
    }
}

/// Handle on the running maintenance tasks.
#[derive(Debug)]
pub struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Maintenance {
    pub fn start(storage: Arc<BookieStorage>, settings: MaintenanceSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let maintenance = Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        };

        let requests = storage.checkpoint_requests();
        let checkpoint_storage = storage.clone();
        maintenance.spawn_interval(
            "checkpoint",
            settings.checkpoint_interval,
            Some(requests),
            move || checkpoint(checkpoint_storage.clone()),
        );
        maintenance.spawn_interval("gc", settings.gc_interval, None, move || {
            reclaim(storage.clone())
        });

        info!(
            checkpoint_interval_ms = settings.checkpoint_interval.as_millis() as u64,
            gc_interval_secs = settings.gc_interval.as_secs(),
            "Maintenance tasks started"
        );
        maintenance
    }

    /// Stop both loops and wait for any run in progress to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Maintenance task ended abnormally");
            }
        }
        debug!("Maintenance tasks stopped");
    }

    fn spawn_interval<F, Fut, T>(
        &self,
        name: &'static str,
        interval: Duration,
        wakeup: Option<Arc<tokio::sync::Notify>>,
        mut run: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: std::fmt::Debug + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                let requested = async {
                    match &wakeup {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = requested => debug!(task = name, "Early run requested"),
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                match run().await {
                    Ok(outcome) => debug!(task = name, ?outcome, "Maintenance run finished"),
                    Err(StorageError::NotRunning(reason)) => {
                        debug!(task = name, reason, "Storage stopped, ending task");
                        break;
                    }
                    Err(err) => warn!(task = name, error = %err, "Maintenance run failed"),
                }
            }
        });
        self.handles.lock().push(handle);
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Take a checkpoint at the current journal position.
pub async fn checkpoint(storage: Arc<BookieStorage>) -> Result<CheckpointOutcome> {
    blocking(move || {
        let checkpoint = storage.new_checkpoint()?;
        storage.checkpoint(checkpoint)
    })
    .await
}

/// Run one garbage collection cycle.
pub async fn reclaim(storage: Arc<BookieStorage>) -> Result<GcStats> {
    blocking(move || storage.reclaim_disk_space()).await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| StorageError::Interrupted(format!("maintenance task cancelled: {}", err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EntryEnvelope, NoDeletions, StorageOptions};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn create_storage(temp: &TempDir, memtable_limit: u64) -> Arc<BookieStorage> {
        let options = StorageOptions::builder()
            .journal_dir(temp.path().join("journal"))
            .ledger_dirs(vec![temp.path().join("ledgers")])
            .memtable_limit(memtable_limit)
            .build();
        let storage = Arc::new(BookieStorage::new(options, Arc::new(NoDeletions)));
        storage.start().unwrap();
        storage
    }

    fn add(storage: &BookieStorage, entry_id: i64) {
        let envelope = EntryEnvelope::builder()
            .ledger_id(1)
            .entry_id(entry_id)
            .last_add_confirmed(entry_id - 1)
            .master_key(Bytes::from_static(b"k"))
            .body(Bytes::from(vec![7u8; 256]))
            .build();
        storage.add_entry(envelope.encode()).unwrap();
    }

    async fn wait_for_checkpoint(storage: &BookieStorage) {
        for _ in 0..200 {
            if storage.status().metrics.checkpoints_completed > 0 {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no checkpoint was taken");
    }

    #[tokio::test]
    async fn test_periodic_checkpoint_drains_buffer() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp, 64 * 1024 * 1024);
        add(&storage, 0);
        assert!(storage.status().buffered_bytes > 0);

        let maintenance = Maintenance::start(
            storage.clone(),
            MaintenanceSettings {
                checkpoint_interval: Duration::from_millis(20),
                gc_interval: Duration::from_secs(3600),
            },
        );
        wait_for_checkpoint(&storage).await;
        maintenance.shutdown().await;

        assert_eq!(storage.status().buffered_bytes, 0);
        assert_eq!(storage.get_entry(1, 0).unwrap().len(), 24 + 256);
    }

    #[tokio::test]
    async fn test_full_buffer_requests_early_checkpoint() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp, 4096);

        let maintenance = Maintenance::start(
            storage.clone(),
            MaintenanceSettings {
                checkpoint_interval: Duration::from_secs(3600),
                gc_interval: Duration::from_secs(3600),
            },
        );
        for entry_id in 0..32 {
            add(&storage, entry_id);
        }
        wait_for_checkpoint(&storage).await;
        maintenance.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_ends_when_storage_stops() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp, 64 * 1024 * 1024);
        storage.shutdown().unwrap();

        let err = checkpoint(storage.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotRunning(_)));
        assert!(reclaim(storage).await.is_err());
    }
}
