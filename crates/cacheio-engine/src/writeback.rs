//! Background writeback
//!
//! One thread flushes the dirty list whenever the registry signals new dirty
//! objects or the flush interval passes. Each round also trims clean pages
//! over the cache capacity and, on its own interval, retries teardown of
//! orphaned objects.

use crate::flush::FlushCoordinator;
use crate::registry::{FileObjectRegistry, FlushSignal};
use cacheio_common::{Error, IoFlags, Result, WritebackConfig};
use cacheio_storage::PageCache;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct WritebackWorker {
    shutdown: Arc<AtomicBool>,
    signal: FlushSignal,
    rounds: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackWorker {
    /// Spawn the worker thread.
    pub fn start(
        flush: Arc<FlushCoordinator>,
        registry: Arc<FileObjectRegistry>,
        cache: Arc<dyn PageCache>,
        config: WritebackConfig,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let rounds = Arc::new(AtomicU64::new(0));
        let signal = registry.flush_signal().clone();

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_rounds = Arc::clone(&rounds);
        let receiver = signal.receiver();
        let handle = thread::Builder::new()
            .name("cacheio-writeback".into())
            .spawn(move || {
                info!(
                    interval_ms = config.flush_interval_ms,
                    synchronized = config.flush_synchronized,
                    "writeback worker started"
                );

                let flags = if config.flush_synchronized {
                    IoFlags::DATA_SYNCHRONIZED
                } else {
                    IoFlags::empty()
                };
                let mut last_sweep = Instant::now();

                while !worker_shutdown.load(Ordering::Acquire) {
                    match receiver.recv_timeout(config.flush_interval()) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if worker_shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    if let Err(e) = flush.flush_file_objects(None, flags) {
                        warn!(error = %e, "writeback flush failed, retrying next round");
                        // The failed objects re-signalled; wait out the interval.
                        while receiver.try_recv().is_ok() {}
                    }

                    let trimmed = cache.trim();
                    if last_sweep.elapsed() >= config.orphan_sweep_interval() {
                        let retried = registry.cleanup_file_objects();
                        if retried > 0 {
                            info!(retried, "retried orphaned file objects");
                        }
                        last_sweep = Instant::now();
                    }

                    worker_rounds.fetch_add(1, Ordering::Relaxed);
                    debug!(trimmed, "writeback round done");
                }

                info!("writeback worker stopped");
            })
            .map_err(|e| Error::resources(format!("failed to spawn writeback thread: {e}")))?;

        Ok(Self {
            shutdown,
            signal,
            rounds,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Completed flush rounds
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify();

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("writeback worker panicked");
            }
        }
    }
}

impl Drop for WritebackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
