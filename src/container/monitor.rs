//! Per-container monitor workers
//!
//! A worker wakes every interval, checks that the container's init process
//! is still alive and stores a fresh usage sample on the record. It ends when
//! the container leaves `running` or its cancellation channel fires.
//!
//! Rounds that find the root lock taken are skipped. The state file decides
//! whether the container still exists, so a worker never writes state for a
//! container another instance stopped or removed.

use super::lifecycle::Shared;
use crate::runtime::is_alive;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug)]
pub struct MonitorHandle {
    cancel: Sender<()>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(shared: Arc<Shared>, container_id: String) -> io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("monitor-{}", container_id))
            .spawn(move || {
                tracing::debug!(container = %container_id, "monitor started");
                loop {
                    match cancelled.recv_timeout(shared.monitor_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !probe(&shared, &container_id) {
                        break;
                    }
                }
                tracing::debug!(container = %container_id, "monitor exited");
            })?;
        Ok(Self { cancel, thread })
    }

    /// Cancel the worker and wait for it to finish
    pub fn stop(self) {
        let _ = self.cancel.send(());
        if self.thread.join().is_err() {
            tracing::error!("monitor thread panicked");
        }
    }
}

/// One monitoring round; false once there is nothing left to watch
fn probe(shared: &Shared, container_id: &str) -> bool {
    // a lifecycle call, in this instance or another, owns the container
    let lock = match shared.try_lock() {
        Ok(Some(lock)) => lock,
        Ok(None) => return true,
        Err(e) => {
            tracing::error!(container = container_id, "monitor: {}", e);
            return true;
        }
    };

    {
        let mut registry = match shared.write() {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!(container = container_id, "monitor: {}", e);
                return false;
            }
        };
        match registry.entries.get(container_id) {
            None => return false,
            Some(entry) if !entry.record.is_running() => return false,
            Some(entry) if entry.busy => return true,
            Some(_) => {}
        }

        let saved = match shared.store.load(container_id) {
            Ok(saved) => saved,
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                tracing::info!(container = container_id, "container removed by another instance");
                if let Some(mut process) = registry
                    .entries
                    .remove(container_id)
                    .and_then(|mut entry| entry.process.take())
                {
                    let _ = process.try_wait();
                }
                return false;
            }
            Err(e) => {
                tracing::error!(container = container_id, "Failed to read state: {}", e);
                return true;
            }
        };
        let Some(entry) = registry.entries.get_mut(container_id) else {
            return false;
        };
        if !saved.is_running() {
            tracing::info!(
                container = container_id,
                status = %saved.status,
                "container stopped by another instance"
            );
            if let Some(mut process) = entry.process.take() {
                let _ = process.try_wait();
            }
            entry.record = saved;
            return false;
        }

        let exited = match entry.process.as_mut() {
            Some(process) => process.try_wait(),
            None => Ok(!entry.record.pid.is_some_and(is_alive)),
        };
        match exited {
            Ok(true) => {
                let exit_code = entry.process.take().and_then(|p| p.exit_code());
                entry.record.mark_stopped(exit_code);
                tracing::info!(container = container_id, ?exit_code, "container exited");
                if let Err(e) = shared.store.save(&entry.record) {
                    tracing::error!(container = container_id, "Failed to save state: {}", e);
                }
                return false;
            }
            Ok(false) => {}
            Err(e) => tracing::error!(container = container_id, "liveness probe failed: {}", e),
        }
    }
    drop(lock);

    match shared.backend.sample_usage(container_id) {
        Ok(sample) => {
            if let Ok(mut registry) = shared.write() {
                if let Some(entry) = registry.entries.get_mut(container_id) {
                    if entry.record.is_running() {
                        entry.record.last_usage = Some(sample);
                    }
                }
            }
            tracing::trace!(
                container = container_id,
                memory = sample.memory_bytes,
                cpu = sample.cpu_seconds,
                pids = sample.pid_count,
                "usage sample"
            );
        }
        Err(e) => tracing::error!(container = container_id, "usage sample failed: {}", e),
    }
    true
}
