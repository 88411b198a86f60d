use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{Result, StoreError};

/// Observable state of a write queue's drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Waiting for entries.
    Idle,
    /// Persisting entries.
    Draining,
    /// A persist call failed; the queue accepts nothing anymore.
    Faulted,
    /// Shut down after draining what was queued.
    Stopped,
}

impl DrainState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DrainState::Idle,
            1 => DrainState::Draining,
            2 => DrainState::Faulted,
            _ => DrainState::Stopped,
        }
    }
}

#[derive(Debug)]
struct Shared {
    pending: AtomicUsize,
    state: AtomicU8,
    fault: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, state: DrainState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Write-behind staging queue with a single drain thread.
///
/// Producers enqueue from any thread. One blocking worker takes entries in
/// FIFO order and hands them to the persist function, so persistence order is
/// enqueue order. Entries are never dropped: a full queue rejects new entries
/// with [`StoreError::WriteQueueFull`], and a failed persist stops the worker
/// for good.
#[derive(Debug)]
pub struct BufferedWriteQueue<T> {
    name: String,
    threshold: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BufferedWriteQueue<T> {
    /// Start a queue that persists one entry per call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(name: &str, threshold: usize, mut persist: F) -> Self
    where
        F: FnMut(T) -> Result<()> + Send + 'static,
    {
        Self::start_batched(name, threshold, 1, move |batch: Vec<T>| {
            for entry in batch {
                persist(entry)?;
            }
            Ok(())
        })
    }

    /// Start a queue that persists everything queued, up to `max_batch`
    /// entries, in one call.
    pub fn start_batched<F>(name: &str, threshold: usize, max_batch: usize, mut persist: F) -> Self
    where
        F: FnMut(Vec<T>) -> Result<()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            state: AtomicU8::new(DrainState::Idle as u8),
            fault: Mutex::new(None),
        });
        let max_batch = max_batch.max(1);

        let worker_shared = shared.clone();
        let worker_name = name.to_string();
        let worker = tokio::task::spawn_blocking(move || {
            let shared = worker_shared;
            while let Some(first) = rx.blocking_recv() {
                let mut batch = Vec::with_capacity(max_batch.min(64));
                batch.push(first);
                while batch.len() < max_batch {
                    match rx.try_recv() {
                        Ok(entry) => batch.push(entry),
                        Err(_) => break,
                    }
                }
                shared.set_state(DrainState::Draining);

                let count = batch.len();
                let result = persist(batch);
                shared.pending.fetch_sub(count, Ordering::AcqRel);

                if let Err(e) = result {
                    error!("Write queue '{worker_name}' failed to persist {count} entries: {e}");
                    *shared.fault.lock() = Some(e.to_string());
                    rx.close();
                    // entries behind the failed one are never persisted
                    let mut abandoned = 0;
                    while rx.try_recv().is_ok() {
                        abandoned += 1;
                    }
                    shared.pending.fetch_sub(abandoned, Ordering::AcqRel);
                    if abandoned > 0 {
                        error!("Write queue '{worker_name}' abandoned {abandoned} queued entries");
                    }
                    shared.set_state(DrainState::Faulted);
                    return;
                }
                shared.set_state(DrainState::Idle);
            }
            shared.set_state(DrainState::Stopped);
            info!("Write queue '{worker_name}' stopped");
        });

        info!("Write queue '{name}' started (threshold {threshold}, max batch {max_batch})");

        Self {
            name: name.to_string(),
            threshold,
            sender: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `entry` unless the queue holds `threshold` entries or more.
    pub fn enqueue(&self, entry: T) -> Result<()> {
        self.enqueue_within(entry, self.threshold)
    }

    /// Like [`enqueue`](Self::enqueue) with a caller-chosen threshold, used by
    /// batch producers that tolerate a deeper queue.
    pub fn enqueue_within(&self, entry: T, threshold: usize) -> Result<()> {
        self.check_capacity(threshold)?;

        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(StoreError::NotStarted(self.name.clone()));
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(entry).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(self.fault_error());
        }
        Ok(())
    }

    /// Fails the way [`enqueue_within`](Self::enqueue_within) would if an
    /// entry were offered at `threshold` right now.
    pub fn check_capacity(&self, threshold: usize) -> Result<()> {
        self.check_running()?;
        let pending = self.pending();
        if pending >= threshold {
            return Err(StoreError::WriteQueueFull {
                name: self.name.clone(),
                pending,
                threshold,
            });
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DrainState {
        self.shared.state()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop intake, let the worker persist what is already queued and wait
    /// for it to exit.
    ///
    /// Fails with [`StoreError::StreamFaulted`] if the worker stopped on a
    /// persist failure, now or earlier.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| StoreError::StreamFaulted(format!("write queue '{}': {e}", self.name)))?;
        }
        if self.state() == DrainState::Faulted {
            return Err(self.fault_error());
        }
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        match self.state() {
            DrainState::Faulted => Err(self.fault_error()),
            DrainState::Stopped => Err(StoreError::NotStarted(self.name.clone())),
            DrainState::Idle | DrainState::Draining => Ok(()),
        }
    }

    fn fault_error(&self) -> StoreError {
        let reason = self
            .shared
            .fault
            .lock()
            .clone()
            .unwrap_or_else(|| "drain loop exited".to_string());
        StoreError::StreamFaulted(format!("write queue '{}': {reason}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    async fn wait_for_state<T: Send + 'static>(queue: &BufferedWriteQueue<T>, state: DrainState) {
        for _ in 0..200 {
            if queue.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {state:?}, still {:?}", queue.state());
    }

    #[tokio::test]
    async fn test_persists_in_enqueue_order() {
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let sink = persisted.clone();
        let queue = BufferedWriteQueue::start("order", 1_000, move |entry: u32| {
            sink.lock().push(entry);
            Ok(())
        });

        for i in 0..100 {
            queue.enqueue(i).unwrap();
        }
        queue.shutdown().await.unwrap();

        assert_eq!(*persisted.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(queue.state(), DrainState::Stopped);
        assert_eq!(queue.pending(), 0);
        assert!(matches!(queue.enqueue(1), Err(StoreError::NotStarted(_))));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_dropping() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let sink = persisted.clone();
        let queue = BufferedWriteQueue::start("full", 2, move |entry: u32| {
            let _ = gate_rx.recv();
            sink.lock().push(entry);
            Ok(())
        });

        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        let err = queue.enqueue(3).unwrap_err();
        assert!(err.is_backpressure());
        assert!(queue.check_capacity(2).unwrap_err().is_backpressure());
        queue.check_capacity(3).unwrap();
        // a deeper threshold still admits it
        queue.enqueue_within(3, 10).unwrap();

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        queue.shutdown().await.unwrap();
        assert_eq!(*persisted.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batched_drain_takes_everything_queued() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let queue = BufferedWriteQueue::start_batched("batch", 100, 512, move |batch: Vec<u32>| {
            let _ = gate_rx.recv();
            sink.lock().push(batch);
            Ok(())
        });

        queue.enqueue(1).unwrap();
        wait_for_state(&queue, DrainState::Draining).await;
        for i in 2..=4 {
            queue.enqueue(i).unwrap();
        }
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        queue.shutdown().await.unwrap();

        assert_eq!(*batches.lock(), vec![vec![1], vec![2, 3, 4]]);
    }

    #[tokio::test]
    async fn test_persist_failure_faults_the_queue() {
        let queue = BufferedWriteQueue::start("fault", 100, move |entry: u32| {
            if entry == 3 {
                return Err(StoreError::Codec("boom".to_string()));
            }
            Ok(())
        });

        for i in 0..4 {
            queue.enqueue(i).unwrap();
        }
        wait_for_state(&queue, DrainState::Faulted).await;

        match queue.enqueue(10) {
            Err(StoreError::StreamFaulted(reason)) => assert!(reason.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            queue.shutdown().await,
            Err(StoreError::StreamFaulted(_))
        ));
        assert_eq!(queue.state(), DrainState::Faulted);
    }

    #[tokio::test]
    async fn test_fault_releases_entries_queued_behind_it() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let queue = BufferedWriteQueue::start("abandon", 100, move |_entry: u32| {
            let _ = gate_rx.recv();
            Err(StoreError::Codec("disk gone".to_string()))
        });

        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(queue.pending(), 5);
        gate_tx.send(()).unwrap();
        wait_for_state(&queue, DrainState::Faulted).await;

        assert_eq!(queue.pending(), 0);
        assert!(queue.shutdown().await.is_err());
        assert_eq!(queue.pending(), 0);
    }
}
