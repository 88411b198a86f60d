use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Periodic background jobs with stop-and-join shutdown.
///
/// A job never runs concurrently with itself, and once [`Scheduler::shutdown`]
/// returns no job is running or will run again.
#[derive(Debug)]
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    jobs: Vec<(String, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Vec::new(),
        }
    }

    /// Run `job` every `period`, the first time one period from now.
    ///
    /// Jobs do file I/O and take blocking locks, so each run happens on the
    /// blocking pool. Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, name: &str, period: Duration, job: F)
    where
        F: FnMut() + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job_name = name.to_string();
        let job = Arc::new(Mutex::new(job));
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    // a pending shutdown wins over a due tick
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        debug!("Running scheduled job '{job_name}'");
                        let job = job.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || (&mut *job.lock())()).await {
                            warn!("Scheduled job '{job_name}' panicked: {e}");
                        }
                    }
                }
            }
            debug!("Scheduled job '{job_name}' stopped");
        });
        self.jobs.push((name.to_string(), handle));
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Signal every job to stop and wait until each one has exited.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.jobs.drain(..) {
            if let Err(e) = handle.await {
                info!("Scheduled job '{name}' ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
