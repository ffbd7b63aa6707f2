//! Periodic driver for the controller tick and the repository refresh.
//! Each registered job runs on its own task; `notify()` releases every
//! job's wait so the next run starts immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

pub struct Scheduler {
    cancel: CancellationToken,
    notify: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            cancel: CancellationToken::new(),
            notify: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a job that runs once immediately and then every
    /// `interval`, or earlier when someone calls [`Scheduler::notify`].
    /// Jobs are expected to contain their own errors.
    pub fn add_job<F, Fut>(&self, name: &'static str, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let notify = self.notify.clone();
        let handle = tokio::spawn(
            async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    job().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
            .instrument(info_span!("scheduler", job = name)),
        );
        self.handles.lock().push(handle);
    }

    /// Wake every registered job for an immediate re-run.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scheduler job panicked: {e}");
            }
        }
    }
}
