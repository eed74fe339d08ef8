//! Shutdown signalling and panic-isolated restart loops

use crate::health::ComponentStats;
use services_common::IngestResult;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Process-wide shutdown signal
///
/// Cloneable; late subscribers still observe a signal sent earlier.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Untriggered signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Ask every loop to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this only
        // returns on a trigger.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Run a loop in its own task and restart it after a cooldown when it
/// returns an error, panics, or exits while the process is still running
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    cooldown: Duration,
    shutdown: Shutdown,
    stats: Arc<ComponentStats>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = IngestResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            info!(task = name, "Starting supervised task");
            let outcome = tokio::spawn(factory()).await;

            if shutdown.is_triggered() {
                info!(task = name, "Supervised task stopped");
                return;
            }

            match outcome {
                Ok(Ok(())) => warn!(task = name, "Task exited before shutdown"),
                Ok(Err(e)) => error!(task = name, error = %e, "Task failed"),
                Err(join_error) if join_error.is_panic() => {
                    error!(task = name, "Task panicked");
                }
                Err(join_error) => error!(task = name, error = %join_error, "Task aborted"),
            }
            stats.incr("restarts");
            stats.record_failure();

            tokio::select! {
                () = tokio::time::sleep(cooldown) => {}
                () = shutdown.wait() => {
                    info!(task = name, "Shutdown during restart cooldown");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use services_common::IngestError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_shutdown_seen_by_late_waiters() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let clone = shutdown.clone();
        tokio::time::timeout(Duration::from_secs(1), clone.wait())
            .await
            .unwrap();
        assert!(clone.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_panic_and_error() {
        let shutdown = Shutdown::new();
        let stats = Arc::new(ComponentStats::new("flaky"));
        let runs = Arc::new(AtomicU32::new(0));

        let handle = {
            let runs = runs.clone();
            let shutdown_inner = shutdown.clone();
            spawn_supervised(
                "flaky",
                Duration::from_secs(5),
                shutdown.clone(),
                stats.clone(),
                move || {
                    let runs = runs.clone();
                    let shutdown = shutdown_inner.clone();
                    async move {
                        match runs.fetch_add(1, Ordering::SeqCst) {
                            0 => panic!("boom"),
                            1 => Err(IngestError::ConnectionLost("reset".into())),
                            _ => {
                                shutdown.wait().await;
                                Ok(())
                            }
                        }
                    }
                },
            )
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(stats.counter("restarts"), 2);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
