use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Owns at most one background task per component. Starting twice is a no-op;
/// stopping signals shutdown and waits for the task so nothing is scheduled
/// after `stop` returns.
pub struct BackgroundTask {
    name: &'static str,
    running: Mutex<Option<RunningTask>>,
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .finish()
    }
}

impl BackgroundTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Spawn the task built by `factory`, handing it a shutdown receiver.
    /// Returns `false` if a task is already running.
    pub async fn spawn<F, Fut>(&self, factory: F) -> bool
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if let Some(task) = running.as_ref() {
            if !task.handle.is_finished() {
                warn!(component = self.name, "Monitoring already active, ignoring start request");
                return false;
            }
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(factory(shutdown_rx));
        *running = Some(RunningTask {
            handle,
            shutdown_tx,
        });
        info!(component = self.name, "Background task started");
        true
    }

    /// Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let task = self.running.lock().await.take();
        let Some(task) = task else {
            debug!(component = self.name, "Stop requested while inactive");
            return false;
        };

        let _ = task.shutdown_tx.send(());
        if let Err(e) = task.handle.await {
            warn!(component = self.name, error = %e, "Background task ended abnormally");
        }
        info!(component = self.name, "Background task stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}

/// Fixed-interval loop. A tick in progress always runs to completion; the
/// shutdown signal is only observed between ticks.
pub async fn run_polling_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => tick().await,
        }
    }

    debug!(component = name, "Polling loop exited");
}
