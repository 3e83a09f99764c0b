//! Graceful shutdown coordinator
//!
//! Long-running tasks (signaling server, signaling link, store flusher, node
//! loop) subscribe before they start and stop cooperatively when the signal
//! arrives. Tasks registered with [`ShutdownCoordinator::register_task`] are
//! awaited up to the configured timeout and aborted afterwards.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    completed: Notify,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            completed: Notify::new(),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Track a task that must finish (or be aborted) during shutdown
    pub fn register_task(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), handle));
    }

    fn take_tasks(&self) -> Vec<(String, JoinHandle<()>)> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Initiate graceful shutdown and wait for registered tasks
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }

        info!("Initiating graceful shutdown");
        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            // No live subscribers; registered tasks are still drained below
            warn!("No subscribers for shutdown signal");
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        for (name, mut handle) in self.take_tasks() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(task = %name, "Task stopped"),
                Ok(Err(e)) => error!(task = %name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, "Task did not stop before timeout, aborting");
                    handle.abort();
                }
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        self.completed.notify_waiters();
        info!("Shutdown complete");
    }

    /// Initiate immediate shutdown, aborting registered tasks
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");

        *self.state.write().await = ShutdownState::Shutdown;

        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Immediate) {
            error!("Failed to send immediate shutdown signal: {}", e);
        }
        for (_, handle) in self.take_tasks() {
            handle.abort();
        }
        self.completed.notify_waiters();
    }

    /// Check if shutdown is in progress
    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    /// Get current state
    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait until shutdown has finished draining tasks
    pub async fn wait_for_completion(&self) {
        let notified = self.completed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if *self.state.read().await == ShutdownState::Shutdown {
            return;
        }
        notified.await;
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: std::sync::Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown().await;
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: std::sync::Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_cooperative_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let stopped = Arc::new(AtomicBool::new(false));

        let mut rx = coordinator.subscribe();
        let flag = stopped.clone();
        coordinator.register_task(
            "worker",
            tokio::spawn(async move {
                let _ = rx.recv().await;
                flag.store(true, Ordering::SeqCst);
            }),
        );

        assert_eq!(coordinator.state().await, ShutdownState::Running);
        coordinator.shutdown().await;

        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted_after_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        coordinator.register_task(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );

        coordinator.shutdown().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down().await);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_broadcasts() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut rx = coordinator.subscribe();

        coordinator.shutdown_immediately().await;

        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Immediate);
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }

    #[tokio::test]
    async fn test_wait_for_completion_returns_after_drain() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)));
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_completion().await })
        };
        tokio::task::yield_now().await;

        coordinator.shutdown().await;
        waiter.await.unwrap();

        // Already complete: returns immediately
        coordinator.wait_for_completion().await;
    }
}
