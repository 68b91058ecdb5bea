// src/engine/lifecycle.rs

//! Process-wide shutdown coordination.
//!
//! One [`ProcessLifecycle`] is created at startup. Ctrl-C (or an explicit
//! [`ProcessLifecycle::shutdown`]) flips a `watch` channel that background
//! tasks such as local ants select on, asks the runtime to stop, and runs
//! the registered hooks in reverse registration order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::RuntimeEvent;

type Hook = Box<dyn FnOnce() + Send>;

pub struct ProcessLifecycle {
    shutdown_tx: watch::Sender<bool>,
    hooks: Mutex<Vec<Hook>>,
}

impl fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("shutting_down", &self.is_shutting_down())
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

impl ProcessLifecycle {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            shutdown_tx,
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Receiver that turns `true` once shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Register a hook to run once on shutdown.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Start shutdown. Only the first call runs the hooks.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("shutdown already in progress");
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        info!(hooks = hooks.len(), "shutting down");
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }

    /// Ctrl-C → graceful shutdown of the runtime and of everything
    /// subscribed to this lifecycle.
    pub fn install_ctrl_c(self: &Arc<Self>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received");
            if runtime_tx.send(RuntimeEvent::ShutdownRequested).await.is_err() {
                debug!("runtime already stopped");
            }
            lifecycle.shutdown();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_run_once_in_reverse_order() {
        let lifecycle = ProcessLifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            lifecycle.on_shutdown(move || order.lock().push(i));
        }

        let rx = lifecycle.subscribe();
        assert!(!*rx.borrow());
        lifecycle.shutdown();
        lifecycle.shutdown();

        assert!(*rx.borrow());
        assert!(lifecycle.is_shutting_down());
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let lifecycle = ProcessLifecycle::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        lifecycle.on_shutdown(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let mut rx = lifecycle.subscribe();
        let waiter = tokio::spawn(async move {
            rx.changed().await.is_ok() && *rx.borrow()
        });
        lifecycle.shutdown();

        assert!(waiter.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
