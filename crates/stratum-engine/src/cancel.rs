//! Cooperative cancellation
//!
//! A [`Cancellation`] is checked before each resource transition starts and
//! drives the live watch loops. It never interrupts a transition that is
//! already running.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation token
#[derive(Debug, Clone)]
pub struct Cancellation {
    own: Arc<watch::Sender<bool>>,
    parent: Option<Box<Cancellation>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            parent: None,
        }
    }

    /// A token cancelled by either this token or its own `cancel()`
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.own.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.own.subscribe();
        match &self.parent {
            Some(parent) => {
                tokio::select! {
                    _ = rx.wait_for(|c| *c) => {}
                    _ = Box::pin(parent.cancelled()) => {}
                }
            }
            None => {
                // The sender lives in self, so this only returns on cancel
                let _ = rx.wait_for(|c| *c).await;
            }
        }
    }
}

/// Translate SIGINT / SIGTERM into `token.cancel()`
pub fn install_interrupt_handler(token: Cancellation) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Interrupt received, finishing in-flight work before exit");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
