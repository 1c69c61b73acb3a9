//! Cancellation for in-flight transfers
//!
//! A signal is only observed at suspension points (status polling and
//! propagation waits). Signing and submission are never interrupted.

use crate::error::{TransferError, TransferResult};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Handle used to request cancellation
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Signal observed by the orchestrator
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Keeps `never()` signals alive
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Create a linked handle/signal pair
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx: Arc::new(tx) },
        CancelSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Non-blocking wait that aborts on cancellation
    pub async fn sleep(&mut self, duration: Duration) -> TransferResult<()> {
        if self.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(TransferError::Cancelled),
        }
    }
}
