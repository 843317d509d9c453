//! Cooperative shutdown signalling.
//!
//! Every long-running loop in the hub (MQTT consume loop, raw forwarding
//! loop, drain loop) checks a [`Shutdown`] watch channel once per iteration.
//! Nothing is cancelled mid-flight; loops finish the item in hand and exit at
//! the next boundary.

use std::sync::Arc;

use tokio::sync::watch;

/// Clonable trigger for cooperative loop shutdown.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Asks every subscribed loop to stop at its next iteration boundary.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver for one loop to select on.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits until the signal is triggered (or immediately if it already was).
pub async fn triggered(rx: &mut watch::Receiver<bool>) {
    // wait_for only errs when the sender is dropped, which also means no one
    // can trigger anymore; treat it as shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}
