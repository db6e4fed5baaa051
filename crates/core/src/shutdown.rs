//! Cancellation primitives built on `tokio::sync::watch`.
//!
//! A [`CancellationSource`] owns the flag; any number of [`CancelToken`]s
//! observe it. Once cancelled a source never resets.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationSource {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Creates a source that is also cancelled when `parent` is.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child_of(parent: &CancelToken) -> Self {
        let source = Self::new();
        source.cancel_on(parent.clone());
        source
    }

    /// Cancels this source once `trigger` fires.
    ///
    /// The forwarding task ends as soon as either side is cancelled.
    pub fn cancel_on(&self, trigger: CancelToken) {
        if trigger.is_cancelled() {
            self.cancel();
            return;
        }

        let sender = self.sender.clone();
        let own = self.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = trigger.cancelled() => {
                    sender.send_replace(true);
                }
                _ = own.cancelled() => {}
            }
        });
    }

    /// Triggers cancellation. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.sender.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.receiver.clone(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the owning source is cancelled or dropped.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
