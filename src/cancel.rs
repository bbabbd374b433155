//! Cancellation plumbing.
//!
//! A `CancelSource` owns the right to cancel; `CancelToken`s observe it.
//! Dropping a source counts as cancelling it, so an abandoned download can
//! never strand its worker tasks. Child sources follow their parent: when
//! the parent cancels (or drops), every child cancels with it.

use tokio::sync::watch;

/// The owning half of a cancellation pair.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// The observing half. Cloneable and cheap to pass into tasks.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelSource { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Creates a source that cancels whenever this one does, while remaining
    /// independently cancellable.
    pub fn child(&self) -> CancelSource {
        let child = CancelSource::new();
        let mut parent_rx = self.tx.subscribe();
        let child_tx = child.tx.clone();
        tokio::spawn(async move {
            // Err means the parent was dropped, which counts as cancelled.
            let _ = parent_rx.wait_for(|&cancelled| cancelled).await;
            child_tx.send_replace(true);
        });
        child
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never fire. Useful for callers without a lifetime to
    /// bound.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open forever.
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the source cancels or is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|&cancelled| cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_fires_tokens() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // must not hang
    }

    #[tokio::test]
    async fn dropping_source_counts_as_cancel() {
        let source = CancelSource::new();
        let token = source.token();
        drop(source);
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn child_follows_parent() {
        let parent = CancelSource::new();
        let child = parent.child();
        let token = child.token();
        assert!(!token.is_cancelled());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("child token must fire after parent cancels");
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent_alone() {
        let parent = CancelSource::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.token().is_cancelled());
    }
}
