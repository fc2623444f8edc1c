//! Cooperative cancellation for quote handling.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{SwapError, SwapResult};

#[derive(Debug)]
pub struct AbortController {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Controller that also aborts when `parent` does. Must be called from
    /// within a tokio runtime.
    pub fn linked(parent: &AbortSignal) -> Self {
        let controller = Self::new();
        if parent.is_aborted() {
            controller.abort();
            return controller;
        }

        let tx = controller.tx.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.aborted() => {
                    let _ = tx.send(true);
                }
                _ = tx.closed() => {}
            }
        });
        controller
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.rx.clone(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted; pending forever if the controller is gone
    /// without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn check(&self) -> SwapResult<()> {
        if self.is_aborted() {
            return Err(SwapError::Aborted);
        }
        Ok(())
    }

    /// Runs `fut` until it completes or the signal fires.
    pub async fn run<F: Future>(&self, fut: F) -> SwapResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.aborted() => Err(SwapError::Aborted),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn abort_cancels_pending_work() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let task = tokio::spawn(async move {
            signal
                .run(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });
        controller.abort();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(SwapError::Aborted)));
    }

    #[tokio::test]
    async fn linked_controller_follows_parent() {
        let parent = AbortController::new();
        let child = AbortController::linked(&parent.signal());
        let signal = child.signal();
        assert!(!signal.is_aborted());

        parent.abort();
        tokio::time::timeout(Duration::from_secs(1), signal.aborted())
            .await
            .expect("child aborted");
        assert!(signal.check().is_err());
    }

    #[tokio::test]
    async fn child_abort_leaves_parent_untouched() {
        let parent = AbortController::new();
        let child = AbortController::linked(&parent.signal());
        child.abort();
        assert!(child.signal().is_aborted());
        assert!(!parent.signal().is_aborted());
    }

    #[tokio::test]
    async fn never_signal_lets_work_finish() {
        let out = AbortSignal::never().run(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }
}
