use crate::core::error::UnitError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Pause and cancel switches shared by everything a generation runs.
///
/// Units never own one; they borrow the control of the generation that is
/// executing them, so a migrated unit obeys its new generation.
#[derive(Clone, Debug)]
pub struct Control {
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl Control {
    pub fn new(paused: bool) -> Self {
        let (tx, _) = watch::channel(paused);
        Self { cancel: CancellationToken::new(), pause: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.send_if_modified(|p| {
            let changed = *p != paused;
            *p = paused;
            changed
        });
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Parks until the pause flag clears. Cancellation wins over a pause.
    pub async fn wait_resumed(&self) -> Result<(), UnitError> {
        let mut rx = self.pause.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UnitError::Cancelled),
            r = rx.wait_for(|paused| !*paused) => {
                r.map(|_| ()).map_err(|_| UnitError::Cancelled)
            }
        }
    }

    /// A suspension point: fails on cancel, blocks while paused.
    pub async fn checkpoint(&self) -> Result<(), UnitError> {
        if self.is_cancelled() {
            return Err(UnitError::Cancelled);
        }
        if self.is_paused() {
            self.wait_resumed().await?;
        }
        Ok(())
    }

    /// Sleeps unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), UnitError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UnitError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn checkpoint_passes_when_running() {
        let c = Control::default();
        c.checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_blocks_until_resume() {
        let c = Control::new(true);
        let c2 = c.clone();
        let waiter = tokio::spawn(async move { c2.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        c.set_paused(false);
        let r = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn cancel_releases_paused_unit() {
        let c = Control::new(true);
        let c2 = c.clone();
        let waiter = tokio::spawn(async move { c2.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.cancel();
        let r = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(matches!(r, Err(UnitError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_cancel() {
        let c = Control::default();
        c.cancel();
        let r = timeout(Duration::from_secs(1), c.sleep(Duration::from_secs(30))).await.unwrap();
        assert!(matches!(r, Err(UnitError::Cancelled)));
    }
}
