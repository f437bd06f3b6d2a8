// Cooperative cancellation for running primitives

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::MotionError;

/// Raises the abort flag seen by every `AbortSignal` of the same pair
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Read side, checked by primitives at every tick
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arm before the next command
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<(), MotionError> {
        if self.is_raised() {
            Err(MotionError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with `Aborted` if raised
    pub async fn sleep(&self, duration: Duration) -> Result<(), MotionError> {
        let mut rx = self.rx.clone();
        let raised = async move {
            // A dropped handle can never raise the flag
            if rx.wait_for(|raised| *raised).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = raised => Err(MotionError::Aborted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_when_not_raised() {
        let (_handle, signal) = abort_pair();
        let start = Instant::now();
        signal.sleep(Duration::from_millis(40)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_sleep() {
        let (handle, signal) = abort_pair();
        let start = Instant::now();

        let (result, _) = tokio::join!(signal.sleep(Duration::from_secs(10)), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.abort();
        });

        assert!(matches!(result, Err(MotionError::Aborted)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(signal.check().is_err());

        handle.clear();
        assert!(!signal.is_raised());
        assert!(signal.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_sleeps_normally() {
        let signal = AbortSignal::never();
        assert!(!signal.is_raised());
        signal.sleep(Duration::from_millis(5)).await.unwrap();
    }

    #[test]
    fn test_handle_signal_share_flag() {
        let (handle, _) = abort_pair();
        let signal = handle.signal();
        handle.abort();
        assert!(handle.is_raised());
        assert!(signal.is_raised());
    }
}
