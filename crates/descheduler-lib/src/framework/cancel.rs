use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cooperative stop condition for a cycle: a deadline, an external signal,
/// or both
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    deadline: Option<Instant>,
    signal: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// Never cancelled
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a deadline `timeout` from now; an earlier deadline is kept
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Cancelled once `true` is sent on the channel
    pub fn with_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.signal
            .as_ref()
            .map(|signal| *signal.borrow())
            .unwrap_or(false)
    }

    /// Resolves once the deadline passes or the signal fires; pending
    /// forever for [`Cancellation::none`]
    pub async fn cancelled(&self) {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let signal = async {
            match self.signal.clone() {
                Some(mut signal) => {
                    let fired = signal.wait_for(|stop| *stop).await.map(|_| ());
                    if fired.is_err() {
                        // sender gone without cancelling
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = deadline => {}
            _ = signal => {}
        }
    }

    /// Drive `work` to completion unless cancellation comes first
    pub async fn run_until<F: Future>(&self, work: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            output = work => Some(output),
            _ = self.cancelled() => None,
        }
    }
}
