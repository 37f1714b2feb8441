use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

/// Why a future did not produce its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureError {
    /// The wait deadline elapsed before the task resolved the promise.
    TimedOut,
    /// The promise was dropped without a value (task panicked or was discarded).
    Broken,
}

impl std::fmt::Display for FutureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FutureError::TimedOut => f.write_str("future timed out"),
            FutureError::Broken => f.write_str("promise was abandoned"),
        }
    }
}

/// Producing half of a one-shot result slot.
pub struct Promise<T> {
    tx: SyncSender<T>,
}

impl<T> Promise<T> {
    pub fn set(self, value: T) {
        // The receiver may already be gone, e.g. a caller that gave up waiting.
        let _ = self.tx.send(value);
    }
}

/// Consuming half; every wait in this crate is bounded.
pub struct Future<T> {
    rx: Receiver<T>,
}

impl<T> Future<T> {
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, FutureError> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(FutureError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(FutureError::Broken),
        }
    }

    /// Non-blocking probe, used by callers that poll between work quanta.
    pub fn try_take(&self) -> Result<Option<T>, FutureError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(FutureError::Broken),
        }
    }
}

pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let (tx, rx) = sync_channel(1);
    (Promise { tx }, Future { rx })
}

/// A future that is already resolved, for error paths that never reach a task.
pub fn ready<T>(value: T) -> Future<T> {
    let (p, f) = promise();
    p.set(value);
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_value_is_delivered() {
        let (p, f) = promise();
        p.set(7);
        assert_eq!(f.wait_timeout(Duration::from_secs(1)), Ok(7));
    }

    #[test]
    fn dropped_promise_breaks_the_future() {
        let (p, f) = promise::<i32>();
        drop(p);
        assert_eq!(
            f.wait_timeout(Duration::from_secs(1)),
            Err(FutureError::Broken)
        );
    }

    #[test]
    fn wait_times_out_without_a_value() {
        let (_p, f) = promise::<i32>();
        assert_eq!(
            f.wait_timeout(Duration::from_millis(10)),
            Err(FutureError::TimedOut)
        );
    }

    #[test]
    fn ready_future_resolves_immediately() {
        let f = ready("done");
        assert_eq!(f.try_take(), Ok(Some("done")));
    }
}
