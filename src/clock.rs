//! Time and execution abstraction.
//!
//! The distilled contract lists four provider seams — UUID, Timestamp,
//! Sleep, Executor. `Uuid::new_v4()` needs no provider in Rust (it's a pure
//! function, not an I/O boundary), so what remains composes naturally into
//! two small traits: a clock (now + sleep + scoped timers) and a spawner
//! (detached task execution), mirroring the teacher's `time.rs` platform-time
//! abstraction but collapsed since this crate targets native only.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstraction over wall-clock time and delayed/periodic execution.
///
/// The production implementation ([`TokioClock`]) wraps `tokio::time`; a
/// test double can advance virtual time via `tokio::time::pause`/`advance`
/// without needing its own trait implementation, since `TokioClock` already
/// defers to the ambient tokio runtime.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep the calling task for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Abstraction over detached task execution, standing in for the
/// distilled contract's "Executor" provider.
pub trait Spawner: Send + Sync + 'static {
    /// Run `fut` to completion on a separate execution context, never
    /// blocking the caller.
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Production [`Clock`]/[`Spawner`] backed by the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

impl Spawner for TokioClock {
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_clock_sleeps() {
        let clock = TokioClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(1)).await;
        let after = clock.now();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn tokio_clock_spawns_and_runs() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let clock = TokioClock;
        clock.spawn(Box::pin(async move {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
