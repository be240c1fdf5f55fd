//! Connection-attempt orchestrator (§4.G): aggregates the outcome of
//! `connect_to_multiple` across every target in one batch.
//!
//! One [`AttemptShared`] is created per call to `connect_to_multiple` (or
//! its single-target convenience wrappers) and held by every
//! [`crate::node::record::NodeRecord<Initiator>`] spawned for that batch, so
//! that whichever target resolves last (or [`AttemptShared::force_conclude`])
//! fires the aggregate `on_attempt_concluded` callback exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::P2pConnectError;
use crate::ids::NodeId;
use crate::node::record::ConnectedNodeHandle;

/// Per-target outcome recorded once a target resolves.
#[derive(Debug, Clone)]
pub enum TargetOutcome {
    Connected(ConnectedNodeHandle),
    Failed(P2pConnectError),
}

/// Opaque handle to one `connect_to_multiple` batch, returned to the
/// facade caller. `force_conclusion()` is the only operation it exposes
/// beyond identity, per §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

/// Shared bookkeeping for one batch, referenced by every
/// [`crate::node::record::NodeRecord<Initiator>`] spawned for it.
pub struct AttemptShared {
    pub id: AttemptId,
    missing: AtomicUsize,
    concluded: AtomicBool,
    outcomes: Mutex<HashMap<NodeId, TargetOutcome>>,
    /// Targets this batch still owns a live `NodeRecord` for; used by
    /// `force_conclude` to find records to force-close.
    pub(crate) live_targets: Mutex<Vec<NodeId>>,
    on_concluded: Mutex<Option<Box<dyn FnOnce(HashMap<NodeId, TargetOutcome>) + Send>>>,
}

impl AttemptShared {
    pub fn new(
        id: AttemptId,
        target_count: usize,
        on_concluded: Box<dyn FnOnce(HashMap<NodeId, TargetOutcome>) + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            missing: AtomicUsize::new(target_count),
            concluded: AtomicBool::new(false),
            outcomes: Mutex::new(HashMap::new()),
            live_targets: Mutex::new(Vec::new()),
            on_concluded: Mutex::new(Some(on_concluded)),
        })
    }

    /// Record an immediate resolution for `target` that never got a
    /// `NodeRecord` at all (self-target, already-paired, not connected to
    /// broker). Still counts down `missing`.
    pub fn resolve_immediately(self: &Arc<Self>, target: NodeId, outcome: TargetOutcome) {
        self.outcomes.lock().insert(target, outcome);
        self.count_down();
    }

    pub fn register_live(&self, target: NodeId) {
        self.live_targets.lock().push(target);
    }

    /// Record a resolution for a target that did have a live `NodeRecord`
    /// and counts down towards conclusion.
    pub fn resolve(self: &Arc<Self>, target: NodeId, outcome: TargetOutcome) {
        self.live_targets.lock().retain(|t| t != &target);
        self.outcomes.lock().insert(target, outcome);
        self.count_down();
    }

    fn count_down(self: &Arc<Self>) {
        let prev = self.missing.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.conclude();
        }
    }

    /// Force the batch to conclude right now, regardless of `missing`.
    /// Returns the targets that still had a live `NodeRecord` so the
    /// caller can force-close each one (marking DISCONNECTED, per §4.G);
    /// already-resolved targets are untouched.
    pub fn force_conclude_targets(&self) -> Vec<NodeId> {
        self.live_targets.lock().clone()
    }

    pub fn is_concluded(&self) -> bool {
        self.concluded.load(Ordering::SeqCst)
    }

    fn conclude(self: &Arc<Self>) {
        if self.concluded.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = self.on_concluded.lock().take() {
            cb(self.outcomes.lock().clone());
        }
    }

    /// User-forced conclusion: fills in
    /// `ConnectionAttemptClosedByUserForcefully` for every still-live
    /// target and fires the aggregate callback immediately, even if
    /// `missing > 0`. Idempotent with the natural conclusion path via the
    /// same `concluded` flag.
    pub fn force_conclusion(self: &Arc<Self>) {
        let live = self.live_targets.lock().clone();
        for target in live {
            self.outcomes.lock().entry(target).or_insert(TargetOutcome::Failed(
                P2pConnectError::ConnectionAttemptClosedByUserForcefully,
            ));
        }
        self.conclude();
    }
}

impl Clone for TargetOutcome {
    fn clone(&self) -> Self {
        match self {
            Self::Connected(h) => Self::Connected(h.clone()),
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn concludes_when_missing_reaches_zero() {
        let (tx, rx) = mpsc::channel();
        let shared = AttemptShared::new(
            AttemptId(1),
            2,
            Box::new(move |outcomes| {
                tx.send(outcomes).unwrap();
            }),
        );
        shared.resolve_immediately(NodeId::from("a"), TargetOutcome::Failed(P2pConnectError::TriedToConnectToSelf));
        assert!(rx.try_recv().is_err());
        shared.resolve_immediately(NodeId::from("b"), TargetOutcome::Failed(P2pConnectError::TriedToConnectToSelf));
        let outcomes = rx.try_recv().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(shared.is_concluded());
    }

    #[test]
    fn force_conclusion_fills_remaining_targets_and_fires_once() {
        let (tx, rx) = mpsc::channel();
        let shared = AttemptShared::new(
            AttemptId(2),
            2,
            Box::new(move |outcomes| {
                tx.send(outcomes).unwrap();
            }),
        );
        shared.register_live(NodeId::from("a"));
        shared.register_live(NodeId::from("b"));
        shared.force_conclusion();
        let outcomes = rx.try_recv().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes.get(&NodeId::from("a")).unwrap(),
            TargetOutcome::Failed(P2pConnectError::ConnectionAttemptClosedByUserForcefully)
        ));

        // A later natural resolution must not fire the callback again.
        shared.resolve(NodeId::from("a"), TargetOutcome::Failed(P2pConnectError::ConnectionTimeout));
        assert!(rx.try_recv().is_err());
    }
}
