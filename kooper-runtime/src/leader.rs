//! Gating work on leadership
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

use crate::coordination::LeaderState;

/// Tells whether this replica currently holds leadership
///
/// Controllers ask before handling every item, so implementations should be cheap.
pub trait Leadership: Send + Sync {
    /// Whether this replica may act as the leader right now
    fn is_leader(&self) -> bool;
}

/// Every replica leads, for controllers running a single replica
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysLeader;

impl Leadership for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

impl Leadership for AtomicBool {
    fn is_leader(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl Leadership for watch::Receiver<LeaderState> {
    fn is_leader(&self) -> bool {
        self.borrow().is_leader()
    }
}

impl<L: Leadership + ?Sized> Leadership for Arc<L> {
    fn is_leader(&self) -> bool {
        (**self).is_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::{AlwaysLeader, Leadership};
    use crate::coordination::LeaderState;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use tokio::sync::watch;

    #[test]
    fn leadership_sources() {
        assert!(AlwaysLeader.is_leader());

        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.is_leader());
        flag.store(true, Ordering::Release);
        assert!(flag.is_leader());

        let (tx, rx) = watch::channel(LeaderState::Standby);
        assert!(!rx.is_leader());
        tx.send_replace(LeaderState::Following);
        assert!(!rx.is_leader());
        tx.send_replace(LeaderState::Leading);
        assert!(rx.is_leader());
    }
}
