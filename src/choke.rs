//! The Choking Manager: tracks which peers are interested in us and decides
//! who to unchoke, independently of the per-session tit-for-tat serving
//! balance in `peer::session`.

use std::{collections::HashSet, net::SocketAddr};

use tokio::sync::RwLock;

/// A pluggable unchoke decision. Given the currently interested peers and
/// how many may be unchoked at once, returns the subset to unchoke.
///
/// The default policy here is deliberately simple (first-come, round-robin
/// is a later refinement an embedding application can swap in); the point
/// is that `ChokingManager` itself doesn't hardcode a strategy.
pub(crate) trait UnchokePolicy: Send + Sync {
    fn select(
        &self,
        interested: &HashSet<SocketAddr>,
        slots: usize,
    ) -> HashSet<SocketAddr>;
}

/// Unchokes whichever interested peers were discovered first, up to
/// `slots`.
#[derive(Default)]
pub(crate) struct FifoUnchoke;

impl UnchokePolicy for FifoUnchoke {
    fn select(
        &self,
        interested: &HashSet<SocketAddr>,
        slots: usize,
    ) -> HashSet<SocketAddr> {
        interested.iter().take(slots).copied().collect()
    }
}

/// Registry of peers currently declaring interest in us, and the unchoke
/// decision derived from it.
pub(crate) struct ChokingManager {
    interested: RwLock<HashSet<SocketAddr>>,
    unchoked: RwLock<HashSet<SocketAddr>>,
    policy: Box<dyn UnchokePolicy>,
    slots: usize,
}

impl ChokingManager {
    pub fn new(slots: usize) -> Self {
        Self::with_policy(slots, Box::new(FifoUnchoke::default()))
    }

    pub fn with_policy(slots: usize, policy: Box<dyn UnchokePolicy>) -> Self {
        Self {
            interested: RwLock::new(HashSet::new()),
            unchoked: RwLock::new(HashSet::new()),
            policy,
            slots,
        }
    }

    /// Registers interest from `peer`, forwarded from the session on an
    /// `interested` message.
    pub async fn report_interested(&self, peer: SocketAddr) {
        self.interested.write().await.insert(peer);
        self.reassess().await;
    }

    /// Removes `peer` from the interested set, forwarded on
    /// `not_interested` or session teardown.
    pub async fn report_uninterested(&self, peer: SocketAddr) {
        self.interested.write().await.remove(&peer);
        self.unchoked.write().await.remove(&peer);
        self.reassess().await;
    }

    /// Re-runs the unchoke policy over the current interested set. Called
    /// reactively on every interest change, and periodically by the
    /// orchestrator's choking ticker so a policy that rotates unchoke slots
    /// over time (unlike the default FIFO policy) gets the chance to.
    pub async fn tick(&self) {
        self.reassess().await;
    }

    async fn reassess(&self) {
        let interested = self.interested.read().await;
        let chosen = self.policy.select(&interested, self.slots);
        *self.unchoked.write().await = chosen;
    }

    /// Returns whether `peer` should currently be unchoked.
    pub async fn should_unchoke(&self, peer: &SocketAddr) -> bool {
        self.unchoked.read().await.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_unchokes_up_to_slot_count() {
        let manager = ChokingManager::new(1);
        manager.report_interested(addr(1)).await;
        manager.report_interested(addr(2)).await;
        let mut unchoked_count = 0;
        if manager.should_unchoke(&addr(1)).await {
            unchoked_count += 1;
        }
        if manager.should_unchoke(&addr(2)).await {
            unchoked_count += 1;
        }
        assert_eq!(unchoked_count, 1);
    }

    #[tokio::test]
    async fn test_uninterested_clears_unchoke() {
        let manager = ChokingManager::new(5);
        manager.report_interested(addr(1)).await;
        assert!(manager.should_unchoke(&addr(1)).await);
        manager.report_uninterested(addr(1)).await;
        assert!(!manager.should_unchoke(&addr(1)).await);
    }
}
