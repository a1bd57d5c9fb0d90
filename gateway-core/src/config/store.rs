//! Versioned snapshot installation: content hashing, a bounded rollback
//! ring, and a subscribe operation that coalesces under slow consumers the
//! way a `tokio::sync::watch` channel naturally does (only the latest value
//! is retained between polls).

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::watch;

use super::MCPConfig;
use crate::clock::Clock;

pub const DEFAULT_ROLLBACK_RING_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: u64,
    pub hash: String,
    pub installed_at: i64,
    pub configs: Arc<Vec<MCPConfig>>,
}

impl Snapshot {
    fn new(id: u64, installed_at: i64, configs: Vec<MCPConfig>) -> Self {
        let hash = content_hash(&configs);
        Self {
            id,
            hash,
            installed_at,
            configs: Arc::new(configs),
        }
    }
}

/// Stable serialization (JSON, which preserves field order on this struct
/// family since none of the collections are hash-based) → SHA-256.
pub fn content_hash(configs: &[MCPConfig]) -> String {
    let bytes = serde_json::to_vec(configs).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

pub struct ConfigStore {
    tx: watch::Sender<Snapshot>,
    ring: parking_lot::Mutex<std::collections::VecDeque<Snapshot>>,
    ring_size: usize,
    next_id: std::sync::atomic::AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ConfigStore {
    pub fn new(clock: Arc<dyn Clock>, initial: Vec<MCPConfig>) -> Self {
        let snap = Snapshot::new(0, clock.now_unix_secs(), initial);
        let (tx, _rx) = watch::channel(snap.clone());
        let mut ring = std::collections::VecDeque::new();
        ring.push_back(snap);
        Self {
            tx,
            ring: parking_lot::Mutex::new(ring),
            ring_size: DEFAULT_ROLLBACK_RING_SIZE,
            next_id: std::sync::atomic::AtomicU64::new(1),
            clock,
        }
    }

    pub fn current(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// Installs a new snapshot. Callers must have already run
    /// `validate_all` — the store itself does not validate, it only
    /// versions and publishes.
    pub fn install(&self, configs: Vec<MCPConfig>) -> Snapshot {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let snap = Snapshot::new(id, self.clock.now_unix_secs(), configs);
        {
            let mut ring = self.ring.lock();
            ring.push_back(snap.clone());
            while ring.len() > self.ring_size {
                ring.pop_front();
            }
        }
        // watch::Sender::send only errors if there are no receivers left,
        // which is fine — the current value is still updated for new
        // subscribers.
        let _ = self.tx.send(snap.clone());
        snap
    }

    /// New subscribers get the current snapshot followed by future
    /// installs; a subscriber slower than producers only ever observes the
    /// most recent value (coalescing), never an arbitrary intermediate one,
    /// and never an out-of-order one.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn rollback_to(&self, id: u64) -> Option<Snapshot> {
        let found = {
            let ring = self.ring.lock();
            ring.iter().find(|s| s.id == id).cloned()
        }?;
        let _ = self.tx.send(found.clone());
        Some(found)
    }

    pub fn list_versions(&self) -> Vec<(u64, String, i64)> {
        self.ring
            .lock()
            .iter()
            .map(|s| (s.id, s.hash.clone(), s.installed_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;

    #[test]
    fn hash_is_stable_across_serialize_roundtrip() {
        let configs = vec![];
        let h1 = content_hash(&configs);
        let json = serde_json::to_vec(&configs).unwrap();
        let back: Vec<MCPConfig> = serde_json::from_slice(&json).unwrap();
        let h2 = content_hash(&back);
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn install_and_subscribe_sees_latest() {
        let clock = Arc::new(FakeClock::new(1000));
        let store = ConfigStore::new(clock, vec![]);
        let mut rx = store.subscribe();
        assert_eq!(rx.borrow().id, 0);
        store.install(vec![]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().id, 1);
    }

    #[test]
    fn ring_is_bounded() {
        let clock = Arc::new(FakeClock::new(0));
        let store = ConfigStore::new(clock, vec![]);
        for _ in 0..(DEFAULT_ROLLBACK_RING_SIZE + 10) {
            store.install(vec![]);
        }
        assert_eq!(store.list_versions().len(), DEFAULT_ROLLBACK_RING_SIZE);
    }

    #[test]
    fn rollback_restores_prior_snapshot() {
        let clock = Arc::new(FakeClock::new(0));
        let store = ConfigStore::new(clock, vec![]);
        let mut a = super::super::MCPConfig {
            tenant: "t".into(),
            name: "a".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            routers: vec![],
            servers: vec![],
            tools: vec![],
            prompts: vec![],
            mcp_servers: vec![],
        };
        let v1 = store.install(vec![a.clone()]);
        a.updated_at = 5;
        store.install(vec![a]);
        let rolled = store.rollback_to(v1.id).unwrap();
        assert_eq!(rolled.configs.len(), 1);
        assert_eq!(store.current().id, v1.id);
    }
}
