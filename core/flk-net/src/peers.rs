//! Discovered peer registry.
//!
//! Peers are keyed by identity (hostname-derived). Any authenticated packet
//! refreshes liveness; a periodic sweep evicts peers that have been silent
//! for longer than the timeout. The local node never appears in its own
//! registry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info};
use uuid::Uuid;

use crate::PEER_TIMEOUT_SECS;

/// Everything known about one discovered peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub identity: String,
    pub ip: IpAddr,
    /// Advertised unicast port.
    pub port: u16,
    pub project_id: Uuid,
    pub project_version: String,
    /// Monotonic seconds of the last packet from this peer.
    pub last_seen_secs: f64,
    /// Master priority last heard from this peer.
    pub priority: f32,
    /// Highest election term heard from this peer; never decreases.
    pub election_term_heard: i32,
    /// Last wire sequence number seen, for diagnostics.
    pub last_sequence: Option<u16>,
}

impl PeerRecord {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn describe(&self) -> String {
        format!("{} ({}:{})", self.identity, self.ip, self.port)
    }
}

/// Identity-keyed registry of live peers.
pub struct PeerRegistry {
    local_identity: String,
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new(local_identity: String) -> Self {
        Self {
            local_identity,
            peers: HashMap::new(),
        }
    }

    /// Insert or refresh a peer. The local node is never stored, and a
    /// previously heard election term is never lowered by an update.
    pub fn upsert(&mut self, record: PeerRecord) {
        if record.identity == self.local_identity {
            return;
        }

        match self.peers.get_mut(&record.identity) {
            Some(existing) => {
                let term = existing.election_term_heard.max(record.election_term_heard);
                *existing = record;
                existing.election_term_heard = term;
            }
            None => {
                info!(peer = %record.describe(), "peer discovered");
                self.peers.insert(record.identity.clone(), record);
            }
        }
    }

    /// Refresh liveness for the peer at `addr`, if known. Datagrams arrive
    /// from whatever port the peer's socket is bound to, so the match is by
    /// exact endpoint first, then by unique IP. Returns the peer's identity.
    pub fn touch_addr(&mut self, addr: SocketAddr, now_secs: f64) -> Option<String> {
        let identity = self
            .find_by_addr(addr)
            .map(|p| p.identity.clone())
            .or_else(|| {
                let mut on_ip = self.peers.values().filter(|p| p.ip == addr.ip());
                match (on_ip.next(), on_ip.next()) {
                    (Some(only), None) => Some(only.identity.clone()),
                    _ => None,
                }
            })?;
        self.touch(&identity, now_secs);
        Some(identity)
    }

    /// Refresh liveness by identity.
    pub fn touch(&mut self, identity: &str, now_secs: f64) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.last_seen_secs = now_secs;
        }
    }

    /// Record a heard election term for `identity`; terms never decrease.
    pub fn observe_term(&mut self, identity: &str, term: i32) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.election_term_heard = peer.election_term_heard.max(term);
        }
    }

    /// Record the last wire sequence number from `identity`.
    pub fn observe_sequence(&mut self, identity: &str, sequence: u16) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.last_sequence = Some(sequence);
        }
    }

    /// Evict peers silent for longer than the timeout. Returns the evicted
    /// identities.
    pub fn sweep(&mut self, now_secs: f64) -> Vec<String> {
        let mut evicted = Vec::new();
        self.peers.retain(|identity, peer| {
            let alive = now_secs - peer.last_seen_secs <= PEER_TIMEOUT_SECS;
            if !alive {
                debug!(peer = %identity, "peer evicted after silence");
                evicted.push(identity.clone());
            }
            alive
        });
        evicted
    }

    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&PeerRecord> {
        self.peers
            .values()
            .find(|p| p.ip == addr.ip() && p.port == addr.port())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.peers.values().map(PeerRecord::endpoint).collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        let mut out: Vec<String> = self.peers.values().map(PeerRecord::describe).collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, now: f64) -> PeerRecord {
        PeerRecord {
            identity: identity.to_string(),
            ip: "192.168.1.10".parse().unwrap(),
            port: 7000,
            project_id: Uuid::nil(),
            project_version: "1.0".to_string(),
            last_seen_secs: now,
            priority: 0.5,
            election_term_heard: 0,
            last_sequence: None,
        }
    }

    #[test]
    fn local_node_never_registered() {
        let mut registry = PeerRegistry::new("local".to_string());
        registry.upsert(record("local", 1.0));
        assert!(registry.is_empty());
    }

    #[test]
    fn upsert_deduplicates_by_identity() {
        let mut registry = PeerRegistry::new("local".to_string());
        registry.upsert(record("render-01", 1.0));
        registry.upsert(record("render-01", 2.0));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("render-01").unwrap().last_seen_secs, 2.0);
    }

    #[test]
    fn election_term_never_decreases() {
        let mut registry = PeerRegistry::new("local".to_string());
        let mut rec = record("render-01", 1.0);
        rec.election_term_heard = 5;
        registry.upsert(rec);

        let mut stale = record("render-01", 2.0);
        stale.election_term_heard = 3;
        registry.upsert(stale);
        assert_eq!(registry.get("render-01").unwrap().election_term_heard, 5);

        registry.observe_term("render-01", 4);
        assert_eq!(registry.get("render-01").unwrap().election_term_heard, 5);
        registry.observe_term("render-01", 9);
        assert_eq!(registry.get("render-01").unwrap().election_term_heard, 9);
    }

    #[test]
    fn silent_peers_evicted_after_timeout() {
        let mut registry = PeerRegistry::new("local".to_string());
        registry.upsert(record("render-01", 0.0));
        registry.upsert(record("render-02", 5.0));

        assert!(registry.sweep(9.0).is_empty());

        let evicted = registry.sweep(10.5);
        assert_eq!(evicted, vec!["render-01".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("render-02").is_some());
    }

    #[test]
    fn touch_keeps_peer_alive() {
        let mut registry = PeerRegistry::new("local".to_string());
        registry.upsert(record("render-01", 0.0));
        registry.touch("render-01", 9.0);
        assert!(registry.sweep(12.0).is_empty());
    }
}
