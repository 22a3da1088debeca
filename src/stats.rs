//! Monotonic counters, exported since process start.

use std::sync::atomic::{AtomicU64, Ordering};

/// Activity counters shared between the event loop and the application.
///
/// All counters only ever grow; readers see values that are at most one
/// event stale.
#[derive(Debug, Default)]
pub struct Stats {
    nodes_reached: AtomicU64,
    get_peers_dupes: AtomicU64,
    find_node_dupes: AtomicU64,
    peers: AtomicU64,
    sent_find_node: AtomicU64,
    sent_get_peers: AtomicU64,
    results_dropped: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct nodes that have answered at least one query.
    pub fn total_nodes_reached(&self) -> u64 {
        self.nodes_reached.load(Ordering::Relaxed)
    }

    /// `get_peers` sends suppressed because the address was already
    /// queried in the same lookup.
    pub fn total_get_peers_dupes(&self) -> u64 {
        self.get_peers_dupes.load(Ordering::Relaxed)
    }

    /// `find_node` sends suppressed the same way.
    pub fn total_find_node_dupes(&self) -> u64 {
        self.find_node_dupes.load(Ordering::Relaxed)
    }

    /// Peer hints delivered to the application.
    pub fn total_peers(&self) -> u64 {
        self.peers.load(Ordering::Relaxed)
    }

    pub fn total_sent_find_node(&self) -> u64 {
        self.sent_find_node.load(Ordering::Relaxed)
    }

    pub fn total_sent_get_peers(&self) -> u64 {
        self.sent_get_peers.load(Ordering::Relaxed)
    }

    /// Result batches dropped because the application was not draining the
    /// bounded results channel.
    pub fn total_results_dropped(&self) -> u64 {
        self.results_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn node_reached(&self) {
        self.nodes_reached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get_peers_dupes(&self, n: u64) {
        self.get_peers_dupes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn find_node_dupes(&self, n: u64) {
        self.find_node_dupes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn peers_found(&self, n: u64) {
        self.peers.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sent_find_node(&self) {
        self.sent_find_node.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sent_get_peers(&self) {
        self.sent_get_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn result_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }
}
