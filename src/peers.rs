//! Storage for peers announced to this node.
//!
//! The node is authoritative only for peers that explicitly announced here;
//! everything else it hands out comes from routing contacts. Each infohash
//! keeps a bounded FIFO of recent announcers, and entries lapse when they
//! are not re-announced.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::infohash::InfoHash;

/// Cap per infohash; the oldest announcement is dropped first.
pub const MAX_PEERS_PER_INFOHASH: usize = 256;

/// Announcements older than this are treated as gone.
pub const PEER_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct Announced {
    addr: SocketAddr,
    at: Instant,
}

/// Infohash -> recently announced peers.
#[derive(Debug, Default)]
pub struct PeerStore {
    torrents: HashMap<InfoHash, VecDeque<Announced>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announce. Re-announcing refreshes the peer's slot.
    pub fn announce(&mut self, info_hash: InfoHash, addr: SocketAddr, now: Instant) {
        let peers = self.torrents.entry(info_hash).or_default();
        peers.retain(|p| p.addr != addr && now.duration_since(p.at) < PEER_TTL);
        if peers.len() >= MAX_PEERS_PER_INFOHASH {
            peers.pop_front();
        }
        peers.push_back(Announced { addr, at: now });
    }

    /// Live peers for `info_hash`, oldest announcement first.
    pub fn peers_for(&self, info_hash: &InfoHash, now: Instant) -> Vec<SocketAddr> {
        self.torrents
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| now.duration_since(p.at) < PEER_TTL)
                    .map(|p| p.addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops lapsed announcements and empty torrents.
    pub fn gc(&mut self, now: Instant) {
        self.torrents.retain(|_, peers| {
            peers.retain(|p| now.duration_since(p.at) < PEER_TTL);
            !peers.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }
}
