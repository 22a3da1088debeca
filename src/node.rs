//! Node identities and contacts.
//!
//! A DHT node is identified by a 160-bit id; closeness between ids is the
//! XOR metric. A [`Contact`] is an observed remote node together with the
//! freshness bookkeeping that drives the routing table's good/questionable/
//! bad discipline.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng as _;
use thiserror::Error;

use crate::infohash::InfoHash;

/// Contacts that answered a query within this window count as good.
pub const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Compact node entry sizes per address family ([BEP-5], [BEP-32]).
pub const COMPACT_V4_LEN: usize = 26;
pub const COMPACT_V6_LEN: usize = 38;

#[derive(Debug, Error)]
#[error("invalid node id length")]
pub struct InvalidNodeId;

/// A 160-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a uniformly random id.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Derives an id tied to an external IP address, in the style of the
    /// DHT security extension: the top 21 bits encode a CRC32C of the
    /// masked address. Local and private addresses get a plain random id.
    pub fn derived_for_ip(ip: IpAddr) -> Self {
        if is_local_network(&ip) {
            return Self::generate();
        }

        let r: u8 = rand::rng().random::<u8>() & 0x07;
        let crc = ip_crc(ip, r);

        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        id[0] = (crc >> 24) as u8;
        id[1] = (crc >> 16) as u8;
        id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
        id[19] = r;
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidNodeId> {
        if bytes.len() != 20 {
            return Err(InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`, comparable as a big-endian 160-bit integer.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the bucket `other` falls into relative to `self`: the
    /// position of the highest-order set bit of the XOR (0..=159), or
    /// `None` when the ids are equal and reside in no bucket.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.distance(other);
        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    /// A random id that falls into bucket `index` relative to `self`:
    /// shares the first `index` bits, differs at bit `index`, random below.
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        if index >= 160 {
            return NodeId::generate();
        }

        let mut id = self.0;
        let byte_idx = index / 8;
        let bit = 7 - (index % 8);

        id[byte_idx] ^= 1 << bit;
        if bit > 0 {
            let random: u8 = rand::rng().random();
            let low_mask = (1u8 << bit) - 1;
            id[byte_idx] = (id[byte_idx] & !low_mask) | (random & low_mask);
        }
        for b in id.iter_mut().skip(byte_idx + 1) {
            *b = rand::rng().random();
        }
        NodeId(id)
    }
}

/// Infohashes live in the same 160-bit space as node ids; lookups treat
/// them as targets directly.
impl From<InfoHash> for NodeId {
    fn from(ih: InfoHash) -> Self {
        NodeId(ih.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Liveness classification of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// Answered a query within [`GOOD_WINDOW`].
    Good,
    /// No traffic for a while, not yet proven dead.
    Questionable,
    /// Failed while questionable, or failed repeatedly.
    Bad,
}

const MAX_FAILURES: u8 = 3;

/// An observed remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub failures: u8,
    /// Queries sent to this contact that have not been answered yet.
    pub pending_queries: u8,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
            pending_queries: 0,
        }
    }

    /// Records a response: fresh traffic clears the failure count.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.failures = 0;
        self.pending_queries = self.pending_queries.saturating_sub(1);
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.pending_queries = self.pending_queries.saturating_sub(1);
    }

    pub fn state(&self, now: Instant) -> Reachability {
        if self.failures >= MAX_FAILURES {
            return Reachability::Bad;
        }
        if now.duration_since(self.last_seen) < GOOD_WINDOW {
            if self.failures == 0 {
                Reachability::Good
            } else {
                Reachability::Questionable
            }
        } else if self.failures > 0 {
            // A failed probe after going questionable condemns the contact.
            Reachability::Bad
        } else {
            Reachability::Questionable
        }
    }

    pub fn is_good(&self, now: Instant) -> bool {
        self.state(now) == Reachability::Good
    }

    /// Parses one compact node entry (26 bytes IPv4, 38 bytes IPv6).
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        match data.len() {
            COMPACT_V4_LEN => {
                let id = NodeId::from_bytes(&data[..20]).ok()?;
                let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
                let port = u16::from_be_bytes([data[24], data[25]]);
                Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
            }
            COMPACT_V6_LEN => {
                let id = NodeId::from_bytes(&data[..20]).ok()?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[20..36]);
                let port = u16::from_be_bytes([data[36], data[37]]);
                Some(Self::new(
                    id,
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
                ))
            }
            _ => None,
        }
    }

    /// Appends this contact's compact entry to `buf`; skips contacts whose
    /// address family does not match `v6`.
    pub fn write_compact(&self, v6: bool, buf: &mut Vec<u8>) -> bool {
        match (self.addr, v6) {
            (SocketAddr::V4(a), false) => {
                buf.extend_from_slice(&self.id.0);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
                true
            }
            (SocketAddr::V6(a), true) => {
                buf.extend_from_slice(&self.id.0);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
                true
            }
            _ => false,
        }
    }
}

fn ip_crc(ip: IpAddr, r: u8) -> u32 {
    const V4_MASK: u32 = 0x030f_3fff;
    const V6_MASK: u64 = 0x0103_070f_1f3f_7fff;

    match ip {
        IpAddr::V4(v4) => {
            let masked = (u32::from(v4) & V4_MASK) | ((r as u32) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & V6_MASK) | ((r as u64) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// True for loopback, link-local, and private ranges, which are exempt from
/// ip-derived node ids.
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
                || o[0] == 127
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback() || seg[0] & 0xffc0 == 0xfe80 || seg[0] & 0xfe00 == 0xfc00
        }
    }
}
