//! The iterative lookup engine.
//!
//! A lookup walks the id space toward a target by querying the closest
//! known contacts and folding the contacts they return back into a
//! shortlist, keeping at most alpha queries in flight. It terminates once
//! the k closest shortlist entries have all answered or failed, when a
//! deadline passes, or when enough peers have been collected. There are no
//! per-query retries; a timed-out contact is simply marked unreachable for
//! this lookup and the next-closest candidate is tried.
//!
//! Lookups are pure consumers of routing-table snapshots: they never touch
//! the table themselves. The event loop feeds them responses and timeouts
//! and sends whatever queries they request.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::infohash::InfoHash;
use crate::node::{Contact, NodeId};
use crate::routing::K;

/// Queries in flight per lookup. Each lookup gets its own allowance, so a
/// busy lookup cannot starve the others.
pub const ALPHA: usize = 3;

/// Shortlist entries kept beyond the k we are converging on, as spares for
/// when closer candidates fail.
const SHORTLIST_CAP: usize = 4 * K;

/// Identifies a lookup within the event loop.
pub type LookupId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Converge on the contacts closest to an id (bootstrap, bucket
    /// refresh).
    FindNode,
    /// Collect peers for an infohash; optionally announce afterwards.
    GetPeers { announce: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    /// Known but not yet queried.
    New,
    /// Query sent, no answer yet.
    Inflight,
    Responded,
    /// Timed out or failed to send; unreachable for this lookup only.
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: Contact,
    state: CandidateState,
    token: Option<Bytes>,
}

/// One in-progress lookup.
#[derive(Debug)]
pub struct Lookup {
    pub id: LookupId,
    pub kind: LookupKind,
    pub target: NodeId,
    pub info_hash: Option<InfoHash>,
    /// Total peers handed to the application by this lookup.
    pub peers_delivered: usize,
    pub deadline: Option<Instant>,
    /// Shortlist, sorted by XOR distance to the target.
    candidates: Vec<Candidate>,
    /// Every address this lookup has queried, routers included.
    queried: HashSet<SocketAddr>,
    /// Peer hints already emitted, for exactly-once delivery.
    delivered: HashSet<SocketAddr>,
    in_flight: usize,
    /// Outstanding queries to bootstrap routers, which sit outside the
    /// shortlist but still gate termination.
    router_pending: usize,
    /// Tokens supplied by routers; they are announce targets even though
    /// they never join the shortlist.
    router_tokens: HashMap<SocketAddr, Bytes>,
}

impl Lookup {
    pub fn new(
        id: LookupId,
        kind: LookupKind,
        target: NodeId,
        info_hash: Option<InfoHash>,
        seeds: Vec<Contact>,
        deadline: Option<Instant>,
    ) -> Self {
        let mut lookup = Self {
            id,
            kind,
            target,
            info_hash,
            peers_delivered: 0,
            deadline,
            candidates: Vec::with_capacity(SHORTLIST_CAP),
            queried: HashSet::new(),
            delivered: HashSet::new(),
            in_flight: 0,
            router_pending: 0,
            router_tokens: HashMap::new(),
        };
        lookup.merge(seeds);
        lookup
    }

    pub fn announce(&self) -> bool {
        matches!(self.kind, LookupKind::GetPeers { announce: true })
    }

    /// Raises the announce flag; a repeated request with `announce` set
    /// upgrades an already-running lookup.
    pub fn set_announce(&mut self) {
        if let LookupKind::GetPeers { announce } = &mut self.kind {
            *announce = true;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Folds discovered contacts into the shortlist, deduplicating by node
    /// id. Returns how many were suppressed as duplicates of contacts this
    /// lookup already queried.
    pub fn merge(&mut self, contacts: Vec<Contact>) -> usize {
        let mut dupes = 0;
        for contact in contacts {
            if self.queried.contains(&contact.addr) {
                dupes += 1;
                continue;
            }
            if self.candidates.iter().any(|c| c.contact.id == contact.id) {
                dupes += 1;
                continue;
            }
            self.candidates.push(Candidate {
                contact,
                state: CandidateState::New,
                token: None,
            });
        }

        self.candidates
            .sort_by_key(|c| c.contact.id.distance(&self.target));

        // Trim spare un-queried candidates from the tail; entries with
        // history must survive so the accounting stays correct.
        while self.candidates.len() > SHORTLIST_CAP {
            match self
                .candidates
                .iter()
                .rposition(|c| c.state == CandidateState::New)
            {
                Some(pos) if pos >= K => {
                    self.candidates.remove(pos);
                }
                _ => break,
            }
        }
        dupes
    }

    /// Picks the next contacts to query, closest first, keeping at most
    /// `alpha` in flight. A contact is eligible while fewer than k
    /// candidates have responded, or while it is strictly closer than the
    /// k-th responder.
    pub fn next_targets(&mut self, alpha: usize) -> Vec<Contact> {
        let mut picked = Vec::new();
        while self.in_flight + picked.len() < alpha {
            let kth = self.kth_responder_distance();
            let next = self
                .candidates
                .iter_mut()
                .filter(|c| c.state == CandidateState::New)
                .find(|c| match &kth {
                    Some(limit) => &c.contact.id.distance(&self.target) < limit,
                    None => true,
                });
            match next {
                Some(candidate) => {
                    candidate.state = CandidateState::Inflight;
                    picked.push(candidate.contact.clone());
                }
                None => break,
            }
        }
        for contact in &picked {
            self.queried.insert(contact.addr);
            self.in_flight += 1;
        }
        picked
    }

    /// Distance of the k-th closest responder, if k have responded.
    fn kth_responder_distance(&self) -> Option<[u8; 20]> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .nth(K - 1)
            .map(|c| c.contact.id.distance(&self.target))
    }

    /// Records a query sent outside the shortlist (a bootstrap router).
    pub fn note_router_query(&mut self, addr: SocketAddr) {
        self.queried.insert(addr);
        self.router_pending += 1;
    }

    pub fn was_queried(&self, addr: &SocketAddr) -> bool {
        self.queried.contains(addr)
    }

    /// Marks the candidate at `addr` as having answered, keeping its token
    /// for a later announce. A router answering settles its pending slot
    /// without entering the shortlist.
    pub fn on_response(&mut self, addr: SocketAddr, token: Option<Bytes>) {
        match self
            .candidates
            .iter_mut()
            .find(|c| c.contact.addr == addr)
        {
            Some(candidate) => {
                if candidate.state == CandidateState::Inflight {
                    self.in_flight -= 1;
                }
                candidate.state = CandidateState::Responded;
                if token.is_some() {
                    candidate.token = token;
                }
            }
            None if self.queried.contains(&addr) => {
                self.router_pending = self.router_pending.saturating_sub(1);
                if let Some(token) = token {
                    self.router_tokens.insert(addr, token);
                }
            }
            None => {}
        }
    }

    /// Marks the candidate at `addr` unreachable for this lookup.
    pub fn on_failure(&mut self, addr: SocketAddr) {
        match self
            .candidates
            .iter_mut()
            .find(|c| c.contact.addr == addr)
        {
            Some(candidate) => {
                if candidate.state == CandidateState::Inflight {
                    self.in_flight -= 1;
                }
                candidate.state = CandidateState::Failed;
            }
            None if self.queried.contains(&addr) => {
                self.router_pending = self.router_pending.saturating_sub(1);
            }
            None => {}
        }
    }

    /// Filters `peers` down to those not yet delivered by this lookup and
    /// records them as delivered.
    pub fn take_new_peers(&mut self, peers: &[SocketAddr]) -> Vec<SocketAddr> {
        let fresh: Vec<SocketAddr> = peers
            .iter()
            .filter(|p| !self.delivered.contains(p))
            .copied()
            .collect();
        for peer in &fresh {
            self.delivered.insert(*peer);
        }
        self.peers_delivered += fresh.len();
        fresh
    }

    /// Where to announce after convergence: the closest responders that
    /// supplied tokens, padded with token-bearing routers, at most k total.
    pub fn announce_targets(&self) -> Vec<(SocketAddr, Bytes)> {
        let mut targets: Vec<(SocketAddr, Bytes)> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.token.clone().map(|t| (c.contact.addr, t)))
            .take(K)
            .collect();
        for (addr, token) in &self.router_tokens {
            if targets.len() >= K {
                break;
            }
            targets.push((*addr, token.clone()));
        }
        targets
    }

    /// Whether the k closest shortlist entries have all answered or failed
    /// and nothing closer remains to ask.
    fn converged(&self) -> bool {
        if self.in_flight > 0 || self.router_pending > 0 {
            return false;
        }
        let mut settled = 0;
        for candidate in &self.candidates {
            match candidate.state {
                CandidateState::New | CandidateState::Inflight => return false,
                CandidateState::Responded | CandidateState::Failed => {
                    settled += 1;
                    if settled >= K {
                        break;
                    }
                }
            }
        }
        // An exhausted shortlist with nothing in flight also counts; the
        // lookup finishes with whatever it found.
        true
    }

    /// Termination condition; `now` checks the caller-set deadline.
    pub fn finished(&self, now: Instant, num_target_peers: usize) -> bool {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return true;
            }
        }
        if matches!(self.kind, LookupKind::GetPeers { .. })
            && num_target_peers > 0
            && self.peers_delivered >= num_target_peers
        {
            return true;
        }
        self.converged()
    }

    /// The current k closest shortlist entries, regardless of state.
    pub fn closest(&self) -> Vec<&Contact> {
        self.candidates.iter().take(K).map(|c| &c.contact).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = b;
        NodeId(id)
    }

    fn peer(first_byte: u8, last_octet: u8, port: u16) -> Contact {
        Contact::new(id_with_first_byte(first_byte), addr(last_octet, port))
    }

    fn new_lookup(seeds: Vec<Contact>) -> Lookup {
        Lookup::new(
            1,
            LookupKind::FindNode,
            id_with_first_byte(0x00),
            None,
            seeds,
            None,
        )
    }

    #[test]
    fn test_seeds_queried_closest_first_up_to_alpha() {
        let mut lookup = new_lookup(vec![
            peer(0x80, 4, 4004), // farthest
            peer(0x01, 1, 4001), // closest
            peer(0x02, 2, 4002),
            peer(0x04, 3, 4003),
        ]);

        let targets = lookup.next_targets(ALPHA);
        assert_eq!(targets.len(), ALPHA);
        assert_eq!(targets[0].addr, addr(1, 4001));
        assert_eq!(targets[1].addr, addr(2, 4002));
        assert_eq!(targets[2].addr, addr(3, 4003));
        assert_eq!(lookup.in_flight(), ALPHA);

        // Alpha in flight: nothing more until an answer or a timeout.
        assert!(lookup.next_targets(ALPHA).is_empty());
    }

    #[test]
    fn test_response_frees_slot_and_merges_new_candidates() {
        let mut lookup = new_lookup(vec![peer(0x40, 1, 4001)]);
        let targets = lookup.next_targets(ALPHA);
        assert_eq!(targets.len(), 1);

        // The responder introduces someone closer.
        lookup.on_response(addr(1, 4001), None);
        let dupes = lookup.merge(vec![peer(0x10, 2, 4002)]);
        assert_eq!(dupes, 0);

        let targets = lookup.next_targets(ALPHA);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].addr, addr(2, 4002));
    }

    #[test]
    fn test_no_address_queried_twice() {
        let mut lookup = new_lookup(vec![peer(0x10, 1, 4001)]);
        let _ = lookup.next_targets(ALPHA);
        lookup.on_response(addr(1, 4001), None);

        // The same contact comes back from another responder.
        let dupes = lookup.merge(vec![peer(0x10, 1, 4001)]);
        assert_eq!(dupes, 1);
        assert!(lookup.next_targets(ALPHA).is_empty());
    }

    #[test]
    fn test_timeout_moves_to_next_closest() {
        let mut lookup = new_lookup(vec![peer(0x10, 1, 4001)]);
        let _ = lookup.next_targets(ALPHA);
        lookup.merge(vec![peer(0x20, 2, 4002)]);

        lookup.on_failure(addr(1, 4001));
        assert_eq!(lookup.in_flight(), 0);

        let targets = lookup.next_targets(ALPHA);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].addr, addr(2, 4002));
    }

    #[test]
    fn test_converges_when_all_settled() {
        let now = Instant::now();
        let mut lookup = new_lookup(vec![peer(0x10, 1, 4001), peer(0x20, 2, 4002)]);
        assert!(!lookup.finished(now, 0));

        let _ = lookup.next_targets(ALPHA);
        lookup.on_response(addr(1, 4001), None);
        lookup.on_failure(addr(2, 4002));
        assert!(lookup.finished(now, 0));
    }

    #[test]
    fn test_deadline_terminates() {
        let now = Instant::now();
        let mut lookup = Lookup::new(
            1,
            LookupKind::FindNode,
            id_with_first_byte(0x00),
            None,
            vec![peer(0x10, 1, 4001)],
            Some(now + Duration::from_secs(5)),
        );
        let _ = lookup.next_targets(ALPHA);
        assert!(!lookup.finished(now, 0));
        assert!(lookup.finished(now + Duration::from_secs(5), 0));
    }

    #[test]
    fn test_peer_target_terminates_get_peers() {
        let now = Instant::now();
        let mut lookup = Lookup::new(
            1,
            LookupKind::GetPeers { announce: false },
            id_with_first_byte(0x00),
            Some(InfoHash([0u8; 20])),
            vec![peer(0x10, 1, 4001)],
            None,
        );
        let _ = lookup.next_targets(ALPHA);

        let fresh = lookup.take_new_peers(&[addr(9, 9001), addr(9, 9002)]);
        assert_eq!(fresh.len(), 2);
        assert!(lookup.finished(now, 2));
        assert!(!lookup.finished(now, 3));
    }

    #[test]
    fn test_peers_delivered_exactly_once() {
        let mut lookup = Lookup::new(
            1,
            LookupKind::GetPeers { announce: false },
            id_with_first_byte(0x00),
            Some(InfoHash([0u8; 20])),
            vec![],
            None,
        );
        assert_eq!(lookup.take_new_peers(&[addr(9, 9001)]), vec![addr(9, 9001)]);
        assert!(lookup.take_new_peers(&[addr(9, 9001)]).is_empty());
    }

    #[test]
    fn test_announce_targets_are_closest_responders_with_tokens() {
        let mut lookup = Lookup::new(
            1,
            LookupKind::GetPeers { announce: true },
            id_with_first_byte(0x00),
            Some(InfoHash([0u8; 20])),
            vec![peer(0x10, 1, 4001), peer(0x20, 2, 4002), peer(0x30, 3, 4003)],
            None,
        );
        let _ = lookup.next_targets(ALPHA);
        lookup.on_response(addr(1, 4001), Some(Bytes::from_static(b"t1")));
        lookup.on_response(addr(2, 4002), None); // no token: cannot announce
        lookup.on_response(addr(3, 4003), Some(Bytes::from_static(b"t3")));

        let targets = lookup.announce_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].0, addr(1, 4001));
        assert_eq!(targets[1].0, addr(3, 4003));
    }

    #[test]
    fn test_router_token_makes_router_an_announce_target() {
        let mut lookup = Lookup::new(
            1,
            LookupKind::GetPeers { announce: true },
            id_with_first_byte(0x00),
            Some(InfoHash([0u8; 20])),
            vec![],
            None,
        );
        lookup.note_router_query(addr(50, 6881));
        lookup.on_response(addr(50, 6881), Some(Bytes::from_static(b"rt")));

        let targets = lookup.announce_targets();
        assert_eq!(targets, vec![(addr(50, 6881), Bytes::from_static(b"rt"))]);
    }

    #[test]
    fn test_shortlist_closest_is_stable_subset() {
        // Closest set after merging strictly improves or keeps entries;
        // farther contacts never displace closer ones.
        let mut lookup = new_lookup(vec![peer(0x08, 1, 4001)]);
        lookup.merge(vec![peer(0x04, 2, 4002)]);
        let before: Vec<NodeId> = lookup.closest().iter().map(|c| c.id).collect();

        lookup.merge(vec![peer(0x02, 3, 4003), peer(0x7F, 4, 4004)]);
        let after: Vec<NodeId> = lookup.closest().iter().map(|c| c.id).collect();

        for id in before {
            assert!(after.contains(&id), "merging must not lose close entries");
        }
        assert_eq!(after[0], id_with_first_byte(0x02));
    }

    #[test]
    fn test_router_queries_tracked_but_not_shortlisted() {
        let now = Instant::now();
        let mut lookup = new_lookup(vec![]);
        lookup.note_router_query(addr(50, 6881));
        assert!(lookup.was_queried(&addr(50, 6881)));
        assert!(lookup.closest().is_empty());

        // The pending router query keeps the lookup alive.
        assert!(!lookup.finished(now, 0));

        // Its answer settles the slot without entering the shortlist.
        lookup.on_response(addr(50, 6881), None);
        assert_eq!(lookup.in_flight(), 0);
        assert!(lookup.closest().is_empty());
        assert!(lookup.finished(now, 0));
    }
}
