//! The k-bucket routing table.
//!
//! A fixed array of 160 buckets indexed by the position of the highest
//! differing bit between a contact's id and the local id. Buckets hold up to
//! [`K`] contacts ordered least-recently-seen first and are never split; the
//! lookup layer compensates by sampling across prefixes. A full bucket takes
//! a newcomer only by replacing a bad contact, or by probing the stalest
//! questionable one and replacing it if the probe fails.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::node::{Contact, NodeId, Reachability};

/// Bucket width.
pub const K: usize = 8;

const NUM_BUCKETS: usize = 160;

/// What became of an insertion attempt.
#[derive(Debug, Clone)]
pub enum Insert {
    /// Appended to a bucket with room.
    Added,
    /// The contact was already present; its liveness was refreshed.
    Refreshed,
    /// Bucket full of live contacts; the caller should ping `probe` and
    /// come back with [`RoutingTable::probe_failed`] or drop the newcomer.
    Pending { probe: Contact },
    /// Dropped: local id, full table of good contacts, or full bucket with
    /// nothing worth probing.
    Discarded,
}

#[derive(Debug)]
struct Bucket {
    /// Least-recently-seen contact at the front.
    contacts: VecDeque<Contact>,
    last_changed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            contacts: VecDeque::with_capacity(K),
            last_changed: now,
        }
    }

    fn position_of(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    /// The contact that has gone longest without traffic.
    fn stalest(&self) -> Option<&Contact> {
        self.contacts.iter().min_by_key(|c| c.last_seen)
    }
}

/// The node's bucketed view of the network.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    max_nodes: usize,
    buckets: Vec<Bucket>,
    len: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, max_nodes: usize) -> Self {
        let now = Instant::now();
        Self {
            local_id,
            max_nodes,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(now)).collect(),
            len: 0,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts or refreshes a contact.
    ///
    /// Duplicates are collapsed both by node id and by socket address: a
    /// known id reporting from a new address moves, and a known address
    /// presenting a new id replaces the stale identity.
    pub fn insert(&mut self, contact: Contact, now: Instant) -> Insert {
        let Some(index) = self.local_id.bucket_index(&contact.id) else {
            return Insert::Discarded;
        };

        // An address can hold only one identity at a time.
        if let Some(existing) = self.find_by_addr(&contact.addr) {
            if existing != contact.id {
                self.remove(&existing);
            }
        }

        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.position_of(&contact.id) {
            let entry = &mut bucket.contacts[pos];
            entry.addr = contact.addr;
            entry.touch(now);
            bucket.last_changed = now;
            return Insert::Refreshed;
        }

        if bucket.contacts.len() < K {
            if self.len >= self.max_nodes && !self.evict_somewhere(now) {
                return Insert::Discarded;
            }
            let bucket = &mut self.buckets[index];
            bucket.contacts.push_back(contact);
            bucket.last_changed = now;
            self.len += 1;
            return Insert::Added;
        }

        // Full bucket: replace a bad contact outright, otherwise ask the
        // caller to probe the stalest questionable one. A bucket of K good
        // contacts simply rejects the newcomer.
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket
            .contacts
            .iter()
            .position(|c| c.state(now) == Reachability::Bad)
        {
            bucket.contacts.remove(pos);
            bucket.contacts.push_back(contact);
            bucket.last_changed = now;
            return Insert::Added;
        }

        let probe = bucket
            .contacts
            .iter()
            .filter(|c| c.state(now) == Reachability::Questionable)
            .min_by_key(|c| c.last_seen)
            .cloned();
        match probe {
            Some(probe) => Insert::Pending { probe },
            None => Insert::Discarded,
        }
    }

    /// Settles a probe issued after [`Insert::Pending`]: the probed contact
    /// did not answer, so it gives up its slot to the newcomer.
    pub fn probe_failed(&mut self, probed: &NodeId, replacement: Contact, now: Instant) {
        if self.remove(probed) {
            let _ = self.insert(replacement, now);
        }
    }

    /// Records a response from `id`, refreshing its liveness.
    pub fn record_response(&mut self, id: &NodeId, now: Instant) {
        if let Some(contact) = self.find_mut(id) {
            contact.touch(now);
            let index = self.local_id.bucket_index(id);
            if let Some(index) = index {
                self.buckets[index].last_changed = now;
            }
        }
    }

    /// Records a query sent to `id`, awaiting its answer.
    pub fn record_query(&mut self, id: &NodeId) {
        if let Some(contact) = self.find_mut(id) {
            contact.pending_queries = contact.pending_queries.saturating_add(1);
        }
    }

    /// Records a query timeout or send failure against `id`.
    pub fn record_failure(&mut self, id: &NodeId) {
        if let Some(contact) = self.find_mut(id) {
            contact.fail();
        }
    }

    /// Records a protocol violation from `addr`; used by the codec boundary
    /// to demote senders of repeated garbage.
    pub fn record_failure_by_addr(&mut self, addr: &SocketAddr) {
        for bucket in &mut self.buckets {
            if let Some(contact) = bucket.contacts.iter_mut().find(|c| &c.addr == addr) {
                contact.fail();
                return;
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.local_id.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.position_of(id) {
            bucket.contacts.remove(pos);
            self.len -= 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.local_id
            .bucket_index(id)
            .map(|i| self.buckets[i].position_of(id).is_some())
            .unwrap_or(false)
    }

    pub fn find(&self, id: &NodeId) -> Option<&Contact> {
        let index = self.local_id.bucket_index(id)?;
        let pos = self.buckets[index].position_of(id)?;
        Some(&self.buckets[index].contacts[pos])
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        let index = self.local_id.bucket_index(id)?;
        let pos = self.buckets[index].position_of(id)?;
        Some(&mut self.buckets[index].contacts[pos])
    }

    fn find_by_addr(&self, addr: &SocketAddr) -> Option<NodeId> {
        for bucket in &self.buckets {
            if let Some(contact) = bucket.contacts.iter().find(|c| &c.addr == addr) {
                return Some(contact.id);
            }
        }
        None
    }

    /// The `k` contacts closest to `target` by XOR distance.
    ///
    /// Buckets are visited outward from the target's bucket and the merge
    /// stops once `k` candidates are collected; distance ties break on the
    /// lower address so the ordering is stable. Bad contacts are skipped.
    pub fn closest(&self, target: &NodeId, k: usize, now: Instant) -> Vec<Contact> {
        let center = self.local_id.bucket_index(target).unwrap_or(0);

        let mut found: Vec<Contact> = Vec::with_capacity(k * 2);
        for offset in 0..NUM_BUCKETS {
            let mut visited = false;
            if center >= offset {
                found.extend(self.live_contacts(center - offset, now));
                visited = true;
            }
            if offset > 0 && center + offset < NUM_BUCKETS {
                found.extend(self.live_contacts(center + offset, now));
                visited = true;
            }
            if !visited || found.len() >= k {
                break;
            }
        }

        found.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| a.addr.ip().cmp(&b.addr.ip()))
                .then_with(|| a.addr.port().cmp(&b.addr.port()))
        });
        found.truncate(k);
        found
    }

    fn live_contacts(&self, index: usize, now: Instant) -> impl Iterator<Item = Contact> + '_ {
        self.buckets[index]
            .contacts
            .iter()
            .filter(move |c| c.state(now) != Reachability::Bad)
            .cloned()
    }

    /// Random refresh targets for buckets untouched for `ttl`, at most
    /// `limit` of them.
    pub fn stale_targets(&self, now: Instant, ttl: Duration, limit: usize) -> Vec<NodeId> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.contacts.is_empty())
            .filter(|(_, b)| now.duration_since(b.last_changed) >= ttl)
            .take(limit)
            .map(|(i, _)| self.local_id.random_in_bucket(i))
            .collect()
    }

    /// Runs `visit` over every contact. Used by the persistence collaborator
    /// to snapshot the table; the callback must not call back into the node.
    pub fn visit(&self, mut visit: impl FnMut(SocketAddr, NodeId)) {
        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                visit(contact.addr, contact.id);
            }
        }
    }

    /// Frees one slot by evicting the stalest non-good contact from the most
    /// populated bucket. Returns false when every contact is good.
    fn evict_somewhere(&mut self, now: Instant) -> bool {
        let Some(index) = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.contacts
                    .iter()
                    .any(|c| c.state(now) != Reachability::Good)
            })
            .max_by_key(|(_, b)| b.contacts.len())
            .map(|(i, _)| i)
        else {
            return false;
        };

        let bucket = &mut self.buckets[index];
        let victim = bucket
            .contacts
            .iter()
            .filter(|c| c.state(now) != Reachability::Good)
            .min_by_key(|c| c.last_seen)
            .map(|c| c.id);
        if let Some(id) = victim {
            if let Some(pos) = bucket.position_of(&id) {
                bucket.contacts.remove(pos);
                self.len -= 1;
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn bucket_of(&self, id: &NodeId) -> Option<usize> {
        let index = self.local_id.bucket_index(id)?;
        self.buckets[index].position_of(id).map(|_| index)
    }
}
