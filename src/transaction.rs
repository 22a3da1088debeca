//! Outstanding-query bookkeeping.
//!
//! Every query this node sends carries a short transaction id; the reply
//! must echo it. The table maps live ids to what was asked, of whom, and
//! which lookup (if any) is waiting on the answer. A reply resolves only if
//! both the id and the source address match, so a third party that observed
//! an id on the wire cannot forge the answer from elsewhere.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::infohash::InfoHash;
use crate::krpc::TransactionId;
use crate::lookup::LookupId;
use crate::node::{Contact, NodeId};

/// How long a query may remain unanswered.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// An unsolicited or stale reply; also covers an id echoed from the wrong
/// address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no such transaction")]
pub struct NoSuchTransaction;

/// What a live transaction was asking.
#[derive(Debug, Clone, PartialEq)]
pub enum SentQuery {
    Ping,
    /// Liveness probe of a bucket occupant; on timeout `replacement` takes
    /// the probed contact's slot.
    Probe { replacement: Contact },
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
    AnnouncePeer { info_hash: InfoHash },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub tid: TransactionId,
    pub remote: SocketAddr,
    /// Known id of the queried contact, when it was queried by identity.
    pub remote_id: Option<NodeId>,
    pub query: SentQuery,
    pub lookup: Option<LookupId>,
    pub issued_at: Instant,
    pub deadline: Instant,
}

/// Live transactions keyed by their two-byte id.
#[derive(Debug, Default)]
pub struct TransactionTable {
    next: u16,
    live: HashMap<u16, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            // Start at a random point so ids are not guessable across runs.
            next: rand::random(),
            live: HashMap::new(),
        }
    }

    /// Registers a query and returns its wire transaction id.
    ///
    /// Ids are drawn from a wrapping counter; an id still live from a
    /// previous generation is skipped over.
    pub fn allocate(
        &mut self,
        remote: SocketAddr,
        remote_id: Option<NodeId>,
        query: SentQuery,
        lookup: Option<LookupId>,
        now: Instant,
    ) -> TransactionId {
        let key = loop {
            let key = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.live.contains_key(&key) {
                break key;
            }
        };

        let tid = Bytes::copy_from_slice(&key.to_be_bytes());
        self.live.insert(
            key,
            Transaction {
                tid: tid.clone(),
                remote,
                remote_id,
                query,
                lookup,
                issued_at: now,
                deadline: now + QUERY_TIMEOUT,
            },
        );
        tid
    }

    /// Consumes the transaction matching `(tid, remote)`.
    ///
    /// An id that is unknown, malformed, or recorded against a different
    /// address yields [`NoSuchTransaction`] and leaves the table unchanged.
    pub fn resolve(
        &mut self,
        tid: &[u8],
        remote: SocketAddr,
    ) -> Result<Transaction, NoSuchTransaction> {
        let key = match tid {
            [a, b] => u16::from_be_bytes([*a, *b]),
            _ => return Err(NoSuchTransaction),
        };
        match self.live.get(&key) {
            Some(tx) if tx.remote == remote => {}
            _ => return Err(NoSuchTransaction),
        }
        self.live.remove(&key).ok_or(NoSuchTransaction)
    }

    /// Removes and returns every transaction past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<Transaction> {
        let expired: Vec<u16> = self
            .live
            .iter()
            .filter(|(_, tx)| tx.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.live.remove(&key))
            .collect()
    }

    /// Empties the table; used at shutdown.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.live.drain().map(|(_, tx)| tx).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
