//! The KRPC wire protocol ([BEP-5]).
//!
//! Every datagram is a bencoded dictionary with a transaction id `t`, a type
//! marker `y` (query, response, or error), and either a named query with
//! arguments, a response dictionary, or an error list. Contacts travel as
//! compact byte strings: 26 bytes per IPv4 node and 38 per IPv6 node; peer
//! hints are 6 or 18 bytes. Unknown optional fields are ignored so protocol
//! extensions never break decoding.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use thiserror::Error;

use crate::bencode::BencodeError;

mod compact;
mod message;

pub use compact::{pack_nodes, read_peer, unpack_nodes, write_peer};
pub use message::{Message, Payload, Query, Reply, TransactionId};

/// Standard KRPC error code for a rejected announce token.
pub const ERR_PROTOCOL: i64 = 203;

/// Decoding failures, ordered from "not even bencode" to "bencode but not
/// a message we speak".
#[derive(Debug, Error)]
pub enum KrpcError {
    /// Structural failure: not bencode, not a dictionary, or missing the
    /// message envelope (`t`/`y`).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Syntactically valid query with a `q` name this node does not know.
    #[error("unknown query kind: {0}")]
    UnknownQuery(String),

    /// A required field is absent or has the wrong shape or length.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl From<BencodeError> for KrpcError {
    fn from(err: BencodeError) -> Self {
        KrpcError::Malformed(err.to_string())
    }
}
