use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::compact::{pack_nodes, read_peer, unpack_nodes, write_peer};
use super::KrpcError;
use crate::bencode::{decode, encode, Value};
use crate::infohash::InfoHash;
use crate::node::{Contact, NodeId};

/// Short opaque correlation id chosen by the querying side.
pub type TransactionId = Bytes;

/// The four queries of the Mainline protocol.
#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// A response dictionary.
///
/// The wire format does not say which query a response answers; the caller
/// correlates via the transaction id and interprets the optional fields
/// accordingly. `nodes` merges the v4 and v6 compact lists.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub id: Option<NodeId>,
    pub token: Option<Bytes>,
    pub nodes: Vec<Contact>,
    pub peers: Vec<SocketAddr>,
}

impl Reply {
    pub fn pong(id: NodeId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn nodes(id: NodeId, nodes: Vec<Contact>) -> Self {
        Self {
            id: Some(id),
            nodes,
            ..Self::default()
        }
    }

    pub fn peers(id: NodeId, token: Bytes, peers: Vec<SocketAddr>, nodes: Vec<Contact>) -> Self {
        Self {
            id: Some(id),
            token: Some(token),
            peers,
            nodes,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Query { id: NodeId, query: Query },
    Reply(Reply),
    Error { code: i64, message: String },
}

/// One KRPC datagram.
#[derive(Debug, Clone)]
pub struct Message {
    pub tid: TransactionId,
    pub payload: Payload,
}

impl Message {
    pub fn query(tid: TransactionId, id: NodeId, query: Query) -> Self {
        Self {
            tid,
            payload: Payload::Query { id, query },
        }
    }

    pub fn reply(tid: TransactionId, reply: Reply) -> Self {
        Self {
            tid,
            payload: Payload::Reply(reply),
        }
    }

    pub fn error(tid: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            tid,
            payload: Payload::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, KrpcError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| KrpcError::Malformed("not a dictionary".into()))?;

        let tid = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| KrpcError::Malformed("missing transaction id".into()))?;

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| KrpcError::Malformed("missing message type".into()))?;

        let payload = match kind {
            "q" => parse_query(dict)?,
            "r" => parse_reply(dict)?,
            "e" => parse_error(dict)?,
            other => return Err(KrpcError::Malformed(format!("unknown type: {}", other))),
        };

        Ok(Self { tid, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.tid.clone()),
        );

        match &self.payload {
            Payload::Query { id, query } => {
                dict.insert(Bytes::from_static(b"y"), Value::string("q"));
                dict.insert(Bytes::from_static(b"q"), Value::string(query.name()));
                dict.insert(Bytes::from_static(b"a"), encode_args(id, query));
            }
            Payload::Reply(reply) => {
                dict.insert(Bytes::from_static(b"y"), Value::string("r"));
                dict.insert(Bytes::from_static(b"r"), encode_reply(reply));
            }
            Payload::Error { code, message } => {
                dict.insert(Bytes::from_static(b"y"), Value::string("e"));
                dict.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }

        encode(&Value::Dict(dict))
    }
}

fn encode_args(id: &NodeId, query: &Query) -> Value {
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));

    match query {
        Query::Ping => {}
        Query::FindNode { target } => {
            args.insert(
                Bytes::from_static(b"target"),
                Value::bytes(target.as_bytes()),
            );
        }
        Query::GetPeers { info_hash } => {
            args.insert(
                Bytes::from_static(b"info_hash"),
                Value::bytes(info_hash.as_bytes()),
            );
        }
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.insert(
                Bytes::from_static(b"info_hash"),
                Value::bytes(info_hash.as_bytes()),
            );
            args.insert(Bytes::from_static(b"port"), Value::Integer(*port as i64));
            args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
            if *implied_port {
                args.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
            }
        }
    }
    Value::Dict(args)
}

fn encode_reply(reply: &Reply) -> Value {
    let mut r = BTreeMap::new();
    if let Some(id) = &reply.id {
        r.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
    }
    if let Some(token) = &reply.token {
        r.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    }

    let v4 = pack_nodes(&reply.nodes, false);
    if !v4.is_empty() {
        r.insert(Bytes::from_static(b"nodes"), Value::Bytes(v4));
    }
    let v6 = pack_nodes(&reply.nodes, true);
    if !v6.is_empty() {
        r.insert(Bytes::from_static(b"nodes6"), Value::Bytes(v6));
    }

    if !reply.peers.is_empty() {
        let values = reply
            .peers
            .iter()
            .map(|addr| {
                let mut buf = Vec::with_capacity(18);
                write_peer(*addr, &mut buf);
                Value::Bytes(Bytes::from(buf))
            })
            .collect();
        r.insert(Bytes::from_static(b"values"), Value::List(values));
    }

    Value::Dict(r)
}

fn parse_query(dict: &BTreeMap<Bytes, Value>) -> Result<Payload, KrpcError> {
    let name = dict
        .get(b"q".as_slice())
        .and_then(|v| v.as_str())
        .ok_or(KrpcError::Protocol("missing query name"))?;

    let args = dict
        .get(b"a".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or(KrpcError::Protocol("missing query arguments"))?;

    let id = args
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or(KrpcError::Protocol("missing sender id"))?;

    let query = match name {
        "ping" => Query::Ping,
        "find_node" => {
            let target = args
                .get(b"target".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| NodeId::from_bytes(b).ok())
                .ok_or(KrpcError::Protocol("missing target"))?;
            Query::FindNode { target }
        }
        "get_peers" => Query::GetPeers {
            info_hash: parse_info_hash(args)?,
        },
        "announce_peer" => {
            let port = args
                .get(b"port".as_slice())
                .and_then(|v| v.as_integer())
                .filter(|&p| (0..=u16::MAX as i64).contains(&p))
                .ok_or(KrpcError::Protocol("missing or invalid port"))?;
            let token = args
                .get(b"token".as_slice())
                .and_then(|v| v.as_bytes())
                .cloned()
                .ok_or(KrpcError::Protocol("missing token"))?;
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_integer())
                .map(|v| v == 1)
                .unwrap_or(false);
            Query::AnnouncePeer {
                info_hash: parse_info_hash(args)?,
                port: port as u16,
                token,
                implied_port,
            }
        }
        other => return Err(KrpcError::UnknownQuery(other.to_string())),
    };

    Ok(Payload::Query { id, query })
}

fn parse_info_hash(args: &BTreeMap<Bytes, Value>) -> Result<InfoHash, KrpcError> {
    args.get(b"info_hash".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| InfoHash::from_bytes(b).ok())
        .ok_or(KrpcError::Protocol("missing or invalid info_hash"))
}

fn parse_reply(dict: &BTreeMap<Bytes, Value>) -> Result<Payload, KrpcError> {
    let r = dict
        .get(b"r".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or(KrpcError::Protocol("missing response dictionary"))?;

    let id = r
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or(KrpcError::Protocol("missing responder id"))?;

    let mut nodes = Vec::new();
    if let Some(data) = r.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()) {
        nodes.extend(unpack_nodes(data, false));
    }
    if let Some(data) = r.get(b"nodes6".as_slice()).and_then(|v| v.as_bytes()) {
        nodes.extend(unpack_nodes(data, true));
    }

    let peers = r
        .get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(|b| read_peer(b))
                .collect()
        })
        .unwrap_or_default();

    let token = r.get(b"token".as_slice()).and_then(|v| v.as_bytes()).cloned();

    Ok(Payload::Reply(Reply {
        id: Some(id),
        token,
        nodes,
        peers,
    }))
}

fn parse_error(dict: &BTreeMap<Bytes, Value>) -> Result<Payload, KrpcError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(KrpcError::Protocol("missing error list"))?;

    let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let message = list
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    Ok(Payload::Error { code, message })
}
