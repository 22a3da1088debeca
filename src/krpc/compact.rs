//! Compact address encodings shared by `nodes`, `nodes6`, and `values`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::node::{Contact, COMPACT_V4_LEN, COMPACT_V6_LEN};

/// Appends a compact peer hint (4+2 or 16+2 bytes, port big-endian).
pub fn write_peer(addr: SocketAddr, buf: &mut Vec<u8>) {
    match addr {
        SocketAddr::V4(a) => {
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
    }
}

/// Parses a compact peer hint of either family.
pub fn read_peer(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Packs contacts of the requested family into one compact byte string.
pub fn pack_nodes(contacts: &[Contact], v6: bool) -> Bytes {
    let entry = if v6 { COMPACT_V6_LEN } else { COMPACT_V4_LEN };
    let mut buf = Vec::with_capacity(contacts.len() * entry);
    for contact in contacts {
        contact.write_compact(v6, &mut buf);
    }
    Bytes::from(buf)
}

/// Unpacks a compact node list; a trailing partial entry is ignored.
pub fn unpack_nodes(data: &[u8], v6: bool) -> Vec<Contact> {
    let entry = if v6 { COMPACT_V6_LEN } else { COMPACT_V4_LEN };
    data.chunks_exact(entry)
        .filter_map(Contact::from_compact)
        .collect()
}
