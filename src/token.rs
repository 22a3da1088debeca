//! Announce tokens.
//!
//! A token proves that an announcing peer recently received a `get_peers`
//! response from us at the same IP. Tokens are a SHA-1 over a rotating
//! secret and the requester's address; the previous secret stays valid for
//! one rotation so a token is good for five to ten minutes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};

/// How often the event loop rotates the secret.
pub const ROTATE_PERIOD: Duration = Duration::from_secs(5 * 60);

const TOKEN_LEN: usize = 8;

#[derive(Debug)]
pub struct TokenMint {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenMint {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    /// The token handed to `addr` in a `get_peers` response.
    pub fn issue(&self, addr: &SocketAddr) -> Bytes {
        derive(&self.current, addr)
    }

    /// Whether `token` was issued to `addr` under the current or previous
    /// secret.
    pub fn accepts(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        derive(&self.current, addr) == token || derive(&self.previous, addr) == token
    }
}

impl Default for TokenMint {
    fn default() -> Self {
        Self::new()
    }
}

fn derive(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().to_string().as_bytes());
    let digest = hasher.finalize();
    Bytes::copy_from_slice(&digest[..TOKEN_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[test]
    fn test_issue_and_accept() {
        let mint = TokenMint::new();
        let a = addr(1, 6881);
        let token = mint.issue(&a);
        assert!(mint.accepts(&a, &token));
    }

    #[test]
    fn test_token_bound_to_ip_not_port() {
        let mint = TokenMint::new();
        let token = mint.issue(&addr(1, 6881));

        // Same IP, different source port: still fine.
        assert!(mint.accepts(&addr(1, 9999), &token));
        // Different IP: forged.
        assert!(!mint.accepts(&addr(2, 6881), &token));
    }

    #[test]
    fn test_survives_one_rotation_only() {
        let mut mint = TokenMint::new();
        let a = addr(1, 6881);
        let token = mint.issue(&a);

        mint.rotate();
        assert!(mint.accepts(&a, &token), "previous secret must stay valid");

        mint.rotate();
        assert!(!mint.accepts(&a, &token), "two rotations expire the token");
    }
}
