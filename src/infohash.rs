//! Torrent infohashes.
//!
//! An infohash is the 20-byte SHA-1 of a torrent's info dictionary and the
//! key under which peers are discovered in the DHT.

use std::fmt;

use thiserror::Error;

/// Parse failure for textual infohashes: anything that is not exactly 40
/// hexadecimal characters.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid infohash: expected 40 hex characters")]
pub struct InvalidInfoHash;

/// A 20-byte torrent identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidInfoHash> {
        if bytes.len() != 20 {
            return Err(InvalidInfoHash);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Ok(Self(hash))
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, InvalidInfoHash> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(InvalidInfoHash);
        }
        let mut hash = [0u8; 20];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| InvalidInfoHash)?;
        }
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex() {
        let ih = InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2").unwrap();
        assert_eq!(
            ih.0,
            [
                0xd1, 0xc5, 0x67, 0x6a, 0xe7, 0xac, 0x98, 0xe8, 0xb1, 0x9f, 0x63, 0x56, 0x59,
                0x05, 0x10, 0x5e, 0x3c, 0x4c, 0x37, 0xa2
            ]
        );
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(InfoHash::from_hex(""), Err(InvalidInfoHash));
        assert_eq!(InfoHash::from_hex("d1c5"), Err(InvalidInfoHash));
        assert_eq!(
            // 40 chars but not hex
            InfoHash::from_hex("zzc5676ae7ac98e8b19f63565905105e3c4c37a2"),
            Err(InvalidInfoHash)
        );
        assert_eq!(
            // 41 chars
            InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2f"),
            Err(InvalidInfoHash)
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let hex = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2";
        assert_eq!(InfoHash::from_hex(hex).unwrap().to_hex(), hex);
    }

    #[test]
    fn test_from_bytes_length() {
        assert!(InfoHash::from_bytes(&[0u8; 20]).is_ok());
        assert!(InfoHash::from_bytes(&[0u8; 19]).is_err());
    }
}
