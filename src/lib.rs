//! rdht - A BitTorrent Mainline DHT node
//!
//! This library implements the Kademlia-based distributed hash table used by
//! BitTorrent for trackerless peer discovery ([BEP-5]). A node participates in
//! the global UDP network, maintains a routing table over the 160-bit id
//! space, and runs iterative lookups that converge on the nodes closest to an
//! infohash.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`infohash`] - 20-byte torrent identifiers
//! - [`node`] - Node ids, XOR distance, contact freshness
//! - [`krpc`] - The bencoded query/response wire protocol
//! - [`routing`] - Fixed-depth k-bucket routing table
//! - [`peers`] - Announced-peer storage per infohash
//! - [`token`] - Rotating announce tokens
//! - [`transaction`] - Correlation of replies to outstanding queries
//! - [`lookup`] - Iterative alpha-concurrent lookups
//! - [`rate`] - Outgoing packet rate limiting
//! - [`server`] - The event loop and the application-facing handle
//!
//! # Getting Started
//!
//! ```no_run
//! use rdht::{Config, Dht, InfoHash};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut dht, service) = Dht::new(Config::default()).await?;
//! tokio::spawn(service.run());
//!
//! let info_hash = InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2")?;
//! dht.peers_request(info_hash, false).await?;
//!
//! while let Some(batch) = dht.next_peers().await {
//!     for peer in batch.peers {
//!         println!("Found peer: {}", peer);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

pub mod bencode;
pub mod config;
pub mod infohash;
pub mod krpc;
pub mod lookup;
pub mod node;
pub mod peers;
pub mod rate;
pub mod routing;
pub mod server;
pub mod stats;
pub mod token;
pub mod transaction;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{Config, ConfigError};
pub use infohash::{InfoHash, InvalidInfoHash};
pub use krpc::{KrpcError, Message, Payload, Query, Reply};
pub use node::{Contact, NodeId, Reachability};
pub use routing::RoutingTable;
pub use server::{Dht, PeerBatch, Service, Stopped};
pub use stats::Stats;
