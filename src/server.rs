//! The event loop and the application-facing handle.
//!
//! A node is split into a [`Dht`] handle and a [`Service`]. The service is
//! the single owner of the routing table, peer store, transaction table and
//! active lookups; it fuses inbound datagrams, application commands, and
//! maintenance timers in one `select!` loop and never holds state across an
//! await that another task could observe. The handle talks to it over a
//! bounded command channel and reads discovered peers from a bounded
//! results channel.
//!
//! ```no_run
//! use rdht::{Config, Dht, InfoHash};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut dht, service) = Dht::new(Config::default()).await?;
//! tokio::spawn(service.run());
//!
//! let info_hash = InfoHash::from_hex("d1c5676ae7ac98e8b19f63565905105e3c4c37a2")?;
//! dht.peers_request(info_hash, true).await?;
//! if let Some(batch) = dht.next_peers().await {
//!     println!("{}: {} peers", batch.info_hash, batch.peers.len());
//! }
//! dht.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::infohash::InfoHash;
use crate::krpc::{Message, Payload, Query, Reply, TransactionId, ERR_PROTOCOL};
use crate::lookup::{Lookup, LookupId, LookupKind, ALPHA};
use crate::node::{Contact, NodeId};
use crate::peers::PeerStore;
use crate::rate::RateLimiter;
use crate::routing::{Insert, RoutingTable, K};
use crate::stats::Stats;
use crate::token::{TokenMint, ROTATE_PERIOD};
use crate::transaction::{SentQuery, TransactionTable};

/// Capacity of the results channel. When the application does not drain it,
/// further batches are dropped and counted rather than buffered without
/// bound.
const RESULTS_BUFFER: usize = 32;

const COMMAND_BUFFER: usize = 32;

/// Transaction expiry and deferred-send pacing.
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

/// Buckets untouched for this long get refreshed.
const BUCKET_TTL: Duration = Duration::from_secs(15 * 60);

const REFRESH_TARGETS_PER_SWEEP: usize = 8;

/// Upper bound on any single lookup's lifetime.
const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);

/// How long shutdown may spend flushing queued writes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

const MAX_PACKET: usize = 65535;

/// The service is gone; commands can no longer be delivered.
#[derive(Debug, Error)]
#[error("dht service has stopped")]
pub struct Stopped;

/// Peers discovered for one infohash, emitted as they are learned.
#[derive(Debug, Clone)]
pub struct PeerBatch {
    pub info_hash: InfoHash,
    pub peers: Vec<SocketAddr>,
}

enum Command {
    PeersRequest {
        info_hash: InfoHash,
        announce: bool,
    },
    AddNode {
        addr: SocketAddr,
        id: Option<NodeId>,
    },
    VisitNodes {
        visit: Box<dyn FnMut(SocketAddr, NodeId) + Send>,
        done: oneshot::Sender<()>,
    },
    Stop,
}

/// Application-facing handle to a running node.
pub struct Dht {
    cmd_tx: mpsc::Sender<Command>,
    results_rx: mpsc::Receiver<PeerBatch>,
    config: Config,
    node_id: NodeId,
    port: u16,
    stats: Arc<Stats>,
}

impl Dht {
    /// Binds the UDP socket and builds the node.
    ///
    /// The returned [`Service`] must be driven (`tokio::spawn(service.run())`)
    /// for the handle to do anything.
    pub async fn new(config: Config) -> Result<(Dht, Service), ConfigError> {
        let node_id = match &config.node_id {
            Some(bytes) => NodeId::from_bytes(bytes)
                .map_err(|_| ConfigError::InvalidNodeId(bytes.len()))?,
            None => match config.external_ip {
                Some(IpAddr::V6(_)) => return Err(ConfigError::AmbiguousIpFamily),
                Some(ip) => NodeId::derived_for_ip(ip),
                None => NodeId::generate(),
            },
        };

        let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        let port = socket.local_addr()?.port();
        info!("dht node {} listening on udp port {}", node_id, port);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (results_tx, results_rx) = mpsc::channel(RESULTS_BUFFER);
        let stats = Arc::new(Stats::new());
        let now = Instant::now();

        let service = Service {
            socket,
            local_id: node_id,
            port,
            routers: config.routers.clone(),
            router_addrs: HashSet::new(),
            num_target_peers: config.num_target_peers,
            cleanup_period: config.cleanup_period,
            routing: RoutingTable::new(node_id, config.max_nodes),
            peers: PeerStore::new(),
            tokens: TokenMint::new(),
            transactions: TransactionTable::new(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            active: HashMap::new(),
            cmd_rx,
            results_tx,
            limiter: RateLimiter::new(config.rate_limit, now),
            deferred: VecDeque::new(),
            stats: Arc::clone(&stats),
        };

        let dht = Dht {
            cmd_tx,
            results_rx,
            config,
            node_id,
            port,
            stats,
        };
        Ok((dht, service))
    }

    /// The port the socket actually bound; differs from the configured one
    /// only when that was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The configuration this node was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Enqueues a lookup for `info_hash`. Discovered peers arrive through
    /// [`Dht::next_peers`]; with `announce` set, the node announces itself
    /// to the closest responders once the lookup converges. Requesting an
    /// infohash that is already being looked up tops the lookup up instead
    /// of starting another.
    pub async fn peers_request(&self, info_hash: InfoHash, announce: bool) -> Result<(), Stopped> {
        self.cmd_tx
            .send(Command::PeersRequest {
                info_hash,
                announce,
            })
            .await
            .map_err(|_| Stopped)
    }

    /// Injects a contact. With a known id the contact goes straight into
    /// the routing table; otherwise the address is pinged first and joins
    /// the table when it answers.
    pub async fn add_node(&self, addr: SocketAddr, id: Option<NodeId>) -> Result<(), Stopped> {
        self.cmd_tx
            .send(Command::AddNode { addr, id })
            .await
            .map_err(|_| Stopped)
    }

    /// Runs `visit` over every routing-table contact, synchronously inside
    /// the event loop, and returns once the sweep is complete. The callback
    /// must not call back into this handle, or the loop deadlocks.
    pub async fn visit_nodes(
        &self,
        visit: impl FnMut(SocketAddr, NodeId) + Send + 'static,
    ) -> Result<(), Stopped> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::VisitNodes {
                visit: Box::new(visit),
                done: done_tx,
            })
            .await
            .map_err(|_| Stopped)?;
        done_rx.await.map_err(|_| Stopped)
    }

    /// Requests a graceful shutdown. Pending lookups are cancelled and the
    /// service's `run` returns.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// The next batch of discovered peers; `None` once the service stopped.
    pub async fn next_peers(&mut self) -> Option<PeerBatch> {
        self.results_rx.recv().await
    }
}

/// The event loop half of a node. Owns every piece of mutable state.
pub struct Service {
    socket: UdpSocket,
    local_id: NodeId,
    port: u16,
    routers: Vec<String>,
    router_addrs: HashSet<SocketAddr>,
    num_target_peers: usize,
    cleanup_period: Duration,
    routing: RoutingTable,
    peers: PeerStore,
    tokens: TokenMint,
    transactions: TransactionTable,
    lookups: HashMap<LookupId, Lookup>,
    next_lookup_id: LookupId,
    /// Infohash -> running get-peers lookup, for request coalescing.
    active: HashMap<InfoHash, LookupId>,
    cmd_rx: mpsc::Receiver<Command>,
    results_tx: mpsc::Sender<PeerBatch>,
    limiter: RateLimiter,
    /// Rate-deferred outgoing queries, oldest first.
    deferred: VecDeque<(SocketAddr, Vec<u8>)>,
    stats: Arc<Stats>,
}

impl Service {
    /// Runs until [`Dht::stop`] is called or the handle is dropped.
    pub async fn run(mut self) {
        self.resolve_routers().await;
        self.bootstrap().await;

        let mut buf = vec![0u8; MAX_PACKET];

        let mut housekeeping = interval(HOUSEKEEPING_PERIOD);
        let mut refresh = interval(self.cleanup_period);
        let mut rotation = interval(ROTATE_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        rotation.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Swallow the immediate first tick of each interval.
        housekeeping.tick().await;
        refresh.tick().await;
        rotation.tick().await;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, src)) => self.on_packet(&buf[..n], src).await,
                        Err(err) => debug!("udp receive error: {}", err),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                _ = housekeeping.tick() => self.on_housekeeping().await,
                _ = refresh.tick() => self.on_refresh().await,
                _ = rotation.tick() => self.tokens.rotate(),
            }
        }

        self.shutdown().await;
    }

    async fn resolve_routers(&mut self) {
        for router in &self.routers {
            match tokio::net::lookup_host(router.as_str()).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                        self.router_addrs.insert(addr);
                    } else {
                        warn!("router {} resolved to no usable address", router);
                    }
                }
                Err(err) => warn!("failed to resolve router {}: {}", router, err),
            }
        }
    }

    /// Kademlia join: a lookup for our own id, seeded from the routers,
    /// populates the buckets near us.
    async fn bootstrap(&mut self) {
        let target = self.local_id;
        self.spawn_lookup(LookupKind::FindNode, target, None).await;
    }

    // ---- inbound -------------------------------------------------------

    async fn on_packet(&mut self, data: &[u8], src: SocketAddr) {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("dropping packet from {}: {}", src, err);
                // Three strikes demote a known contact to bad.
                self.routing.record_failure_by_addr(&src);
                return;
            }
        };

        match msg.payload {
            Payload::Query { id, query } => self.on_query(msg.tid, id, query, src).await,
            Payload::Reply(reply) => self.on_reply(msg.tid, reply, src).await,
            Payload::Error { code, message } => {
                self.on_error_reply(msg.tid, code, message, src).await
            }
        }
    }

    async fn on_query(&mut self, tid: TransactionId, sender: NodeId, query: Query, src: SocketAddr) {
        // The sender is alive by definition; fold it into the table.
        self.observe(Contact::new(sender, src)).await;

        let reply = match query {
            Query::Ping => Reply::pong(self.local_id),
            Query::FindNode { target } => {
                Reply::nodes(self.local_id, self.closest_for(&target, src))
            }
            Query::GetPeers { info_hash } => {
                let now = Instant::now();
                let token = self.tokens.issue(&src);
                let known: Vec<SocketAddr> = self
                    .peers
                    .peers_for(&info_hash, now)
                    .into_iter()
                    .filter(|p| p.is_ipv4() == src.is_ipv4())
                    .collect();
                if known.is_empty() {
                    let closest = self.closest_for(&NodeId::from(info_hash), src);
                    Reply::peers(self.local_id, token, Vec::new(), closest)
                } else {
                    Reply::peers(self.local_id, token, known, Vec::new())
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.accepts(&src, &token) {
                    debug!("rejecting announce from {}: invalid token", src);
                    let msg = Message::error(tid, ERR_PROTOCOL, "Invalid token");
                    self.send_reply(src, msg.encode()).await;
                    return;
                }
                let peer_port = if implied_port { src.port() } else { port };
                self.peers.announce(
                    info_hash,
                    SocketAddr::new(src.ip(), peer_port),
                    Instant::now(),
                );
                Reply::pong(self.local_id)
            }
        };

        self.send_reply(src, Message::reply(tid, reply).encode()).await;
    }

    async fn on_reply(&mut self, tid: TransactionId, reply: Reply, src: SocketAddr) {
        let tx = match self.transactions.resolve(&tid, src) {
            Ok(tx) => tx,
            Err(_) => {
                // Unsolicited or stale; the sender earns nothing from it.
                debug!("dropping unsolicited reply from {}", src);
                return;
            }
        };

        let Some(responder) = reply.id else { return };

        if !self.router_addrs.contains(&src) {
            if !self.routing.contains(&responder) {
                self.stats.node_reached();
            }
            self.observe(Contact::new(responder, src)).await;
            self.routing.record_response(&responder, Instant::now());
        }

        match tx.query {
            SentQuery::Ping => {}
            // The probed occupant answered; the would-be replacement is
            // discarded and the bucket stays as it was.
            SentQuery::Probe { .. } => {}
            SentQuery::AnnouncePeer { .. } => {}
            SentQuery::FindNode { .. } => {
                self.on_lookup_reply(tx.lookup, src, reply, false).await;
            }
            SentQuery::GetPeers { .. } => {
                self.on_lookup_reply(tx.lookup, src, reply, true).await;
            }
        }
    }

    /// A KRPC error message is a response too: the remote is alive, it just
    /// will not help with this query.
    async fn on_error_reply(&mut self, tid: TransactionId, code: i64, message: String, src: SocketAddr) {
        let tx = match self.transactions.resolve(&tid, src) {
            Ok(tx) => tx,
            Err(_) => return,
        };
        debug!("krpc error {} from {}: {}", code, src, message);

        if let Some(id) = tx.remote_id {
            self.routing.record_response(&id, Instant::now());
        }
        if let Some(lid) = tx.lookup {
            if let Some(lookup) = self.lookups.get_mut(&lid) {
                lookup.on_response(src, None);
            }
            self.drive_lookup(lid).await;
        }
    }

    async fn on_lookup_reply(
        &mut self,
        lookup_id: Option<LookupId>,
        src: SocketAddr,
        reply: Reply,
        is_get_peers: bool,
    ) {
        let Some(lid) = lookup_id else { return };
        let local_id = self.local_id;

        let mut batch = None;
        let mut dupes = 0;
        if let Some(lookup) = self.lookups.get_mut(&lid) {
            lookup.on_response(src, reply.token.clone());

            let discovered: Vec<Contact> = reply
                .nodes
                .into_iter()
                .filter(|c| c.id != local_id)
                .collect();
            dupes = lookup.merge(discovered);

            if is_get_peers && !reply.peers.is_empty() {
                let fresh = lookup.take_new_peers(&reply.peers);
                if !fresh.is_empty() {
                    if let Some(info_hash) = lookup.info_hash {
                        batch = Some(PeerBatch {
                            info_hash,
                            peers: fresh,
                        });
                    }
                }
            }
        }

        if dupes > 0 {
            if is_get_peers {
                self.stats.get_peers_dupes(dupes as u64);
            } else {
                self.stats.find_node_dupes(dupes as u64);
            }
        }
        if let Some(batch) = batch {
            self.emit(batch);
        }

        self.drive_lookup(lid).await;
    }

    /// Delivers a batch to the application, dropping on overflow rather
    /// than buffering without bound.
    fn emit(&mut self, batch: PeerBatch) {
        self.stats.peers_found(batch.peers.len() as u64);
        match self.results_tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                self.stats.result_dropped();
                debug!(
                    "results channel full, dropping {} peers for {}",
                    batch.peers.len(),
                    batch.info_hash
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ---- commands ------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::PeersRequest {
                info_hash,
                announce,
            } => self.on_peers_request(info_hash, announce).await,
            Command::AddNode { addr, id } => match id {
                Some(id) => self.observe(Contact::new(id, addr)).await,
                None => {
                    self.send_query(addr, None, Query::Ping, SentQuery::Ping, None)
                        .await
                }
            },
            Command::VisitNodes { mut visit, done } => {
                self.routing.visit(|addr, id| visit(addr, id));
                let _ = done.send(());
            }
            Command::Stop => unreachable!("handled by the run loop"),
        }
    }

    async fn on_peers_request(&mut self, info_hash: InfoHash, announce: bool) {
        let target = NodeId::from(info_hash);

        if let Some(&lid) = self.active.get(&info_hash) {
            // Re-request: fold in a fresh routing snapshot and keep going.
            let seeds = self
                .routing
                .closest(&target, K, Instant::now());
            let mut dupes = 0;
            if let Some(lookup) = self.lookups.get_mut(&lid) {
                if announce {
                    lookup.set_announce();
                }
                dupes = lookup.merge(seeds);
            }
            if dupes > 0 {
                self.stats.get_peers_dupes(dupes as u64);
            }
            self.drive_lookup(lid).await;
            return;
        }

        let lid = self
            .spawn_lookup(
                LookupKind::GetPeers { announce },
                target,
                Some(info_hash),
            )
            .await;
        self.active.insert(info_hash, lid);
        self.drive_lookup(lid).await;
    }

    // ---- lookups -------------------------------------------------------

    async fn spawn_lookup(
        &mut self,
        kind: LookupKind,
        target: NodeId,
        info_hash: Option<InfoHash>,
    ) -> LookupId {
        let now = Instant::now();
        let lid = self.next_lookup_id;
        self.next_lookup_id += 1;

        let seeds = self.routing.closest(&target, K, now);
        let thin = seeds.len() < ALPHA;
        let mut lookup = Lookup::new(
            lid,
            kind,
            target,
            info_hash,
            seeds,
            Some(now + LOOKUP_DEADLINE),
        );

        // With too few local contacts the routers carry the first round.
        // They answer like anyone else but never join the shortlist or the
        // routing table.
        let router_queries: Vec<SocketAddr> = if thin {
            self.router_addrs.iter().copied().collect()
        } else {
            Vec::new()
        };
        for addr in &router_queries {
            lookup.note_router_query(*addr);
        }

        self.lookups.insert(lid, lookup);

        for addr in router_queries {
            match (kind, info_hash) {
                (LookupKind::GetPeers { .. }, Some(ih)) => {
                    self.send_query(
                        addr,
                        None,
                        Query::GetPeers { info_hash: ih },
                        SentQuery::GetPeers { info_hash: ih },
                        Some(lid),
                    )
                    .await;
                    self.stats.sent_get_peers();
                }
                _ => {
                    self.send_query(
                        addr,
                        None,
                        Query::FindNode { target },
                        SentQuery::FindNode { target },
                        Some(lid),
                    )
                    .await;
                    self.stats.sent_find_node();
                }
            }
        }

        self.drive_lookup(lid).await;
        lid
    }

    /// Tops a lookup up to alpha in-flight queries, then retires it if its
    /// termination condition holds.
    async fn drive_lookup(&mut self, lid: LookupId) {
        let Some(lookup) = self.lookups.get_mut(&lid) else {
            return;
        };
        let kind = lookup.kind;
        let target = lookup.target;
        let info_hash = lookup.info_hash;
        let targets = lookup.next_targets(ALPHA);

        for contact in targets {
            match (kind, info_hash) {
                (LookupKind::GetPeers { .. }, Some(ih)) => {
                    self.send_query(
                        contact.addr,
                        Some(contact.id),
                        Query::GetPeers { info_hash: ih },
                        SentQuery::GetPeers { info_hash: ih },
                        Some(lid),
                    )
                    .await;
                    self.stats.sent_get_peers();
                }
                _ => {
                    self.send_query(
                        contact.addr,
                        Some(contact.id),
                        Query::FindNode { target },
                        SentQuery::FindNode { target },
                        Some(lid),
                    )
                    .await;
                    self.stats.sent_find_node();
                }
            }
        }

        self.finish_if_done(lid).await;
    }

    async fn finish_if_done(&mut self, lid: LookupId) {
        let now = Instant::now();
        let done = self
            .lookups
            .get(&lid)
            .map(|l| l.finished(now, self.num_target_peers))
            .unwrap_or(false);
        if !done {
            return;
        }
        let Some(lookup) = self.lookups.remove(&lid) else {
            return;
        };
        if let Some(info_hash) = lookup.info_hash {
            self.active.remove(&info_hash);
        }

        if lookup.announce() {
            if let Some(info_hash) = lookup.info_hash {
                let port = self.port;
                for (addr, token) in lookup.announce_targets() {
                    self.send_query(
                        addr,
                        None,
                        Query::AnnouncePeer {
                            info_hash,
                            port,
                            token,
                            implied_port: false,
                        },
                        SentQuery::AnnouncePeer { info_hash },
                        None,
                    )
                    .await;
                }
            }
        }

        debug!(
            "lookup {} for {} finished, {} peers delivered",
            lid, lookup.target, lookup.peers_delivered
        );
    }

    // ---- timers --------------------------------------------------------

    async fn on_housekeeping(&mut self) {
        let now = Instant::now();

        let expired = self.transactions.expire(now);
        let mut touched = Vec::new();
        for tx in expired {
            match tx.query {
                SentQuery::Probe { replacement } => {
                    // The occupant did not answer; the newcomer gets its
                    // bucket slot.
                    if let Some(probed) = tx.remote_id {
                        self.routing.probe_failed(&probed, replacement, now);
                    }
                }
                _ => {
                    if let Some(id) = tx.remote_id {
                        self.routing.record_failure(&id);
                    }
                }
            }
            if let Some(lid) = tx.lookup {
                if let Some(lookup) = self.lookups.get_mut(&lid) {
                    lookup.on_failure(tx.remote);
                    touched.push(lid);
                }
            }
        }
        for lid in touched {
            self.drive_lookup(lid).await;
        }

        // Deadlines fire even when no packet arrives to advance a lookup.
        let lids: Vec<LookupId> = self.lookups.keys().copied().collect();
        for lid in lids {
            self.finish_if_done(lid).await;
        }

        self.flush_deferred(now).await;
    }

    async fn on_refresh(&mut self) {
        let now = Instant::now();
        self.peers.gc(now);

        let targets = self
            .routing
            .stale_targets(now, BUCKET_TTL, REFRESH_TARGETS_PER_SWEEP);
        for target in targets {
            debug!("refreshing stale bucket via {}", target);
            self.spawn_lookup(LookupKind::FindNode, target, None).await;
        }
    }

    async fn flush_deferred(&mut self, now: Instant) {
        while let Some((addr, bytes)) = self.deferred.pop_front() {
            if !self.limiter.try_acquire(now) {
                self.deferred.push_front((addr, bytes));
                break;
            }
            if let Err(err) = self.socket.send_to(&bytes, addr).await {
                debug!("deferred send to {} failed: {}", addr, err);
            }
        }
    }

    // ---- plumbing ------------------------------------------------------

    /// Inserts an observed contact, probing a bucket occupant when needed.
    /// The local id and bootstrap routers never enter the table.
    async fn observe(&mut self, contact: Contact) {
        if contact.id == self.local_id || self.router_addrs.contains(&contact.addr) {
            return;
        }
        let now = Instant::now();
        if let Insert::Pending { probe } = self.routing.insert(contact.clone(), now) {
            self.send_query(
                probe.addr,
                Some(probe.id),
                Query::Ping,
                SentQuery::Probe {
                    replacement: contact,
                },
                None,
            )
            .await;
        }
    }

    /// The K closest contacts to `target` in the requester's address family.
    fn closest_for(&self, target: &NodeId, requester: SocketAddr) -> Vec<Contact> {
        let now = Instant::now();
        self.routing
            .closest(target, K, now)
            .into_iter()
            .filter(|c| c.addr.is_ipv4() == requester.is_ipv4())
            .collect()
    }

    async fn send_query(
        &mut self,
        remote: SocketAddr,
        remote_id: Option<NodeId>,
        query: Query,
        sent: SentQuery,
        lookup: Option<LookupId>,
    ) {
        let now = Instant::now();
        let tid = self
            .transactions
            .allocate(remote, remote_id, sent, lookup, now);
        let bytes = Message::query(tid, self.local_id, query).encode();
        if let Some(id) = remote_id {
            self.routing.record_query(&id);
        }

        if self.limiter.try_acquire(now) {
            if let Err(err) = self.socket.send_to(&bytes, remote).await {
                debug!("send to {} failed: {}", remote, err);
                if let Some(id) = remote_id {
                    self.routing.record_failure(&id);
                }
            }
        } else {
            // Bucket empty: keep FIFO order; the transaction deadline keeps
            // running, so sustained overload shows up as timeouts.
            self.deferred.push_back((remote, bytes));
        }
    }

    async fn send_reply(&mut self, remote: SocketAddr, bytes: Vec<u8>) {
        let now = Instant::now();
        if !self.limiter.try_acquire_reply(now) {
            debug!("rate ceiling reached, dropping reply to {}", remote);
            return;
        }
        if let Err(err) = self.socket.send_to(&bytes, remote).await {
            debug!("reply to {} failed: {}", remote, err);
        }
    }

    async fn shutdown(&mut self) {
        let cancelled = self.lookups.len();
        self.lookups.clear();
        self.active.clear();
        self.transactions.drain();
        if cancelled > 0 {
            debug!("cancelled {} pending lookups", cancelled);
        }

        // Bounded flush of writes that were queued behind the rate limiter.
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while let Some((addr, bytes)) = self.deferred.pop_front() {
            if Instant::now() >= deadline {
                break;
            }
            let _ = self.socket.send_to(&bytes, addr).await;
        }
        info!("dht node {} stopped", self.local_id);
    }
}

#[cfg(test)]
mod tests;
