use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::*;
use crate::krpc::{Message, Payload, Query, Reply};
use crate::node::{Contact, NodeId};

const TEST_HASH: &str = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2";

fn test_config(routers: Vec<String>) -> Config {
    Config {
        routers,
        // Unlimited so localhost tests are not paced.
        rate_limit: 0,
        ..Config::default()
    }
}

async fn start_node(routers: Vec<String>) -> (Dht, tokio::task::JoinHandle<()>) {
    let (dht, service) = Dht::new(test_config(routers)).await.expect("bind node");
    let handle = tokio::spawn(service.run());
    (dht, handle)
}

/// A bare socket playing the part of a remote node.
struct RawPeer {
    socket: UdpSocket,
    id: NodeId,
}

impl RawPeer {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.expect("bind raw peer"),
            id: NodeId::generate(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("local addr")
    }

    async fn send(&self, msg: &Message, to: SocketAddr) {
        self.socket
            .send_to(&msg.encode(), to)
            .await
            .expect("raw send");
    }

    async fn recv(&self) -> Message {
        let mut buf = vec![0u8; 65535];
        let (n, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .expect("raw recv");
        Message::parse(&buf[..n]).expect("parse reply")
    }
}

async fn snapshot_nodes(dht: &Dht) -> Vec<(SocketAddr, NodeId)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dht.visit_nodes(move |addr, id| {
        sink.lock().expect("poisoned").push((addr, id));
    })
    .await
    .expect("visit");
    let out = seen.lock().expect("poisoned").clone();
    out
}

fn node_addr(dht: &Dht) -> String {
    format!("127.0.0.1:{}", dht.port())
}

#[tokio::test]
async fn test_config_roundtrip() {
    let config = Config {
        routers: Vec::new(),
        num_target_peers: 10,
        ..Config::default()
    };
    let (dht, _service) = Dht::new(config).await.expect("bind");

    assert_ne!(dht.port(), 0, "ephemeral bind must report the real port");
    assert_eq!(dht.config().num_target_peers, 10);
    assert!(dht.config().routers.is_empty());
}

#[tokio::test]
async fn test_invalid_node_id_rejected() {
    let config = Config {
        node_id: Some(vec![1, 2, 3]),
        routers: Vec::new(),
        ..Config::default()
    };
    match Dht::new(config).await {
        Err(ConfigError::InvalidNodeId(3)) => {}
        other => panic!("expected InvalidNodeId, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_configured_node_id_is_used() {
    let id = NodeId::generate();
    let config = Config {
        node_id: Some(id.as_bytes().to_vec()),
        routers: Vec::new(),
        ..Config::default()
    };
    let (dht, _service) = Dht::new(config).await.expect("bind");
    assert_eq!(dht.node_id(), id);
}

#[tokio::test]
async fn test_ping_is_answered_and_sender_learned() {
    let (dht, handle) = start_node(Vec::new()).await;
    let node: SocketAddr = node_addr(&dht).parse().expect("addr");
    let peer = RawPeer::bind().await;

    let ping = Message::query(Bytes::from_static(b"aa"), peer.id, Query::Ping);
    peer.send(&ping, node).await;

    let reply = peer.recv().await;
    assert_eq!(reply.tid, Bytes::from_static(b"aa"));
    match reply.payload {
        Payload::Reply(r) => assert_eq!(r.id, Some(dht.node_id())),
        other => panic!("expected a reply, got {:?}", other),
    }

    // The querying peer is now a routing-table contact.
    let nodes = snapshot_nodes(&dht).await;
    assert!(nodes.contains(&(peer.addr(), peer.id)));

    dht.stop().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_unsolicited_reply_is_ignored() {
    let (mut dht, handle) = start_node(Vec::new()).await;
    let node: SocketAddr = node_addr(&dht).parse().expect("addr");
    let peer = RawPeer::bind().await;

    // A well-formed find_node response whose transaction id was never
    // allocated by the node.
    let bogus = Message::reply(
        Bytes::from_static(b"zz"),
        Reply::nodes(
            peer.id,
            vec![Contact::new(NodeId::generate(), peer.addr())],
        ),
    );
    peer.send(&bogus, node).await;

    // No routing-table entry and no application event may come of it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(snapshot_nodes(&dht).await.is_empty());
    assert!(timeout(Duration::from_millis(200), dht.next_peers())
        .await
        .is_err());

    dht.stop().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_garbage_never_kills_the_loop() {
    let (dht, handle) = start_node(Vec::new()).await;
    let node: SocketAddr = node_addr(&dht).parse().expect("addr");
    let peer = RawPeer::bind().await;

    for junk in [
        &b"\x00\xff\x13\x37"[..],
        b"",
        b"d1:t2:aa1:y1:qe",
        b"i42e",
        b"d1:ad2:id3:wate1:q4:ping1:t2:aa1:y1:qe",
    ] {
        peer.socket.send_to(junk, node).await.expect("send junk");
    }

    // Still answers a legitimate query afterwards.
    let ping = Message::query(Bytes::from_static(b"ok"), peer.id, Query::Ping);
    peer.send(&ping, node).await;
    let reply = peer.recv().await;
    assert!(matches!(reply.payload, Payload::Reply(_)));

    dht.stop().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_find_node_returns_known_contacts() {
    let (dht, handle) = start_node(Vec::new()).await;
    let node: SocketAddr = node_addr(&dht).parse().expect("addr");

    let known = NodeId::generate();
    let known_addr: SocketAddr = "127.0.0.1:41000".parse().expect("addr");
    dht.add_node(known_addr, Some(known)).await.expect("add");

    let peer = RawPeer::bind().await;
    let query = Message::query(
        Bytes::from_static(b"fn"),
        peer.id,
        Query::FindNode { target: known },
    );
    peer.send(&query, node).await;

    let reply = peer.recv().await;
    match reply.payload {
        Payload::Reply(r) => {
            assert!(r.nodes.iter().any(|c| c.id == known && c.addr == known_addr));
        }
        other => panic!("expected nodes, got {:?}", other),
    }

    dht.stop().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_get_peers_token_announce_cycle() {
    let (dht, handle) = start_node(Vec::new()).await;
    let node: SocketAddr = node_addr(&dht).parse().expect("addr");
    let info_hash = InfoHash::from_hex(TEST_HASH).expect("hash");
    let peer = RawPeer::bind().await;

    // get_peers: nobody announced yet, so we get a token and contacts.
    let query = Message::query(Bytes::from_static(b"gp"), peer.id, Query::GetPeers { info_hash });
    peer.send(&query, node).await;
    let reply = peer.recv().await;
    let token = match reply.payload {
        Payload::Reply(r) => {
            assert!(r.peers.is_empty());
            r.token.expect("get_peers reply must carry a token")
        }
        other => panic!("expected a reply, got {:?}", other),
    };

    // announce_peer with that token succeeds.
    let announce = Message::query(
        Bytes::from_static(b"an"),
        peer.id,
        Query::AnnouncePeer {
            info_hash,
            port: 7777,
            token: token.clone(),
            implied_port: false,
        },
    );
    peer.send(&announce, node).await;
    let reply = peer.recv().await;
    assert!(matches!(reply.payload, Payload::Reply(_)));

    // The announced peer is served back on the next get_peers.
    let query = Message::query(Bytes::from_static(b"g2"), peer.id, Query::GetPeers { info_hash });
    peer.send(&query, node).await;
    let reply = peer.recv().await;
    match reply.payload {
        Payload::Reply(r) => {
            let expected: SocketAddr = SocketAddr::new(peer.addr().ip(), 7777);
            assert_eq!(r.peers, vec![expected]);
        }
        other => panic!("expected peers, got {:?}", other),
    }

    // A forged token is rejected with a protocol error.
    let forged = Message::query(
        Bytes::from_static(b"a2"),
        peer.id,
        Query::AnnouncePeer {
            info_hash,
            port: 7778,
            token: Bytes::from_static(b"deadbeef"),
            implied_port: false,
        },
    );
    peer.send(&forged, node).await;
    let reply = peer.recv().await;
    match reply.payload {
        Payload::Error { code, .. } => assert_eq!(code, 203),
        other => panic!("expected error 203, got {:?}", other),
    }

    dht.stop().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_add_node_without_id_pings_first() {
    let (dht, handle) = start_node(Vec::new()).await;
    let peer = RawPeer::bind().await;

    dht.add_node(peer.addr(), None).await.expect("add");

    // The node pings to learn the id; answer it.
    let mut buf = vec![0u8; 65535];
    let (n, from) = timeout(Duration::from_secs(2), peer.socket.recv_from(&mut buf))
        .await
        .expect("expected a ping")
        .expect("recv");
    let ping = Message::parse(&buf[..n]).expect("parse ping");
    assert!(matches!(
        ping.payload,
        Payload::Query {
            query: Query::Ping,
            ..
        }
    ));
    let pong = Message::reply(ping.tid, Reply::pong(peer.id));
    peer.send(&pong, from).await;

    // Once the pong lands, the contact exists under its learned id.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let nodes = snapshot_nodes(&dht).await;
        if nodes.contains(&(peer.addr(), peer.id)) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "contact never learned: {:?}",
            nodes
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    dht.stop().await;
    let _ = handle.await;
}

/// Re-issues `peers_request` like a torrent client until `want` shows up.
async fn drain_until(
    dht: &mut Dht,
    info_hash: InfoHash,
    want: SocketAddr,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        match timeout(Duration::from_millis(250), dht.next_peers()).await {
            Ok(Some(batch)) => {
                if batch.info_hash == info_hash && batch.peers.contains(&want) {
                    return true;
                }
            }
            Ok(None) => return false,
            Err(_) => {
                let _ = dht.peers_request(info_hash, true).await;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_convergence() {
    let info_hash = InfoHash::from_hex(TEST_HASH).expect("hash");

    // n1 is the router; n2 and n3 only know n1.
    let (n1, h1) = start_node(Vec::new()).await;
    let router = vec![node_addr(&n1)];
    let (mut n2, h2) = start_node(router.clone()).await;
    let (mut n3, h3) = start_node(router).await;

    let n2_addr: SocketAddr = node_addr(&n2).parse().expect("addr");
    let n3_addr: SocketAddr = node_addr(&n3).parse().expect("addr");

    n2.peers_request(info_hash, true).await.expect("request");
    n3.peers_request(info_hash, true).await.expect("request");

    let (found2, found3) = tokio::join!(
        drain_until(&mut n2, info_hash, n3_addr, Duration::from_secs(10)),
        drain_until(&mut n3, info_hash, n2_addr, Duration::from_secs(10)),
    );
    assert!(found2, "n2 never discovered n3");
    assert!(found3, "n3 never discovered n2");

    assert!(n2.stats().total_peers() > 0);
    assert!(n2.stats().total_sent_get_peers() > 0);

    n1.stop().await;
    n2.stop().await;
    n3.stop().await;
    let _ = tokio::join!(h1, h2, h3);
}

#[tokio::test]
async fn test_stop_terminates_run() {
    let (dht, handle) = start_node(Vec::new()).await;
    dht.stop().await;

    timeout(Duration::from_secs(2), handle)
        .await
        .expect("run did not return after stop")
        .expect("service task panicked");

    // The handle is now disconnected.
    let info_hash = InfoHash::from_hex(TEST_HASH).expect("hash");
    assert!(dht.peers_request(info_hash, false).await.is_err());
}
