//! End-to-end announce against a real (if minimal) HTTP tracker: the
//! announcer should reach it, decode the compact peer list, and hand both
//! the peers and the stats off through the mediator traits.

mod support;

use std::sync::Arc;
use std::time::Duration;

use announcer::{Announcer, AnnouncerConfig, RawAnnounceEntry};
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_bytes::ByteBuf;
use serde_derive::Serialize;
use tokio::net::TcpListener;

use support::{TestPeers, TestSession, TestStats};

#[derive(Serialize)]
struct AnnounceStub {
    interval: u64,
    complete: u32,
    incomplete: u32,
    peers: ByteBuf,
}

async fn serve_one_announce(listener: TcpListener, body: Vec<u8>) {
    let (stream, _) = listener.accept().await.unwrap();
    let io = TokioIo::new(stream);
    let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
        let body = body.clone();
        async move { Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body)))) }
    });
    let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
}

#[tokio::test]
async fn http_announce_delivers_compact_peers_and_counts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut peer_bytes = Vec::new();
    peer_bytes.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
    let body = bencode::encode_to_raw(&AnnounceStub {
        interval: 1800,
        complete: 3,
        incomplete: 1,
        peers: ByteBuf::from(peer_bytes),
    })
    .unwrap();

    tokio::spawn(serve_one_announce(listener, body));

    let session = Arc::new(TestSession { port: 6881 });
    let peers = Arc::new(TestPeers::default());
    let stats = Arc::new(TestStats::default());
    let mut config = AnnouncerConfig::default();
    config.upkeep_interval = Duration::from_millis(20);

    let announcer = Announcer::new(config, session, peers.clone(), stats.clone()).await.unwrap();

    let info_hash = [7u8; 20];
    let announce_list = [RawAnnounceEntry { url: format!("http://{addr}/announce"), tier: 0 }];
    announcer.add_torrent(info_hash, &announce_list, 100).await;
    announcer.start_torrent(&info_hash).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if peers.seen.lock().unwrap().contains_key(&info_hash) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for the announce to land");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let delivered = peers.seen.lock().unwrap().get(&info_hash).cloned().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].port(), 0x1AE1);

    let counts = *stats.counts.lock().unwrap().get(&info_hash).unwrap();
    assert_eq!(counts, (Some(3), Some(1), None));
}
