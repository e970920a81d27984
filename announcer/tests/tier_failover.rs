//! BEP-12 failover: a tier with two trackers rotates off the first the
//! moment it fails, though the next announce attempt still waits out the
//! first-failure backoff before landing on the second.

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

#[tokio::test]
async fn failing_first_tracker_rotates_to_the_second_after_its_backoff() {
    // A port nothing is listening on: connecting to it fails fast and
    // reliably simulates an unreachable tracker.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let good_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let good_addr = good_listener.local_addr().unwrap();

    let body = bencode::encode_to_raw(&AnnounceStub {
        interval: 1800,
        complete: 1,
        incomplete: 0,
        peers: ByteBuf::from(vec![10, 0, 0, 1, 0x1A, 0xE1]),
    })
    .unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = good_listener.accept().await else { return };
            let body = body.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                    let body = body.clone();
                    async move { Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body)))) }
                });
                let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    let session = Arc::new(TestSession { port: 6881 });
    let peers = Arc::new(TestPeers::default());
    let stats = Arc::new(TestStats::default());
    let mut config = AnnouncerConfig::default();
    config.upkeep_interval = Duration::from_millis(20);

    let announcer = Announcer::new(config, session, peers.clone(), stats.clone()).await.unwrap();

    let info_hash = [3u8; 20];
    let announce_list = [
        RawAnnounceEntry { url: format!("http://{dead_addr}/announce"), tier: 0 },
        RawAnnounceEntry { url: format!("http://{good_addr}/announce"), tier: 0 },
    ];
    announcer.add_torrent(info_hash, &announce_list, 100).await;
    announcer.start_torrent(&info_hash).await;

    // The first failure's backoff (20 s, per the n=1 retry table) applies
    // even though the tier has already rotated to the second tracker, so
    // this has to wait that out rather than a few milliseconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if peers.seen.lock().unwrap().contains_key(&info_hash) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for failover to reach the second tracker");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let delivered = peers.seen.lock().unwrap().get(&info_hash).cloned().unwrap();
    assert_eq!(delivered[0].port(), 0x1AE1);
}
