//! Shared test doubles for the integration tests: a `SessionInfo` with a
//! fixed port, and `PeerPublisher`/`StatsPublisher` that just record what
//! they were told.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use announcer::{InfoHash, PeerPublisher, SessionInfo, StatsPublisher};

pub struct TestSession {
    pub port: u16,
}

impl SessionInfo for TestSession {
    fn peer_port(&self) -> u16 {
        self.port
    }
}

#[derive(Default)]
pub struct TestPeers {
    pub seen: Mutex<HashMap<InfoHash, Vec<SocketAddr>>>,
}

impl PeerPublisher for TestPeers {
    fn publish_peers(&self, info_hash: &InfoHash, peers: &[SocketAddr]) {
        self.seen.lock().unwrap().insert(*info_hash, peers.to_vec());
    }
}

#[derive(Default)]
pub struct TestStats {
    pub counts: Mutex<HashMap<InfoHash, (Option<u32>, Option<u32>, Option<u32>)>>,
    pub errors: Mutex<HashMap<InfoHash, String>>,
}

impl StatsPublisher for TestStats {
    fn publish_counts(&self, info_hash: &InfoHash, seeders: Option<u32>, leechers: Option<u32>, downloads: Option<u32>) {
        self.counts.lock().unwrap().insert(*info_hash, (seeders, leechers, downloads));
    }

    fn publish_error(&self, info_hash: &InfoHash, message: &str) {
        self.errors.lock().unwrap().insert(*info_hash, message.to_string());
    }

    fn clear_error(&self, info_hash: &InfoHash) {
        self.errors.lock().unwrap().remove(info_hash);
    }
}
