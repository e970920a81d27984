//! Traits through which the announcer reaches out to the rest of a
//! session (peer storage, torrent identity, the outside world) without
//! depending on their concrete types. A host embeds this crate by
//! implementing these and handing them to [`crate::Announcer::new`].

use std::net::{Ipv6Addr, SocketAddr};

use crate::ids::InfoHash;

/// Read-only facts about the running session that announce requests need
/// to fill in.
pub trait SessionInfo: Send + Sync {
    fn peer_port(&self) -> u16;

    /// Per-torrent `numwant` override; `None` defers to the announcer's
    /// configured default.
    fn numwant(&self, info_hash: &InfoHash) -> Option<u32> {
        let _ = info_hash;
        None
    }

    /// Whether this torrent is a BEP-21 partial seed (has some but not all
    /// pieces, and is only willing to upload what it already has). A
    /// partial seed announces as the pseudo-event `paused` instead of its
    /// queued event, unless the queued event is `Stopped`.
    fn is_partial_seed(&self, info_hash: &InfoHash) -> bool {
        let _ = info_hash;
        false
    }

    /// An IPv6 address to advertise via the `ipv6=` announce parameter
    /// (BEP-7), for a session that knows its own public address and wants
    /// a dual-stack tracker to record it without a separate IPv6 request.
    fn announce_ip(&self) -> Option<Ipv6Addr> {
        None
    }

    /// Whether the session's encryption mode requires it, in which case
    /// `requirecrypto=1` is sent so the tracker only returns peers that
    /// also support it.
    fn requires_crypto(&self) -> bool {
        false
    }

    /// A stable per-torrent `key` value generated and persisted by the
    /// session (e.g. alongside resume state), reused for the torrent's
    /// whole lifetime so a tracker can recognize the same client across a
    /// changed IP or port. `None` falls back to a freshly generated key.
    fn peer_id_key(&self, info_hash: &InfoHash) -> Option<u32> {
        let _ = info_hash;
        None
    }
}

/// Where newly-learned peers for a torrent are delivered.
pub trait PeerPublisher: Send + Sync {
    fn publish_peers(&self, info_hash: &InfoHash, peers: &[SocketAddr]);
}

/// How the stats and status a torrent's trackers report (seeders,
/// leechers, download counts, warnings, failures) surface to whatever is
/// watching it.
pub trait StatsPublisher: Send + Sync {
    fn publish_counts(&self, info_hash: &InfoHash, seeders: Option<u32>, leechers: Option<u32>, downloads: Option<u32>);

    fn publish_warning(&self, info_hash: &InfoHash, message: &str) {
        let _ = (info_hash, message);
    }

    fn publish_error(&self, info_hash: &InfoHash, message: &str) {
        let _ = (info_hash, message);
    }

    fn clear_error(&self, info_hash: &InfoHash) {
        let _ = info_hash;
    }
}
