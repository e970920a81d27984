use std::net::{Ipv6Addr, SocketAddrV4, SocketAddrV6};

use crate::event::AnnounceEvent;
use crate::ids::{InfoHash, PeerId};

/// `left` when the metainfo's total size isn't known yet.
pub const LEFT_UNKNOWN: u64 = i64::MAX as u64;

/// Transport-agnostic announce request, built by the scheduler and handed
/// to whichever transport the tracker's scheme selects.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
    pub key: u32,
    pub tracker_id: Option<String>,
    pub partial_seed: bool,
    pub require_crypto: bool,
    pub ipv6: Option<Ipv6Addr>,
}

/// Neutral announce response, regardless of which transport produced it.
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub peers_v4: Vec<SocketAddrV4>,
    pub peers_v6: Vec<SocketAddrV6>,
    /// Set by the caller after the fact, not by transports: whether the
    /// transport could reach the tracker at all.
    pub did_connect: bool,
    pub did_timeout: bool,
}

impl AnnounceResponse {
    /// `seeders ≥ 1 ∧ leechers ≥ 1 ∧ downloads ≥ 1` — signal that the
    /// response carries scrape-like stats, used to decide whether to
    /// schedule a scrape soon.
    pub fn looks_like_scrape_data(&self) -> bool {
        matches!(self.seeders, Some(s) if s >= 1)
            && matches!(self.leechers, Some(l) if l >= 1)
            && matches!(self.downloads, Some(d) if d >= 1)
    }
}

/// Transport-agnostic scrape request: a scrape URL plus the info hashes to
/// batch into it.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub info_hashes: Vec<InfoHash>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeFileEntry {
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
    pub downloaders: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    pub files: std::collections::HashMap<InfoHash, ScrapeFileEntry>,
    pub min_request_interval: Option<u64>,
    pub did_connect: bool,
    pub did_timeout: bool,
    pub errmsg: Option<String>,
    /// Set when the tracker rejected the batch itself as too large (a
    /// too-long-URL/bad-request response), as opposed to an ordinary
    /// failure reason. Distinct from `errmsg` so the caller can shrink
    /// that scrape URL's batch cap without second-guessing unrelated
    /// failures.
    pub batch_too_large: bool,
}
