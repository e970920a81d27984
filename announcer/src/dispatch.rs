//! Sends a single announce, or a scrape batch, and folds the response (or
//! failure) back into tier state: tracker rotation, backoff scheduling,
//! and the facts the torrent owner gets told about.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

use url::Url;

use crate::config::AnnouncerConfig;
use crate::error::AnnouncerError;
use crate::ids::InfoHash;
use crate::request::{AnnounceRequest, ScrapeFileEntry, ScrapeRequest, ScrapeResponse};
use crate::retry::retry_interval;
use crate::tier::{AnnounceKey, Tier};
use crate::transport::Transports;

/// Substrings a tracker's failure reason uses to say "I don't know this
/// torrent" rather than "something went wrong" — these end the tier's
/// announce cycle rather than rescheduling a retry.
pub const TORRENT_UNREGISTERED_MARKERS: &[&str] =
    &["torrent not registered", "unregistered torrent", "unknown torrent", "not found", "not exist"];

fn looks_unregistered(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    TORRENT_UNREGISTERED_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceEffects {
    pub peers_v4: Vec<SocketAddrV4>,
    pub peers_v6: Vec<SocketAddrV6>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub warning: Option<String>,
    pub error: Option<String>,
    /// Whether `error` should actually reach the torrent owner: ordinary
    /// tracker/transport failures are only surfaced when this was the
    /// only tracker in the announce list (many metainfos carry dead
    /// trackers, and a tier failing over shouldn't alarm anyone), but a
    /// "torrent unregistered" verdict always surfaces — the human has to
    /// act on it regardless of how many other trackers exist.
    pub surface_error: bool,
    pub torrent_unregistered: bool,
}

/// Everything a caller needs to fire off an announce without holding a
/// borrow of the tier across the network await: the destination and a
/// fully-populated request. Building this is the only part of announcing
/// that touches `Tier` before the response comes back, so a caller
/// holding a session-wide lock only needs it for this call, not for the
/// round trip.
pub struct AnnouncePlan {
    pub url: Url,
    pub key: AnnounceKey,
}

/// Marks the tier as having an announce in flight and returns where to
/// send it. Call [`apply_announce_result`] with the outcome once the
/// network call (done without holding the tier) completes.
pub fn prepare_announce(tier: &mut Tier, req: &mut AnnounceRequest) -> AnnouncePlan {
    tier.is_announcing = true;
    tier.last_announce_start_time = Some(Instant::now());
    let tracker = tier.current_tracker().expect("a tier always has at least one tracker");
    req.tracker_id = tracker.tracker_id.clone();
    AnnouncePlan { url: tracker.announce_url.clone(), key: tracker.key.clone() }
}

/// Sends the request an [`AnnouncePlan`] describes. Pure I/O — does not
/// touch tier state, so it can run without holding any lock on it.
pub async fn send_announce(
    transports: &Transports,
    plan: &AnnouncePlan,
    req: &AnnounceRequest,
    config: &AnnouncerConfig,
) -> crate::error::Result<crate::request::AnnounceResponse> {
    transports.announce(&plan.key, &plan.url, req, config).await
}

/// Folds an announce's outcome back into tier state: success reschedules
/// the tier at the tracker's interval and clears its failure count;
/// failure backs off and may rotate the tier to its next tracker.
pub fn apply_announce_result(
    tier: &mut Tier,
    result: crate::error::Result<crate::request::AnnounceResponse>,
    config: &AnnouncerConfig,
    epoch: Instant,
) -> AnnounceEffects {
    let now = Instant::now();
    tier.is_announcing = false;
    tier.last_announce_time = Some(now);

    let mut effects = AnnounceEffects::default();
    match result {
        Err(err) => {
            tier.last_announce_timed_out = false;
            tier.last_announce_str = Some(err.to_string());
            effects.error = Some(err.to_string());
            effects.surface_error = tier.trackers.len() < 2;
            apply_announce_failure(tier, config, now);
        }
        Ok(response) if response.did_timeout => {
            tier.last_announce_timed_out = true;
            tier.last_announce_str = Some("Tracker did not respond".into());
            effects.error = Some("Tracker did not respond".into());
            effects.surface_error = tier.trackers.len() < 2;
            apply_announce_failure(tier, config, now);
        }
        Ok(response) => {
            tier.last_announce_timed_out = false;
            if let Some(reason) = response.failure_reason.clone() {
                tier.last_announce_str = Some(reason.clone());
                effects.error = Some(reason.clone());
                if looks_unregistered(&reason) {
                    effects.torrent_unregistered = true;
                    effects.surface_error = true;
                    tier.last_announce_succeeded = false;
                    tracing::error!(error = %AnnouncerError::TorrentUnregistered(reason), "tracker declared this torrent unregistered; not rescheduling");
                } else {
                    effects.surface_error = tier.trackers.len() < 2;
                    apply_announce_failure(tier, config, now);
                }
            } else {
                tier.last_announce_str = None;
                effects.warning = response.warning_message.clone();
                effects.seeders = response.seeders;
                effects.leechers = response.leechers;
                effects.downloads = response.downloads;
                effects.peers_v4 = response.peers_v4.clone();
                effects.peers_v6 = response.peers_v6.clone();
                apply_announce_success(tier, &response, config, now);
                if response.looks_like_scrape_data() && tier.scrape_at.is_none() {
                    tier.scrape_at = Some(crate::retry::round_up_to_10s(epoch, now + Duration::from_secs(5)));
                }
            }
        }
    }
    effects
}

fn apply_announce_success(tier: &mut Tier, response: &crate::request::AnnounceResponse, config: &AnnouncerConfig, now: Instant) {
    tier.last_announce_succeeded = true;
    tier.last_announce_peer_count = response.peers_v4.len() + response.peers_v6.len();
    if let Some(tracker) = tier.current_tracker_mut() {
        tracker.consecutive_failures = 0;
        if response.tracker_id.is_some() {
            tracker.tracker_id = response.tracker_id.clone();
        }
        tracker.seeders = response.seeders.or(tracker.seeders);
        tracker.leechers = response.leechers.or(tracker.leechers);
        tracker.downloads = response.downloads.or(tracker.downloads);
    }

    let interval = response.interval.map(Duration::from_secs).unwrap_or(config.announce_interval);
    tier.announce_interval = interval.max(config.announce_min_interval);
    if let Some(min_interval) = response.min_interval {
        tier.announce_min_interval = Duration::from_secs(min_interval).max(Duration::from_secs(1));
    }
    tier.announce_at = Some(now + tier.announce_interval);

    if tier.last_announce_event == Some(crate::event::AnnounceEvent::Stopped) {
        tier.zero_byte_counts();
    }
}

/// A tracker failure always rotates the tier to its next tracker (tier
/// failover, BEP-12) and always backs off under `retry_interval`, keyed
/// to the failed tracker's own `consecutive_failures` count.
fn apply_announce_failure(tier: &mut Tier, config: &AnnouncerConfig, now: Instant) {
    tier.last_announce_succeeded = false;
    let failures = match tier.current_tracker_mut() {
        Some(tracker) => {
            tracker.consecutive_failures += 1;
            tracker.consecutive_failures
        }
        None => 1,
    };
    tier.advance_tracker(config);
    tier.announce_at = Some(now + retry_interval(failures));
}

/// Sends one scrape batch (possibly several torrents' info hashes) to a
/// single tracker. Applying the per-torrent result to each tier is a
/// separate step ([`apply_scrape_outcome`]) since one response fans back
/// out to several tiers.
pub async fn send_scrape(
    transports: &Transports,
    key: &AnnounceKey,
    scrape_url: &Url,
    info_hashes: Vec<InfoHash>,
    config: &AnnouncerConfig,
) -> crate::error::Result<ScrapeResponse> {
    let req = ScrapeRequest { info_hashes };
    transports.scrape(key, scrape_url, &req, config).await
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeEffects {
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub error: Option<String>,
}

pub enum ScrapeOutcome {
    Success(ScrapeFileEntry),
    /// The tracker's response didn't mention this info hash at all.
    Missing,
    Failure(String),
    Timeout,
}

/// Folds one tier's share of a scrape batch's outcome back into its
/// state, rotating the current tracker on failure the same way an
/// announce failure does.
pub fn apply_scrape_outcome(tier: &mut Tier, outcome: ScrapeOutcome, config: &AnnouncerConfig, now: Instant) -> ScrapeEffects {
    tier.is_scraping = false;
    tier.last_scrape_time = Some(now);
    let mut effects = ScrapeEffects::default();

    match outcome {
        ScrapeOutcome::Success(entry) => {
            tier.last_scrape_succeeded = true;
            tier.last_scrape_timed_out = false;
            tier.last_scrape_str = None;
            if let Some(tracker) = tier.current_tracker_mut() {
                tracker.consecutive_failures = 0;
                tracker.seeders = entry.complete.or(tracker.seeders);
                tracker.leechers = entry.incomplete.or(tracker.leechers);
                tracker.downloads = entry.downloaded.or(tracker.downloads);
            }
            tier.scrape_at = Some(now + tier.scrape_interval);
            effects.seeders = entry.complete;
            effects.leechers = entry.incomplete;
            effects.downloads = entry.downloaded;
        }
        ScrapeOutcome::Missing => {
            tier.scrape_at = Some(now + tier.scrape_interval);
        }
        ScrapeOutcome::Timeout => {
            tier.last_scrape_timed_out = true;
            tier.last_scrape_str = Some("Tracker did not respond".into());
            effects.error = Some("Tracker did not respond".into());
            apply_scrape_failure(tier, config, now);
        }
        ScrapeOutcome::Failure(message) => {
            tier.last_scrape_str = Some(message.clone());
            effects.error = Some(message);
            apply_scrape_failure(tier, config, now);
        }
    }
    effects
}

/// Mirrors `apply_announce_failure`: a scrape failure also rotates the
/// tier's current tracker and backs off keyed to its failure count.
fn apply_scrape_failure(tier: &mut Tier, config: &AnnouncerConfig, now: Instant) {
    tier.last_scrape_succeeded = false;
    let failures = match tier.current_tracker_mut() {
        Some(tracker) => {
            tracker.consecutive_failures += 1;
            tracker.consecutive_failures
        }
        None => 1,
    };
    tier.advance_tracker(config);
    tier.scrape_at = Some(now + retry_interval(failures));
}
