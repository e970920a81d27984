use std::collections::BTreeMap;
use std::time::Instant;

use url::Url;

use crate::event::{AnnounceEvent, EventQueue};

/// Identity for a tracker endpoint, derived from the announce URL as
/// `scheme://host:port`. Trackers that share a key share UDP connection
/// state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnnounceKey(String);

impl AnnounceKey {
    pub fn from_url(url: &Url) -> Self {
        let port = url.port_or_known_default().unwrap_or(0);
        Self(format!("{}://{}:{}", url.scheme(), url.host_str().unwrap_or(""), port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnnounceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row in a tier.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub key: AnnounceKey,
    pub announce_url: Url,
    pub scrape_url: Option<Url>,
    pub tracker_id: Option<String>,
    pub consecutive_failures: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub downloaders: Option<u32>,
}

impl Tracker {
    pub fn new(announce_url: Url) -> Self {
        let key = AnnounceKey::from_url(&announce_url);
        let scrape_url = derive_scrape_url(&announce_url);
        Self {
            key,
            announce_url,
            scrape_url,
            tracker_id: None,
            consecutive_failures: 0,
            seeders: None,
            leechers: None,
            downloads: None,
            downloaders: None,
        }
    }

    /// Clears everything learned from responses, leaving identity intact.
    /// Used when rotating to the next tracker in a tier on failure.
    fn reset_runtime_state(&mut self) {
        self.seeders = None;
        self.leechers = None;
        self.downloads = None;
        self.downloaders = None;
    }
}

/// Replaces a final `/announce` path segment with `/scrape`, per BEP-48.
/// Trackers whose announce URL doesn't end in `/announce` have no scrape
/// URL.
fn derive_scrape_url(announce_url: &Url) -> Option<Url> {
    let path = announce_url.path();
    let last_segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let last_segment = &path[last_segment_start..];
    if !last_segment.starts_with("announce") {
        return None;
    }
    let replaced = format!("scrape{}", &last_segment["announce".len()..]);
    let mut scrape_url = announce_url.clone();
    scrape_url.set_path(&format!("{}{}", &path[..last_segment_start], replaced));
    Some(scrape_url)
}

/// A multitracker tier (BEP-12).
#[derive(Debug, Clone)]
pub struct Tier {
    pub trackers: Vec<Tracker>,
    pub current_index: usize,

    pub uploaded: u64,
    pub downloaded: u64,
    pub corrupt: u64,

    pub announce_events: EventQueue,
    pub announce_at: Option<Instant>,
    pub scrape_at: Option<Instant>,
    pub manual_announce_allowed_at: Option<Instant>,

    pub announce_interval: std::time::Duration,
    pub announce_min_interval: std::time::Duration,
    pub scrape_interval: std::time::Duration,

    pub is_announcing: bool,
    pub is_scraping: bool,
    pub is_running: bool,

    pub last_announce_succeeded: bool,
    pub last_announce_timed_out: bool,
    pub last_announce_str: Option<String>,
    pub last_announce_peer_count: usize,
    pub last_announce_time: Option<Instant>,
    pub last_announce_start_time: Option<Instant>,
    /// The event on the request currently (or most recently) in flight;
    /// needed after the fact to decide whether a successful announce was
    /// the `stopped` one that should zero the tier's byte counters.
    pub last_announce_event: Option<AnnounceEvent>,

    pub last_scrape_succeeded: bool,
    pub last_scrape_timed_out: bool,
    pub last_scrape_str: Option<String>,
    pub last_scrape_time: Option<Instant>,
    pub last_scrape_start_time: Option<Instant>,
}

impl Tier {
    pub fn new(trackers: Vec<Tracker>, config: &crate::config::AnnouncerConfig) -> Self {
        Self {
            trackers,
            current_index: 0,
            uploaded: 0,
            downloaded: 0,
            corrupt: 0,
            announce_events: EventQueue::new(),
            announce_at: None,
            scrape_at: None,
            manual_announce_allowed_at: None,
            announce_interval: config.announce_interval,
            announce_min_interval: config.announce_min_interval,
            scrape_interval: config.scrape_interval,
            is_announcing: false,
            is_scraping: false,
            is_running: false,
            last_announce_succeeded: false,
            last_announce_timed_out: false,
            last_announce_str: None,
            last_announce_peer_count: 0,
            last_announce_time: None,
            last_announce_start_time: None,
            last_announce_event: None,
            last_scrape_succeeded: false,
            last_scrape_timed_out: false,
            last_scrape_str: None,
            last_scrape_time: None,
            last_scrape_start_time: None,
        }
    }

    pub fn current_tracker(&self) -> Option<&Tracker> {
        self.trackers.get(self.current_index)
    }

    pub fn current_tracker_mut(&mut self) -> Option<&mut Tracker> {
        self.trackers.get_mut(self.current_index)
    }

    /// Rotates to the next tracker in the tier on failure, resetting the
    /// runtime state that no longer applies to the newly-current tracker.
    pub fn advance_tracker(&mut self, config: &crate::config::AnnouncerConfig) {
        if self.trackers.is_empty() {
            return;
        }
        self.current_index = (self.current_index + 1) % self.trackers.len();
        self.announce_interval = config.announce_interval;
        self.announce_min_interval = config.announce_min_interval;
        self.scrape_interval = config.scrape_interval;
        if let Some(tracker) = self.current_tracker_mut() {
            tracker.reset_runtime_state();
        }
    }

    pub fn byte_counts_are_zero(&self) -> bool {
        self.uploaded == 0 && self.downloaded == 0 && self.corrupt == 0
    }

    pub fn zero_byte_counts(&mut self) {
        self.uploaded = 0;
        self.downloaded = 0;
        self.corrupt = 0;
    }

    /// A scrape is due when `scrape_at` has passed, none is already in
    /// flight, and the current tracker has a scrape URL to send it to.
    pub fn needs_to_scrape(&self, now: Instant) -> bool {
        let has_scrape_url = matches!(self.current_tracker(), Some(t) if t.scrape_url.is_some());
        let due = matches!(self.scrape_at, Some(at) if at <= now);
        !self.is_scraping && has_scrape_url && due
    }

    /// An announce is due when `announce_at` has passed, neither an
    /// announce nor a scrape is already in flight, and there's at least
    /// one queued event to report.
    pub fn needs_to_announce(&self, now: Instant) -> bool {
        let due = matches!(self.announce_at, Some(at) if at <= now);
        !self.is_announcing && !self.is_scraping && !self.announce_events.is_empty() && due
    }

    /// A manual announce is rejected unless every tier allows it.
    pub fn manual_announce_allowed(&self, now: Instant) -> bool {
        match self.manual_announce_allowed_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn enqueue_event(&mut self, event: AnnounceEvent, announce_at: Instant) {
        self.announce_events.push(event);
        self.announce_at = Some(announce_at);
    }
}

/// Raw announce-list entry as provided by the embedding session: a URL
/// string and the tier it occupied in the metainfo's announce-list.
#[derive(Debug, Clone)]
pub struct RawAnnounceEntry {
    pub url: String,
    pub tier: u32,
}

/// Builds the ordered list of tiers from a torrent's raw announce list:
///
/// 1. drop syntactically invalid URLs,
/// 2. dedup by `(scheme, host, port, path)`,
/// 3. unify tier numbers for entries differing only by scheme,
/// 4. sort by `(tier ASC, scheme DESC)` so UDP precedes HTTP within a tier,
/// 5. group by tier into `Tier`s.
pub fn filter_trackers(entries: &[RawAnnounceEntry], config: &crate::config::AnnouncerConfig) -> Vec<Tier> {
    #[derive(PartialEq, Eq, Hash, Clone)]
    struct DedupKey {
        scheme: String,
        host: String,
        port: u16,
        path: String,
    }

    let mut seen: std::collections::HashSet<DedupKey> = std::collections::HashSet::new();
    let mut parsed: Vec<(u32, Url)> = Vec::new();

    for entry in entries {
        let Ok(url) = Url::parse(&entry.url) else {
            tracing::warn!("dropping syntactically invalid tracker url: {}", entry.url);
            continue;
        };
        let key = DedupKey {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or("").to_string(),
            port: url.port_or_known_default().unwrap_or(0),
            path: url.path().to_string(),
        };
        if !seen.insert(key) {
            continue;
        }
        parsed.push((entry.tier, url));
    }

    // Unify tier numbers for entries that differ only by scheme: group by
    // (host, port, path) and collapse every member onto the minimum tier
    // seen for that group.
    let mut unified_tier: std::collections::HashMap<(String, u16, String), u32> =
        std::collections::HashMap::new();
    for (tier, url) in &parsed {
        let group_key = (
            url.host_str().unwrap_or("").to_string(),
            url.port_or_known_default().unwrap_or(0),
            url.path().to_string(),
        );
        unified_tier
            .entry(group_key)
            .and_modify(|t| *t = (*t).min(*tier))
            .or_insert(*tier);
    }
    for (tier, url) in &mut parsed {
        let group_key = (
            url.host_str().unwrap_or("").to_string(),
            url.port_or_known_default().unwrap_or(0),
            url.path().to_string(),
        );
        *tier = unified_tier[&group_key];
    }

    // Sort by (tier ASC, scheme DESC); "udp" > "https" > "http" lexically,
    // which puts UDP ahead of HTTP(S) within a tier.
    parsed.sort_by(|(tier_a, url_a), (tier_b, url_b)| {
        tier_a.cmp(tier_b).then_with(|| url_b.scheme().cmp(url_a.scheme()))
    });

    // Group by tier, preserving ascending tier order.
    let mut groups: BTreeMap<u32, Vec<Url>> = BTreeMap::new();
    for (tier, url) in parsed {
        groups.entry(tier).or_default().push(url);
    }

    groups
        .into_values()
        .map(|urls| Tier::new(urls.into_iter().map(Tracker::new).collect(), config))
        .collect()
}
