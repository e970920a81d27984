//! Session-wide entry point: owns every torrent's announcer state behind
//! one lock, runs the upkeep loop, and dispatches the announces/scrapes
//! that loop decides are due.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::AnnouncerConfig;
use crate::dispatch::{self, ScrapeOutcome};
use crate::error::Result;
use crate::ids::InfoHash;
use crate::mediator::{PeerPublisher, SessionInfo, StatsPublisher};
use crate::scheduler::{self, TierRef};
use crate::tier::{AnnounceKey, RawAnnounceEntry};
use crate::torrent::TorrentAnnouncer;
use crate::transport::Transports;

/// `downloaders + leechers` from the tracker's last scrape of us, each
/// defaulting to `-1` if unknown, mirroring `tr_tier::countDownloaders`:
/// a swarm we know nothing about ranks below one we know has peers
/// wanting data from us.
fn tracker_upload_appeal(tracker: &crate::tier::Tracker) -> i64 {
    let downloaders = tracker.downloaders.map(i64::from).unwrap_or(-1);
    let leechers = tracker.leechers.map(i64::from).unwrap_or(-1);
    downloaders + leechers
}

/// Owns every announced torrent and the shared transports they send
/// through. Cheap to clone (it's an `Arc` internally) so a session can
/// hand it to whichever subsystem needs to start or stop a torrent.
pub struct Announcer {
    config: AnnouncerConfig,
    transports: Transports,
    session: Arc<dyn SessionInfo>,
    peers: Arc<dyn PeerPublisher>,
    stats: Arc<dyn StatsPublisher>,
    torrents: AsyncMutex<HashMap<InfoHash, TorrentAnnouncer>>,
    /// Per-scrape-URL multiscrape cap, starting at
    /// `config.multiscrape_max_default` and shrinking (floor 1) whenever
    /// that tracker rejects a batch as too large. The only state shared
    /// across tiers that doesn't belong to any one torrent, so it gets
    /// its own lock rather than riding along with `torrents`.
    scrape_caps: StdMutex<HashMap<AnnounceKey, usize>>,
    epoch: Instant,
    shutdown_deadline: StdMutex<Option<Instant>>,
    upkeep_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Announcer {
    pub async fn new(
        config: AnnouncerConfig,
        session: Arc<dyn SessionInfo>,
        peers: Arc<dyn PeerPublisher>,
        stats: Arc<dyn StatsPublisher>,
    ) -> Result<Arc<Self>> {
        let transports = Transports::new().await?;
        let announcer = Arc::new(Self {
            config,
            transports,
            session,
            peers,
            stats,
            torrents: AsyncMutex::new(HashMap::new()),
            scrape_caps: StdMutex::new(HashMap::new()),
            epoch: Instant::now(),
            shutdown_deadline: StdMutex::new(None),
            upkeep_task: StdMutex::new(None),
        });

        let upkeep_handle = {
            let announcer = announcer.clone();
            tokio::spawn(async move { announcer.upkeep_loop().await })
        };
        *announcer.upkeep_task.lock().unwrap() = Some(upkeep_handle);
        Ok(announcer)
    }

    async fn upkeep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.upkeep_interval);
        loop {
            ticker.tick().await;
            self.upkeep_once().await;
            if self.shutdown_is_complete().await {
                break;
            }
        }
    }

    fn shutdown_deadline_passed(&self) -> bool {
        matches!(*self.shutdown_deadline.lock().unwrap(), Some(deadline) if Instant::now() >= deadline)
    }

    async fn shutdown_is_complete(&self) -> bool {
        let shutting_down = self.shutdown_deadline.lock().unwrap().is_some();
        if !shutting_down {
            return false;
        }
        if self.shutdown_deadline_passed() {
            return true;
        }
        self.is_idle().await
    }

    /// Runs one pass: collects every tier due for an announce or scrape,
    /// dispatches them, and folds the responses back in. Announces and
    /// scrape batches within a pass run concurrently; the pass itself is
    /// not re-entrant (the upkeep loop only ever has one in flight).
    async fn upkeep_once(&self) {
        let now = Instant::now();
        let (snapshot, info_hashes) = self.snapshot_tiers(now).await;
        let info_hashes = Arc::new(info_hashes);
        let announce_refs = scheduler::select_announces(&snapshot, &self.config);
        let caps = self.scrape_caps.lock().unwrap().clone();
        let scrape_batches = scheduler::select_scrapes(&snapshot, &self.config, &caps);

        let announces =
            announce_refs.into_iter().map(|tier_ref| self.run_one_announce(tier_ref, info_hashes.clone()));
        let scrapes = scrape_batches.into_iter().map(|batch| self.run_one_scrape_batch(batch, info_hashes.clone()));

        futures::future::join_all(announces).await;
        futures::future::join_all(scrapes).await;
    }

    /// `TierRef.torrent_index` is positional against the returned
    /// `info_hashes`, fixed for the lifetime of this tick so concurrent
    /// `add_torrent`/`remove_torrent` calls elsewhere can't shift which
    /// torrent an index refers to mid-dispatch.
    async fn snapshot_tiers(&self, now: Instant) -> (Vec<scheduler::TierSnapshot>, Vec<InfoHash>) {
        let torrents = self.torrents.lock().await;
        let info_hashes: Vec<InfoHash> = torrents.keys().copied().collect();
        let mut snapshot = Vec::new();
        for (torrent_index, info_hash) in info_hashes.iter().enumerate() {
            let torrent = &torrents[info_hash];
            let torrent_done = torrent.left == 0;
            for (tier_index, tier) in torrent.tiers.iter().enumerate() {
                let scrape_key = tier.current_tracker().and_then(|t| t.scrape_url.as_ref().map(|_| t.key.clone()));
                let upload_appeal = tier.current_tracker().map(tracker_upload_appeal).unwrap_or(-2);
                snapshot.push(scheduler::TierSnapshot {
                    tier_ref: TierRef { torrent_index, tier_index },
                    needs_announce: tier.needs_to_announce(now),
                    needs_scrape: tier.needs_to_scrape(now),
                    announce_priority: tier.announce_events.priority(),
                    announce_at: tier.announce_at,
                    scrape_at: tier.scrape_at,
                    scrape_key,
                    scrape_url_host: None,
                    upload_appeal,
                    torrent_done,
                    byte_total: tier.uploaded + tier.downloaded,
                });
            }
        }
        (snapshot, info_hashes)
    }

    async fn run_one_announce(&self, tier_ref: TierRef, info_hashes: Arc<Vec<InfoHash>>) {
        let Some(&info_hash) = info_hashes.get(tier_ref.torrent_index) else { return };

        let mut req = {
            let mut torrents = self.torrents.lock().await;
            let Some(torrent) = torrents.get_mut(&info_hash) else { return };
            if tier_ref.tier_index >= torrent.tiers.len() {
                return;
            }
            torrent.build_announce_request(tier_ref.tier_index, self.session.as_ref(), &self.config)
        };

        let plan = {
            let mut torrents = self.torrents.lock().await;
            let Some(torrent) = torrents.get_mut(&info_hash) else { return };
            let Some(tier) = torrent.tiers.get_mut(tier_ref.tier_index) else { return };
            dispatch::prepare_announce(tier, &mut req)
        };

        let result = dispatch::send_announce(&self.transports, &plan, &req, &self.config).await;

        let effects = {
            let mut torrents = self.torrents.lock().await;
            let Some(torrent) = torrents.get_mut(&info_hash) else { return };
            let Some(tier) = torrent.tiers.get_mut(tier_ref.tier_index) else { return };
            dispatch::apply_announce_result(tier, result, &self.config, self.epoch)
        };

        self.publish_announce_effects(&info_hash, effects);
    }

    fn publish_announce_effects(&self, info_hash: &InfoHash, effects: dispatch::AnnounceEffects) {
        if !effects.peers_v4.is_empty() || !effects.peers_v6.is_empty() {
            let mut addrs: Vec<SocketAddr> = Vec::with_capacity(effects.peers_v4.len() + effects.peers_v6.len());
            addrs.extend(effects.peers_v4.into_iter().map(SocketAddr::V4));
            addrs.extend(effects.peers_v6.into_iter().map(SocketAddr::V6));
            self.peers.publish_peers(info_hash, &addrs);
        }
        if effects.seeders.is_some() || effects.leechers.is_some() || effects.downloads.is_some() {
            self.stats.publish_counts(info_hash, effects.seeders, effects.leechers, effects.downloads);
        }
        if let Some(warning) = &effects.warning {
            self.stats.publish_warning(info_hash, warning);
        }
        match &effects.error {
            Some(message) if effects.surface_error => self.stats.publish_error(info_hash, message),
            Some(message) => {
                tracing::debug!(info_hash = %hex::encode(info_hash), error = %message, "announce failed but tier has other trackers left; not surfacing")
            }
            None => self.stats.clear_error(info_hash),
        }
    }

    /// Lowers the multiscrape cap for one scrape URL after it rejected a
    /// batch as too large, floored at 1 so a single info hash can always
    /// still be scraped.
    fn shrink_scrape_cap(&self, key: &AnnounceKey) {
        let mut caps = self.scrape_caps.lock().unwrap();
        let entry = caps.entry(key.clone()).or_insert(self.config.multiscrape_max_default);
        *entry = entry.saturating_sub(5).max(1);
        tracing::debug!(scrape_url = %key, new_cap = *entry, "shrinking multiscrape batch cap after a too-long rejection");
    }

    async fn run_one_scrape_batch(&self, batch: scheduler::ScrapeBatch, info_hashes: Arc<Vec<InfoHash>>) {
        let mut members_by_hash = Vec::with_capacity(batch.members.len());
        let (url, hashes) = {
            let mut torrents = self.torrents.lock().await;
            let mut url = None;
            let mut hashes = Vec::with_capacity(batch.members.len());
            for tier_ref in &batch.members {
                let Some(&info_hash) = info_hashes.get(tier_ref.torrent_index) else { continue };
                let Some(torrent) = torrents.get_mut(&info_hash) else { continue };
                let Some(tier) = torrent.tiers.get_mut(tier_ref.tier_index) else { continue };
                tier.is_scraping = true;
                if url.is_none() {
                    url = tier.current_tracker().and_then(|t| t.scrape_url.clone());
                }
                hashes.push(info_hash);
                members_by_hash.push((info_hash, *tier_ref));
            }
            (url, hashes)
        };
        let Some(url) = url else { return };

        let result = dispatch::send_scrape(&self.transports, &batch.scrape_key, &url, hashes, &self.config).await;
        if matches!(&result, Ok(response) if response.batch_too_large) {
            self.shrink_scrape_cap(&batch.scrape_key);
        }
        let now = Instant::now();

        let mut torrents = self.torrents.lock().await;
        for (info_hash, tier_ref) in members_by_hash {
            let Some(torrent) = torrents.get_mut(&info_hash) else { continue };
            let Some(tier) = torrent.tiers.get_mut(tier_ref.tier_index) else { continue };
            let outcome = match &result {
                Err(err) => ScrapeOutcome::Failure(err.to_string()),
                Ok(response) if response.did_timeout => ScrapeOutcome::Timeout,
                Ok(response) => match response.errmsg.clone() {
                    Some(message) => ScrapeOutcome::Failure(message),
                    None => match response.files.get(&info_hash) {
                        Some(entry) => ScrapeOutcome::Success(*entry),
                        None => ScrapeOutcome::Missing,
                    },
                },
            };
            let effects = dispatch::apply_scrape_outcome(tier, outcome, &self.config, now);
            if effects.seeders.is_some() || effects.leechers.is_some() || effects.downloads.is_some() {
                self.stats.publish_counts(&info_hash, effects.seeders, effects.leechers, effects.downloads);
            }
        }
    }

    pub async fn add_torrent(&self, info_hash: InfoHash, announce_list: &[RawAnnounceEntry], left: u64) {
        let torrent = TorrentAnnouncer::new(info_hash, announce_list, left, &self.config, self.session.as_ref());
        self.torrents.lock().await.insert(info_hash, torrent);
    }

    /// Drops a torrent's announcer state. Any tier that was running and
    /// whose last announce succeeded gets one last `stopped` fired off
    /// first, fire-and-forget, so its tracker learns we left rather than
    /// just going silent until the tracker's own peer timeout expires.
    pub async fn remove_torrent(&self, info_hash: &InfoHash) {
        let torrent = self.torrents.lock().await.remove(info_hash);
        let Some(torrent) = torrent else { return };

        for tier_index in 0..torrent.tiers.len() {
            let tier = &torrent.tiers[tier_index];
            if !(tier.is_running && tier.last_announce_succeeded) {
                continue;
            }
            let Some(tracker) = tier.current_tracker() else { continue };
            let url = tracker.announce_url.clone();
            let key = tracker.key.clone();
            let req = torrent.build_stopped_request(tier_index, self.session.as_ref(), &self.config);
            if let Err(err) = self.transports.announce(&key, &url, &req, &self.config).await {
                tracing::debug!(error = %err, "failed to send a final stopped announce for a removed torrent");
            }
        }
    }

    pub async fn start_torrent(&self, info_hash: &InfoHash) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.lock().await.get_mut(info_hash) {
            torrent.start(now);
        }
    }

    pub async fn stop_torrent(&self, info_hash: &InfoHash) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.lock().await.get_mut(info_hash) {
            torrent.stop(now);
        }
    }

    pub async fn torrent_completed(&self, info_hash: &InfoHash) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.lock().await.get_mut(info_hash) {
            torrent.completed(now);
        }
    }

    pub async fn manual_announce(&self, info_hash: &InfoHash) -> std::result::Result<(), &'static str> {
        let now = Instant::now();
        match self.torrents.lock().await.get_mut(info_hash) {
            Some(torrent) => torrent.manual_announce(now),
            None => Err("no such torrent"),
        }
    }

    pub async fn add_bytes(&self, info_hash: &InfoHash, uploaded: u64, downloaded: u64, corrupt: u64) {
        if let Some(torrent) = self.torrents.lock().await.get_mut(info_hash) {
            torrent.add_bytes(uploaded, downloaded, corrupt);
        }
    }

    /// Rebuilds `info_hash`'s tiers from `announce_list`, e.g. after a
    /// magnet link resolves its metadata or the user edits the tracker
    /// list, without losing the tracker IDs and counts already learned.
    pub async fn reset_torrent(&self, info_hash: &InfoHash, announce_list: &[RawAnnounceEntry]) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.lock().await.get_mut(info_hash) {
            torrent.reset(announce_list, now, &self.config);
        }
    }

    /// Session port changes take effect on the next announce: every
    /// request is built fresh from `SessionInfo::peer_port`, so there is
    /// nothing to update here beyond letting the host's `SessionInfo`
    /// reflect the new value.
    pub fn change_my_port(&self) {}

    /// Queues `stopped` on every running torrent (ordered heaviest
    /// uploader first, so a truncated shutdown window favors whoever owes
    /// the most) and starts the shutdown deadline.
    pub async fn start_shutdown(&self) {
        let now = Instant::now();
        self.transports.start_shutdown(self.config.udp_shutdown_grace);
        let mut torrents = self.torrents.lock().await;
        let mut by_activity: Vec<&mut TorrentAnnouncer> = torrents.values_mut().collect();
        by_activity.sort_by_key(|t| std::cmp::Reverse(t.pending_activity_total()));
        for torrent in by_activity {
            if torrent.is_running {
                torrent.stop(now);
            }
        }
        *self.shutdown_deadline.lock().unwrap() = Some(now + self.config.shutdown_deadline);
    }

    /// Whether every torrent has nothing left to send and the UDP
    /// transport has no request outstanding.
    pub async fn is_idle(&self) -> bool {
        let torrents = self.torrents.lock().await;
        let all_quiet = torrents.values().all(|t| {
            t.tiers.iter().all(|tier| tier.announce_events.is_empty() && !tier.is_announcing && !tier.is_scraping)
        });
        all_quiet && self.transports.udp_is_idle()
    }

    /// Waits for [`Self::is_idle`] or the shutdown deadline, whichever
    /// comes first, then stops the upkeep loop.
    pub async fn close(&self) {
        if self.shutdown_deadline.lock().unwrap().is_none() {
            self.start_shutdown().await;
        }
        while !self.shutdown_is_complete().await {
            tokio::time::sleep(self.config.upkeep_interval).await;
        }
        if let Some(handle) = self.upkeep_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
