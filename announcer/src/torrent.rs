//! Per-torrent announcer state: its tiers, identity, and the byte/left
//! counters that feed every announce built from it.

use std::time::Instant;

use crate::config::AnnouncerConfig;
use crate::event::AnnounceEvent;
use crate::ids::{InfoHash, PeerId};
use crate::mediator::SessionInfo;
use crate::request::AnnounceRequest;
use crate::tier::{filter_trackers, RawAnnounceEntry, Tier};

pub struct TorrentAnnouncer {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub key: u32,
    pub tiers: Vec<Tier>,
    pub left: u64,
    pub is_running: bool,
}

impl TorrentAnnouncer {
    pub fn new(
        info_hash: InfoHash,
        announce_list: &[RawAnnounceEntry],
        left: u64,
        config: &AnnouncerConfig,
        session: &dyn SessionInfo,
    ) -> Self {
        let tiers = filter_trackers(announce_list, config);
        Self {
            info_hash,
            peer_id: crate::ids::generate_peer_id(),
            key: session.peer_id_key(&info_hash).unwrap_or_else(crate::ids::generate_key),
            tiers,
            left,
            is_running: false,
        }
    }

    /// Total bytes a would-be stopped announce still owes every tier, used
    /// to order the shutdown flush (the most active torrents report first
    /// so a truncated shutdown window favors them).
    pub fn pending_activity_total(&self) -> u64 {
        self.tiers.iter().map(|t| t.uploaded + t.downloaded).sum()
    }

    pub fn add_bytes(&mut self, uploaded: u64, downloaded: u64, corrupt: u64) {
        for tier in &mut self.tiers {
            tier.uploaded += uploaded;
            tier.downloaded += downloaded;
            tier.corrupt += corrupt;
        }
    }

    fn enqueue_event_everywhere(&mut self, event: AnnounceEvent, now: Instant) {
        for tier in &mut self.tiers {
            tier.enqueue_event(event, now);
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.is_running = true;
        for tier in &mut self.tiers {
            tier.is_running = true;
        }
        self.enqueue_event_everywhere(AnnounceEvent::Started, now);
    }

    /// Queues `stopped` on every tier, to be flushed immediately (the
    /// caller is expected to be the shutdown path or an explicit stop).
    pub fn stop(&mut self, now: Instant) {
        self.is_running = false;
        for tier in &mut self.tiers {
            tier.is_running = false;
        }
        self.enqueue_event_everywhere(AnnounceEvent::Stopped, now);
    }

    pub fn completed(&mut self, now: Instant) {
        self.enqueue_event_everywhere(AnnounceEvent::Completed, now);
    }

    /// Rejected unless every tier is currently willing to take a manual
    /// reannounce (each tier enforces its own cooldown after the last
    /// manual trigger).
    pub fn manual_announce(&mut self, now: Instant) -> std::result::Result<(), &'static str> {
        if !self.tiers.iter().all(|t| t.manual_announce_allowed(now)) {
            return Err("manual announce is on cooldown for at least one tier");
        }
        for tier in &mut self.tiers {
            if tier.announce_events.is_empty() {
                tier.announce_events.push(AnnounceEvent::None);
            }
            tier.announce_at = Some(now);
        }
        Ok(())
    }

    /// Rebuilds the tier list from a (possibly edited) announce list, the
    /// way a magnet upgrade or a user-edited tracker list does. Unlike
    /// `TorrentAnnouncer::new`, this carries forward what the old tiers
    /// already learned: a new tracker that also existed in the old list
    /// keeps its `tracker_id` and last-known seeder/leecher/download
    /// counts rather than starting blank, and a tier that matches an old
    /// one inherits its pending event queue rather than losing a
    /// not-yet-sent `stopped`. The torrent re-announces `started` on
    /// whichever tiers come up with no pending events of their own, so a
    /// running torrent doesn't go quiet to trackers it's still using.
    pub fn reset(&mut self, announce_list: &[RawAnnounceEntry], now: Instant, config: &AnnouncerConfig) {
        let old_tiers = std::mem::take(&mut self.tiers);
        let mut new_tiers = filter_trackers(announce_list, config);

        for new_tier in &mut new_tiers {
            let best_match = old_tiers.iter().max_by_key(|old_tier| {
                new_tier.trackers.iter().filter(|nt| old_tier.trackers.iter().any(|ot| ot.key == nt.key)).count()
            });
            let Some(old_tier) = best_match.filter(|old_tier| {
                new_tier.trackers.iter().any(|nt| old_tier.trackers.iter().any(|ot| ot.key == nt.key))
            }) else {
                continue;
            };

            for new_tracker in &mut new_tier.trackers {
                let Some(old_tracker) = old_tier.trackers.iter().find(|ot| ot.key == new_tracker.key) else { continue };
                new_tracker.tracker_id = old_tracker.tracker_id.clone();
                new_tracker.seeders = old_tracker.seeders;
                new_tracker.leechers = old_tracker.leechers;
                new_tracker.downloads = old_tracker.downloads;
                new_tracker.downloaders = old_tracker.downloaders;
            }

            new_tier.announce_events = old_tier.announce_events.clone();
            if let Some(old_current) = old_tier.current_tracker() {
                if let Some(idx) = new_tier.trackers.iter().position(|t| t.key == old_current.key) {
                    new_tier.current_index = idx;
                }
            }
        }

        self.tiers = new_tiers;
        if self.is_running {
            for tier in &mut self.tiers {
                tier.is_running = true;
                if tier.announce_events.is_empty() {
                    tier.enqueue_event(AnnounceEvent::Started, now);
                }
            }
        }
    }

    /// Builds the next announce request for `tier_index`, consuming the
    /// front of that tier's event queue (`None` if nothing is queued —
    /// a periodic refresh).
    pub fn build_announce_request(
        &mut self,
        tier_index: usize,
        session: &dyn SessionInfo,
        config: &AnnouncerConfig,
    ) -> AnnounceRequest {
        let tier = &mut self.tiers[tier_index];
        let event = tier.announce_events.pull().unwrap_or(AnnounceEvent::None);
        tier.last_announce_event = Some(event);
        let numwant = if event == AnnounceEvent::Stopped {
            config.numwant_stopped
        } else {
            session.numwant(&self.info_hash).unwrap_or(config.numwant)
        };
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: session.peer_port(),
            uploaded: tier.uploaded,
            downloaded: tier.downloaded,
            left: self.left,
            event,
            numwant,
            key: self.key,
            tracker_id: None,
            partial_seed: session.is_partial_seed(&self.info_hash),
            require_crypto: session.requires_crypto(),
            ipv6: session.announce_ip(),
        }
    }

    /// Builds a final `stopped` announce for `tier_index` without
    /// consuming its event queue, for a torrent that's being removed
    /// outright rather than merely pausing.
    pub fn build_stopped_request(&self, tier_index: usize, session: &dyn SessionInfo, config: &AnnouncerConfig) -> AnnounceRequest {
        let tier = &self.tiers[tier_index];
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: session.peer_port(),
            uploaded: tier.uploaded,
            downloaded: tier.downloaded,
            left: self.left,
            event: AnnounceEvent::Stopped,
            numwant: config.numwant_stopped,
            key: self.key,
            tracker_id: tier.current_tracker().and_then(|t| t.tracker_id.clone()),
            partial_seed: session.is_partial_seed(&self.info_hash),
            require_crypto: session.requires_crypto(),
            ipv6: session.announce_ip(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSession;
    impl SessionInfo for NullSession {
        fn peer_port(&self) -> u16 {
            6881
        }
    }

    fn entries() -> Vec<RawAnnounceEntry> {
        vec![RawAnnounceEntry { url: "https://tracker.example/announce".into(), tier: 0 }]
    }

    fn new_torrent() -> TorrentAnnouncer {
        TorrentAnnouncer::new([1; 20], &entries(), 100, &AnnouncerConfig::default(), &NullSession)
    }

    #[test]
    fn start_queues_started_on_every_tier() {
        let mut torrent = new_torrent();
        torrent.start(Instant::now());
        assert_eq!(torrent.tiers[0].announce_events.front(), Some(AnnounceEvent::Started));
    }

    #[test]
    fn add_bytes_accumulates_on_every_tier() {
        let mut torrent = new_torrent();
        torrent.add_bytes(10, 20, 1);
        torrent.add_bytes(5, 0, 0);
        assert_eq!(torrent.tiers[0].uploaded, 15);
        assert_eq!(torrent.tiers[0].downloaded, 20);
        assert_eq!(torrent.tiers[0].corrupt, 1);
    }

    #[test]
    fn manual_announce_forces_a_none_event_when_queue_is_empty() {
        let mut torrent = new_torrent();
        let now = Instant::now();
        torrent.manual_announce(now).unwrap();
        assert_eq!(torrent.tiers[0].announce_events.front(), Some(AnnounceEvent::None));
        assert_eq!(torrent.tiers[0].announce_at, Some(now));
    }

    #[test]
    fn reset_carries_forward_tracker_id_and_counts_for_a_surviving_tracker() {
        let mut torrent = new_torrent();
        torrent.start(Instant::now());
        torrent.tiers[0].trackers[0].tracker_id = Some("abc123".into());
        torrent.tiers[0].trackers[0].seeders = Some(7);
        torrent.tiers[0].announce_events.pull();

        torrent.reset(&entries(), Instant::now(), &AnnouncerConfig::default());

        assert_eq!(torrent.tiers[0].trackers[0].tracker_id.as_deref(), Some("abc123"));
        assert_eq!(torrent.tiers[0].trackers[0].seeders, Some(7));
    }

    #[test]
    fn reset_re_announces_started_when_running_and_queue_is_empty() {
        let mut torrent = new_torrent();
        torrent.start(Instant::now());
        torrent.tiers[0].announce_events.pull();
        assert!(torrent.tiers[0].announce_events.is_empty());

        torrent.reset(&entries(), Instant::now(), &AnnouncerConfig::default());

        assert_eq!(torrent.tiers[0].announce_events.front(), Some(AnnounceEvent::Started));
    }
}
