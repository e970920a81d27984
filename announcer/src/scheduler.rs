//! Picks which tiers are due for an announce or scrape on a given upkeep
//! tick, and groups scrape-due tiers into tracker-sized batches. Pure and
//! synchronous so it can be tested without a network or a clock mock.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::AnnouncerConfig;
use crate::event::AnnounceEvent;
use crate::tier::AnnounceKey;

/// Identifies one tier within one torrent, so the scheduler can work over
/// every torrent's tiers without owning them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierRef {
    pub torrent_index: usize,
    pub tier_index: usize,
}

/// The facts the scheduler needs about a candidate tier; built fresh each
/// tick from the live `Tier`.
#[derive(Debug, Clone)]
pub struct TierSnapshot {
    pub tier_ref: TierRef,
    pub needs_announce: bool,
    pub needs_scrape: bool,
    pub announce_priority: Option<AnnounceEvent>,
    pub announce_at: Option<Instant>,
    pub scrape_at: Option<Instant>,
    pub scrape_key: Option<AnnounceKey>,
    pub scrape_url_host: Option<String>,
    /// `downloaders + leechers` reported by the current tracker's last
    /// scrape, each defaulting to `-1` if unknown — how many peers we
    /// might have something to upload to.
    pub upload_appeal: i64,
    /// Whether this tier's torrent has nothing left to download.
    pub torrent_done: bool,
    /// `uploaded + downloaded` across the tier, so a truncated tick still
    /// prioritizes announces that carry the most accurate stats.
    pub byte_total: u64,
}

/// Orders announce-due tiers the way the upkeep loop should service them,
/// mirroring `compareAnnounceTiers`: higher-priority events first (Stopped
/// preempts Completed preempts Started preempts a periodic None refresh),
/// then swarms we might upload to, then swarms we might still download
/// from, then the tiers with the most stats to report, then whichever has
/// been waiting longest, with tier identity as a final tiebreak for a
/// total order.
pub fn rank_announces(mut due: Vec<TierSnapshot>) -> Vec<TierSnapshot> {
    due.sort_by(|a, b| {
        b.announce_priority
            .cmp(&a.announce_priority)
            .then_with(|| b.upload_appeal.cmp(&a.upload_appeal))
            .then_with(|| a.torrent_done.cmp(&b.torrent_done))
            .then_with(|| b.byte_total.cmp(&a.byte_total))
            .then_with(|| a.announce_at.cmp(&b.announce_at))
            .then_with(|| (a.tier_ref.torrent_index, a.tier_ref.tier_index).cmp(&(b.tier_ref.torrent_index, b.tier_ref.tier_index)))
    });
    due
}

/// Takes the top `max` ranked announces for this tick, logging how many
/// were deferred so starvation under heavy torrent counts is visible.
pub fn select_announces(candidates: &[TierSnapshot], config: &AnnouncerConfig) -> Vec<TierRef> {
    let due: Vec<TierSnapshot> = candidates.iter().filter(|c| c.needs_announce).cloned().collect();
    let ranked = rank_announces(due);
    let take = config.max_announces_per_upkeep.min(ranked.len());
    if ranked.len() > take {
        tracing::debug!(deferred = ranked.len() - take, "more tiers are due to announce than this tick's budget");
    }
    ranked.iter().take(take).map(|s| s.tier_ref).collect()
}

/// One scrape batch: all info-hash-bearing requests that will be sent
/// together to the same tracker URL, each tagged with which tier asked
/// for it.
#[derive(Debug, Clone)]
pub struct ScrapeBatch {
    pub scrape_key: AnnounceKey,
    pub members: Vec<TierRef>,
}

/// Groups scrape-due tiers by tracker host so requests that can share one
/// multiscrape round trip do, then caps each batch at that tracker's
/// current `multiscrape_max` (see `caps`; trackers that have rejected a
/// batch as too large get a lower cap than `multiscrape_max_default`
/// going forward) and the overall tick at `max_scrapes_per_upkeep`
/// *tiers* serviced (not batches — a 60-wide batch still counts as up to
/// 60 tiers against the budget).
pub fn select_scrapes(
    candidates: &[TierSnapshot],
    config: &AnnouncerConfig,
    caps: &HashMap<AnnounceKey, usize>,
) -> Vec<ScrapeBatch> {
    let mut due: Vec<&TierSnapshot> = candidates.iter().filter(|c| c.needs_scrape).collect();
    due.sort_by_key(|c| c.scrape_at);

    let mut grouped: HashMap<AnnounceKey, Vec<TierRef>> = HashMap::new();
    let mut order: Vec<AnnounceKey> = Vec::new();
    let mut serviced = 0usize;
    for snapshot in due {
        if serviced >= config.max_scrapes_per_upkeep {
            break;
        }
        let Some(key) = snapshot.scrape_key.clone() else { continue };
        let cap = caps.get(&key).copied().unwrap_or(config.multiscrape_max_default);
        let bucket = grouped.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        if bucket.len() >= cap {
            continue;
        }
        bucket.push(snapshot.tier_ref);
        serviced += 1;
    }

    order
        .into_iter()
        .map(|key| {
            let members = grouped.remove(&key).unwrap_or_default();
            ScrapeBatch { scrape_key: key, members }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(torrent_index: usize, priority: AnnounceEvent, announce_at: Instant) -> TierSnapshot {
        TierSnapshot {
            tier_ref: TierRef { torrent_index, tier_index: 0 },
            needs_announce: true,
            needs_scrape: false,
            announce_priority: Some(priority),
            announce_at: Some(announce_at),
            scrape_at: None,
            scrape_key: None,
            scrape_url_host: None,
            upload_appeal: -2,
            torrent_done: false,
            byte_total: 0,
        }
    }

    #[test]
    fn stopped_outranks_started_regardless_of_wait_time() {
        let now = Instant::now();
        let candidates = vec![
            snapshot(0, AnnounceEvent::Started, now),
            snapshot(1, AnnounceEvent::Stopped, now + Duration::from_secs(5)),
        ];
        let ranked = rank_announces(candidates);
        assert_eq!(ranked[0].tier_ref.torrent_index, 1);
    }

    #[test]
    fn ties_break_by_longest_waiting_first() {
        let now = Instant::now();
        let candidates = vec![
            snapshot(0, AnnounceEvent::None, now + Duration::from_secs(10)),
            snapshot(1, AnnounceEvent::None, now),
        ];
        let ranked = rank_announces(candidates);
        assert_eq!(ranked[0].tier_ref.torrent_index, 1);
    }

    #[test]
    fn more_upload_appeal_outranks_an_earlier_wait_at_equal_priority() {
        let now = Instant::now();
        let mut low_appeal = snapshot(0, AnnounceEvent::None, now);
        low_appeal.upload_appeal = -2;
        let mut high_appeal = snapshot(1, AnnounceEvent::None, now + Duration::from_secs(10));
        high_appeal.upload_appeal = 40;
        let ranked = rank_announces(vec![low_appeal, high_appeal]);
        assert_eq!(ranked[0].tier_ref.torrent_index, 1);
    }

    #[test]
    fn an_unfinished_torrent_outranks_a_done_one_at_equal_appeal() {
        let now = Instant::now();
        let mut done = snapshot(0, AnnounceEvent::None, now);
        done.torrent_done = true;
        let not_done = snapshot(1, AnnounceEvent::None, now);
        let ranked = rank_announces(vec![done, not_done]);
        assert_eq!(ranked[0].tier_ref.torrent_index, 1);
    }

    #[test]
    fn larger_byte_totals_outrank_smaller_ones_at_equal_appeal_and_done_state() {
        let now = Instant::now();
        let mut small = snapshot(0, AnnounceEvent::None, now);
        small.byte_total = 10;
        let mut large = snapshot(1, AnnounceEvent::None, now);
        large.byte_total = 1_000_000;
        let ranked = rank_announces(vec![small, large]);
        assert_eq!(ranked[0].tier_ref.torrent_index, 1);
    }

    #[test]
    fn select_announces_respects_per_tick_budget() {
        let now = Instant::now();
        let candidates: Vec<TierSnapshot> = (0..5).map(|i| snapshot(i, AnnounceEvent::None, now)).collect();
        let mut config = AnnouncerConfig::default();
        config.max_announces_per_upkeep = 2;
        let selected = select_announces(&candidates, &config);
        assert_eq!(selected.len(), 2);
    }

    fn scrape_snapshot(torrent_index: usize, key: &str, scrape_at: Instant) -> TierSnapshot {
        TierSnapshot {
            tier_ref: TierRef { torrent_index, tier_index: 0 },
            needs_announce: false,
            needs_scrape: true,
            announce_priority: None,
            announce_at: None,
            scrape_at: Some(scrape_at),
            scrape_key: Some(AnnounceKey::from_url(&url::Url::parse(key).unwrap())),
            scrape_url_host: None,
            upload_appeal: -2,
            torrent_done: false,
            byte_total: 0,
        }
    }

    #[test]
    fn scrapes_to_the_same_tracker_are_batched_together() {
        let now = Instant::now();
        let candidates = vec![
            scrape_snapshot(0, "udp://tracker.example:80", now),
            scrape_snapshot(1, "udp://tracker.example:80", now),
            scrape_snapshot(2, "udp://other.example:80", now),
        ];
        let config = AnnouncerConfig::default();
        let batches = select_scrapes(&candidates, &config, &HashMap::new());
        assert_eq!(batches.len(), 2);
        let same_tracker_batch = batches.iter().find(|b| b.members.len() == 2).unwrap();
        assert_eq!(same_tracker_batch.members.len(), 2);
    }

    #[test]
    fn multiscrape_batches_cap_at_the_configured_max() {
        let now = Instant::now();
        let candidates: Vec<TierSnapshot> =
            (0..5).map(|i| scrape_snapshot(i, "udp://tracker.example:80", now)).collect();
        let mut config = AnnouncerConfig::default();
        config.multiscrape_max_default = 2;
        let batches = select_scrapes(&candidates, &config, &HashMap::new());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].members.len(), 2);
    }

    #[test]
    fn a_shrunk_per_url_cap_overrides_the_configured_default() {
        let now = Instant::now();
        let candidates: Vec<TierSnapshot> =
            (0..5).map(|i| scrape_snapshot(i, "udp://tracker.example:80", now)).collect();
        let config = AnnouncerConfig::default();
        let key = AnnounceKey::from_url(&url::Url::parse("udp://tracker.example:80").unwrap());
        let caps = HashMap::from([(key, 3)]);
        let batches = select_scrapes(&candidates, &config, &caps);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].members.len(), 3);
    }
}
