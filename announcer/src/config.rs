use std::time::Duration;

/// Tunables for the announcer. Defaults mirror the intervals real trackers
/// expect (announce 10 min, min-interval 2 min, scrape 30 min, etc.) so a
/// session only needs to override what it actually cares about.
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub announce_interval: Duration,
    pub announce_min_interval: Duration,
    pub scrape_interval: Duration,

    /// `numwant` sent on a non-stopped announce.
    pub numwant: u32,
    /// `numwant` sent on an `event=stopped` announce. Always 0.
    pub numwant_stopped: u32,

    pub max_announces_per_upkeep: usize,
    pub max_scrapes_per_upkeep: usize,
    pub multiscrape_max_default: usize,

    /// How long we wait for a response before treating a request as timed out.
    pub request_timeout: Duration,
    /// How long a UDP `connection_id` remains valid after CONNECT.
    pub connection_id_ttl: Duration,
    /// How long a resolved UDP tracker address is cached.
    pub dns_cache_ttl: Duration,

    /// Tick period of the upkeep loop.
    pub upkeep_interval: Duration,
    /// Wall-clock deadline for flushing `event=stopped` announces on shutdown.
    pub shutdown_deadline: Duration,
    /// Grace period given to in-flight UDP requests once shutdown starts.
    pub udp_shutdown_grace: Duration,

    /// Dump raw announce/scrape bodies to stderr; mirrors `TR_CURL_VERBOSE`.
    pub curl_verbose: bool,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(10 * 60),
            announce_min_interval: Duration::from_secs(2 * 60),
            scrape_interval: Duration::from_secs(30 * 60),
            numwant: 80,
            numwant_stopped: 0,
            max_announces_per_upkeep: 20,
            max_scrapes_per_upkeep: 20,
            multiscrape_max_default: 60,
            request_timeout: Duration::from_secs(60),
            connection_id_ttl: Duration::from_secs(60),
            dns_cache_ttl: Duration::from_secs(60 * 60),
            upkeep_interval: Duration::from_secs(1),
            shutdown_deadline: Duration::from_secs(10),
            udp_shutdown_grace: Duration::from_secs(3),
            curl_verbose: false,
        }
    }
}

impl AnnouncerConfig {
    /// Picks up `TR_CURL_VERBOSE` from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.curl_verbose = std::env::var("TR_CURL_VERBOSE").is_ok();
        config
    }
}
