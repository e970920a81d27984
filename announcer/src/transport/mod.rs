pub mod http;
pub mod udp;

use url::Url;

use crate::config::AnnouncerConfig;
use crate::error::{AnnouncerError, Result};
use crate::request::{AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse};
use crate::tier::AnnounceKey;

pub use self::http::HttpTransport;
pub use self::udp::UdpTransport;

/// Dispatches announce/scrape calls to whichever concrete transport a
/// tracker's URL scheme selects. `http`/`https` trackers share one
/// `reqwest::Client`; `udp` trackers share one socket and its connection
/// cache.
pub struct Transports {
    http: HttpTransport,
    udp: UdpTransport,
}

impl Transports {
    pub async fn new() -> Result<Self> {
        Ok(Self { http: HttpTransport::new(), udp: UdpTransport::bind().await? })
    }

    pub async fn announce(
        &self,
        key: &AnnounceKey,
        url: &Url,
        req: &AnnounceRequest,
        config: &AnnouncerConfig,
    ) -> Result<AnnounceResponse> {
        match url.scheme() {
            "http" | "https" => self.http.announce(url, req, config).await,
            "udp" => {
                let host = url.host_str().ok_or_else(|| AnnouncerError::InvalidUrl(url.to_string()))?;
                let port = url.port_or_known_default().unwrap_or(80);
                self.udp.announce(key, host, port, req, config).await
            }
            other => Err(AnnouncerError::UnsupportedScheme(other.to_string())),
        }
    }

    pub async fn scrape(
        &self,
        key: &AnnounceKey,
        url: &Url,
        req: &ScrapeRequest,
        config: &AnnouncerConfig,
    ) -> Result<ScrapeResponse> {
        match url.scheme() {
            "http" | "https" => self.http.scrape(url, req, config).await,
            "udp" => {
                let host = url.host_str().ok_or_else(|| AnnouncerError::InvalidUrl(url.to_string()))?;
                let port = url.port_or_known_default().unwrap_or(80);
                self.udp.scrape(key, host, port, req, config).await
            }
            other => Err(AnnouncerError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn udp_is_idle(&self) -> bool {
        self.udp.is_idle()
    }

    /// Shortens every UDP request's timeout so shutdown isn't held up
    /// waiting out a dead tracker's full `request_timeout`.
    pub fn start_shutdown(&self, udp_shutdown_grace: std::time::Duration) {
        self.udp.start_shutdown(udp_shutdown_grace);
    }
}
