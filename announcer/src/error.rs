use std::time::Duration;

pub type Result<T> = std::result::Result<T, AnnouncerError>;

/// Everything that can go wrong while talking to a tracker, or while the
/// announcer itself is misused.
#[derive(Debug, thiserror::Error)]
pub enum AnnouncerError {
    #[error("http request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error decoding bencoded response: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("tracker returned a failure reason: {0}")]
    ResponseError(String),

    #[error("tracker has declared this torrent unregistered: {0}")]
    TorrentUnregistered(String),

    #[error("malformed udp datagram: {0}")]
    MalformedDatagram(String),

    #[error("scrape batch exceeds multiscrape_max")]
    ScrapeBatchTooLarge,
}
