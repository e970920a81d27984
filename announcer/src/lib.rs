pub mod announcer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ids;
pub mod mediator;
pub mod peers;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod tier;
pub mod torrent;
pub mod transport;

pub use announcer::Announcer;
pub use config::AnnouncerConfig;
pub use error::{AnnouncerError, Result};
pub use event::AnnounceEvent;
pub use ids::{InfoHash, PeerId};
pub use mediator::{PeerPublisher, SessionInfo, StatsPublisher};
pub use tier::RawAnnounceEntry;
pub use torrent::TorrentAnnouncer;
