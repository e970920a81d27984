use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::config::AnnouncerConfig;
use crate::error::{AnnouncerError, Result};
use crate::peers::decode_compact_ipv4_prefix;
use crate::request::{AnnounceRequest, AnnounceResponse, ScrapeFileEntry, ScrapeRequest, ScrapeResponse};
use crate::tier::AnnounceKey;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Per-tracker connection state: the resolved address and the `connection_id`
/// handed out by CONNECT, each with its own expiry. Guarded by its own async
/// mutex so at most one CONNECT is ever in flight per tracker, while
/// subsequent announces/scrapes that reuse an already-valid connection id
/// run concurrently.
#[derive(Default)]
struct EndpointState {
    address: Option<SocketAddr>,
    address_expires_at: Option<Instant>,
    connection_id: Option<u64>,
    connection_expires_at: Option<Instant>,
}

/// UDP tracker transport (BEP-15). One socket serves every tracker: the
/// background receive loop demultiplexes inbound datagrams by transaction
/// id and hands the raw bytes to whichever in-flight request is waiting on
/// them.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    endpoints: StdMutex<HashMap<AnnounceKey, Arc<AsyncMutex<EndpointState>>>>,
    pending: Arc<StdMutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>,
    recv_task: tokio::task::JoinHandle<()>,
    /// Once shutdown starts, no request's timeout is allowed to run past
    /// this instant, so a dead tracker can't hold the shutdown deadline
    /// hostage for the full `request_timeout`.
    close_at: StdMutex<Option<Instant>>,
}

impl UdpTransport {
    pub async fn bind() -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let pending: Arc<StdMutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>> = Arc::new(StdMutex::new(HashMap::new()));

        let recv_socket = socket.clone();
        let recv_pending = pending.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if n < 8 {
                            tracing::debug!(n, %from, "dropping undersized udp datagram");
                            continue;
                        }
                        let mut header = &buf[..8];
                        let _action = header.get_u32();
                        let transaction_id = header.get_u32();
                        let sender = recv_pending.lock().unwrap().remove(&transaction_id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(buf[..n].to_vec());
                            }
                            None => tracing::trace!(transaction_id, %from, "unmatched udp datagram"),
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "udp socket recv failed, receive loop exiting");
                        break;
                    }
                }
            }
        });

        Ok(Self { socket, endpoints: StdMutex::new(HashMap::new()), pending, recv_task, close_at: StdMutex::new(None) })
    }

    /// Whether every in-flight request this transport issued has resolved.
    /// Used by shutdown to decide whether it can stop waiting early.
    pub fn is_idle(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    /// Caps every in-flight and future request's timeout so none of them
    /// runs past `grace` from now, regardless of `request_timeout`.
    pub fn start_shutdown(&self, grace: Duration) {
        *self.close_at.lock().unwrap() = Some(Instant::now() + grace);
    }

    /// Shortens `requested` to whatever's left before `close_at`, once
    /// shutdown has started. A request issued after `close_at` has
    /// already passed gets a zero timeout, which fails immediately rather
    /// than ever touching the network.
    fn bounded_timeout(&self, requested: Duration) -> Duration {
        match *self.close_at.lock().unwrap() {
            Some(close_at) => requested.min(close_at.saturating_duration_since(Instant::now())),
            None => requested,
        }
    }

    fn endpoint_for(&self, key: &AnnounceKey) -> Arc<AsyncMutex<EndpointState>> {
        self.endpoints
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(EndpointState::default())))
            .clone()
    }

    async fn request_response(
        &self,
        address: SocketAddr,
        transaction_id: u32,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(transaction_id, tx);
        let send_result = self.socket.send_to(buf, address).await;
        if let Err(err) = send_result {
            self.pending.lock().unwrap().remove(&transaction_id);
            return Err(err.into());
        }
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().unwrap().remove(&transaction_id);
        match outcome {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(AnnouncerError::MalformedDatagram("udp receive loop shut down".into())),
            Err(_) => Err(AnnouncerError::Timeout(timeout)),
        }
    }

    /// Resolves `host:port` (cached for `dns_cache_ttl`) and ensures a live
    /// `connection_id` (cached for `connection_id_ttl`, refreshed with a
    /// CONNECT round trip when absent or expired).
    async fn ensure_connected(
        &self,
        key: &AnnounceKey,
        host: &str,
        port: u16,
        config: &AnnouncerConfig,
    ) -> Result<(SocketAddr, u64)> {
        let endpoint = self.endpoint_for(key);
        let mut state = endpoint.lock().await;
        let now = Instant::now();

        if matches!(state.address_expires_at, Some(expires) if now >= expires) {
            state.address = None;
        }
        if state.address.is_none() {
            let mut addrs = tokio::net::lookup_host((host, port)).await?;
            let address = addrs
                .next()
                .ok_or_else(|| AnnouncerError::InvalidUrl(format!("could not resolve udp tracker host {host}")))?;
            state.address = Some(address);
            state.address_expires_at = Some(now + config.dns_cache_ttl);
        }
        let address = state.address.expect("just populated");

        let need_connect = state.connection_id.is_none()
            || matches!(state.connection_expires_at, Some(expires) if now >= expires);
        if need_connect {
            let transaction_id: u32 = rand::random();
            let mut buf = BytesMut::with_capacity(16);
            buf.put_u64(PROTOCOL_ID);
            buf.put_u32(ACTION_CONNECT);
            buf.put_u32(transaction_id);

            let raw = self.request_response(address, transaction_id, &buf, self.bounded_timeout(config.request_timeout)).await?;
            let mut body = &raw[..];
            if body.remaining() < 16 {
                return Err(AnnouncerError::MalformedDatagram("connect response shorter than 16 bytes".into()));
            }
            let action = body.get_u32();
            let txn = body.get_u32();
            if txn != transaction_id {
                return Err(AnnouncerError::MalformedDatagram("connect response transaction id mismatch".into()));
            }
            if action == ACTION_ERROR {
                let message = String::from_utf8_lossy(body.chunk()).into_owned();
                return Err(AnnouncerError::ResponseError(message));
            }
            if action != ACTION_CONNECT {
                return Err(AnnouncerError::MalformedDatagram(format!("unexpected action {action} replying to connect")));
            }
            let connection_id = body.get_u64();
            state.connection_id = Some(connection_id);
            state.connection_expires_at = Some(Instant::now() + config.connection_id_ttl);
        }

        Ok((address, state.connection_id.expect("just populated")))
    }

    pub async fn announce(
        &self,
        key: &AnnounceKey,
        host: &str,
        port: u16,
        req: &AnnounceRequest,
        config: &AnnouncerConfig,
    ) -> Result<AnnounceResponse> {
        let (address, connection_id) = match self.ensure_connected(key, host, port, config).await {
            Ok(v) => v,
            Err(AnnouncerError::Timeout(_)) => {
                return Ok(AnnounceResponse { did_connect: false, did_timeout: true, ..Default::default() })
            }
            Err(e) => return Err(e),
        };

        let transaction_id: u32 = rand::random();
        let mut buf = BytesMut::with_capacity(98);
        buf.put_u64(connection_id);
        buf.put_u32(ACTION_ANNOUNCE);
        buf.put_u32(transaction_id);
        buf.put_slice(&req.info_hash);
        buf.put_slice(&req.peer_id);
        buf.put_u64(req.downloaded);
        buf.put_u64(req.left);
        buf.put_u64(req.uploaded);
        buf.put_u32(req.event.as_udp_code());
        buf.put_u32(0); // ip: 0 = let the tracker use the packet's source address
        buf.put_u32(req.key);
        buf.put_i32(req.numwant as i32);
        buf.put_u16(req.port);

        let raw = match self.request_response(address, transaction_id, &buf, self.bounded_timeout(config.request_timeout)).await {
            Ok(raw) => raw,
            Err(AnnouncerError::Timeout(_)) => {
                return Ok(AnnounceResponse { did_connect: true, did_timeout: true, ..Default::default() })
            }
            Err(e) => return Err(e),
        };
        parse_announce_response(&raw, transaction_id)
    }

    pub async fn scrape(
        &self,
        key: &AnnounceKey,
        host: &str,
        port: u16,
        req: &ScrapeRequest,
        config: &AnnouncerConfig,
    ) -> Result<ScrapeResponse> {
        let (address, connection_id) = match self.ensure_connected(key, host, port, config).await {
            Ok(v) => v,
            Err(AnnouncerError::Timeout(_)) => {
                return Ok(ScrapeResponse { did_connect: false, did_timeout: true, ..Default::default() })
            }
            Err(e) => return Err(e),
        };

        let transaction_id: u32 = rand::random();
        let mut buf = BytesMut::with_capacity(16 + req.info_hashes.len() * 20);
        buf.put_u64(connection_id);
        buf.put_u32(ACTION_SCRAPE);
        buf.put_u32(transaction_id);
        for hash in &req.info_hashes {
            buf.put_slice(hash);
        }

        let raw = match self.request_response(address, transaction_id, &buf, self.bounded_timeout(config.request_timeout)).await {
            Ok(raw) => raw,
            Err(AnnouncerError::Timeout(_)) => {
                return Ok(ScrapeResponse { did_connect: true, did_timeout: true, ..Default::default() })
            }
            Err(e) => return Err(e),
        };
        parse_scrape_response(&raw, transaction_id, &req.info_hashes)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

fn parse_announce_response(raw: &[u8], expected_transaction_id: u32) -> Result<AnnounceResponse> {
    let mut body = &raw[..];
    if body.remaining() < 8 {
        return Err(AnnouncerError::MalformedDatagram("announce response shorter than 8 bytes".into()));
    }
    let action = body.get_u32();
    let txn = body.get_u32();
    if txn != expected_transaction_id {
        return Err(AnnouncerError::MalformedDatagram("announce response transaction id mismatch".into()));
    }

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(body.chunk()).into_owned();
        return Ok(AnnounceResponse {
            failure_reason: Some(message),
            did_connect: true,
            did_timeout: false,
            ..Default::default()
        });
    }
    if action != ACTION_ANNOUNCE {
        return Err(AnnouncerError::MalformedDatagram(format!("unexpected action {action} replying to announce")));
    }
    if body.remaining() < 12 {
        return Err(AnnouncerError::MalformedDatagram("announce response missing interval/leechers/seeders".into()));
    }
    let interval = body.get_u32();
    let leechers = body.get_u32();
    let seeders = body.get_u32();
    let peers = decode_compact_ipv4_prefix(body.chunk());

    Ok(AnnounceResponse {
        interval: Some(interval as u64),
        leechers: Some(leechers),
        seeders: Some(seeders),
        peers_v4: peers,
        did_connect: true,
        did_timeout: false,
        ..Default::default()
    })
}

fn parse_scrape_response(raw: &[u8], expected_transaction_id: u32, info_hashes: &[[u8; 20]]) -> Result<ScrapeResponse> {
    let mut body = &raw[..];
    if body.remaining() < 8 {
        return Err(AnnouncerError::MalformedDatagram("scrape response shorter than 8 bytes".into()));
    }
    let action = body.get_u32();
    let txn = body.get_u32();
    if txn != expected_transaction_id {
        return Err(AnnouncerError::MalformedDatagram("scrape response transaction id mismatch".into()));
    }

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(body.chunk()).into_owned();
        return Ok(ScrapeResponse { did_connect: true, did_timeout: false, errmsg: Some(message), ..Default::default() });
    }
    if action != ACTION_SCRAPE {
        return Err(AnnouncerError::MalformedDatagram(format!("unexpected action {action} replying to scrape")));
    }

    let mut files = HashMap::new();
    for hash in info_hashes {
        if body.remaining() < 12 {
            break;
        }
        let complete = body.get_u32();
        let downloaded = body.get_u32();
        let incomplete = body.get_u32();
        files.insert(
            *hash,
            ScrapeFileEntry {
                complete: Some(complete),
                incomplete: Some(incomplete),
                downloaded: Some(downloaded),
                downloaders: None,
            },
        );
    }

    Ok(ScrapeResponse { files, did_connect: true, did_timeout: false, ..Default::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as RawUdpSocket;

    fn info_hash(byte: u8) -> [u8; 20] {
        [byte; 20]
    }

    #[test]
    fn announce_response_parses_interval_and_peers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        raw.extend_from_slice(&42u32.to_be_bytes());
        raw.extend_from_slice(&1800u32.to_be_bytes());
        raw.extend_from_slice(&3u32.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE1]);

        let response = parse_announce_response(&raw, 42).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.leechers, Some(3));
        assert_eq!(response.seeders, Some(7));
        assert_eq!(response.peers_v4.len(), 1);
        assert_eq!(response.peers_v4[0].port(), 0x1AE1);
    }

    #[test]
    fn announce_response_transaction_mismatch_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        raw.extend_from_slice(&99u32.to_be_bytes());
        raw.extend_from_slice(&[0u8; 12]);
        assert!(parse_announce_response(&raw, 42).is_err());
    }

    #[test]
    fn announce_error_action_becomes_failure_reason() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(b"torrent not registered");
        let response = parse_announce_response(&raw, 7).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("torrent not registered"));
    }

    #[test]
    fn scrape_response_maps_records_back_to_info_hashes_in_order() {
        let hashes = [info_hash(1), info_hash(2)];
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        raw.extend_from_slice(&5u32.to_be_bytes());
        raw.extend_from_slice(&10u32.to_be_bytes()); // complete
        raw.extend_from_slice(&100u32.to_be_bytes()); // downloaded
        raw.extend_from_slice(&2u32.to_be_bytes()); // incomplete
        raw.extend_from_slice(&20u32.to_be_bytes());
        raw.extend_from_slice(&200u32.to_be_bytes());
        raw.extend_from_slice(&4u32.to_be_bytes());

        let response = parse_scrape_response(&raw, 5, &hashes).unwrap();
        let first = response.files.get(&hashes[0]).unwrap();
        assert_eq!(first.complete, Some(10));
        assert_eq!(first.downloaded, Some(100));
        assert_eq!(first.incomplete, Some(2));
        let second = response.files.get(&hashes[1]).unwrap();
        assert_eq!(second.complete, Some(20));
    }

    #[test]
    fn scrape_response_stops_at_truncated_tail_without_erroring() {
        let hashes = [info_hash(1), info_hash(2)];
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        raw.extend_from_slice(&5u32.to_be_bytes());
        raw.extend_from_slice(&[0u8; 12]); // only one record present

        let response = parse_scrape_response(&raw, 5, &hashes).unwrap();
        assert_eq!(response.files.len(), 1);
    }

    #[tokio::test]
    async fn start_shutdown_shortens_a_longer_configured_timeout() {
        let transport = UdpTransport::bind().await.unwrap();
        transport.start_shutdown(Duration::from_millis(50));
        let bounded = transport.bounded_timeout(Duration::from_secs(60));
        assert!(bounded <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn a_request_issued_past_close_at_gets_a_zero_timeout() {
        let transport = UdpTransport::bind().await.unwrap();
        transport.start_shutdown(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.bounded_timeout(Duration::from_secs(60)), Duration::ZERO);
    }

    #[tokio::test]
    async fn connect_announce_and_scrape_round_trip_against_a_fake_tracker() {
        let transport = UdpTransport::bind().await.unwrap();
        let fake = RawUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        let config = AnnouncerConfig::default();
        let key = AnnounceKey::from_url(&url::Url::parse(&format!("udp://127.0.0.1:{}", fake_addr.port())).unwrap());

        let fake_task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            // CONNECT
            let (n, from) = fake.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[..n];
            let _protocol_id = req.get_u64();
            let _action = req.get_u32();
            let transaction_id = req.get_u32();
            let mut resp = BytesMut::new();
            resp.put_u32(ACTION_CONNECT);
            resp.put_u32(transaction_id);
            resp.put_u64(0xABCD);
            fake.send_to(&resp, from).await.unwrap();

            // ANNOUNCE
            let (n, from) = fake.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[..n];
            let _connection_id = req.get_u64();
            let _action = req.get_u32();
            let transaction_id = req.get_u32();
            let mut resp = BytesMut::new();
            resp.put_u32(ACTION_ANNOUNCE);
            resp.put_u32(transaction_id);
            resp.put_u32(900);
            resp.put_u32(0);
            resp.put_u32(1);
            fake.send_to(&resp, from).await.unwrap();
        });

        let req = AnnounceRequest {
            info_hash: info_hash(9),
            peer_id: [b'x'; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: crate::event::AnnounceEvent::Started,
            numwant: 50,
            key: 0x1234,
            tracker_id: None,
            partial_seed: false,
            require_crypto: false,
            ipv6: None,
        };
        let response = transport.announce(&key, "127.0.0.1", fake_addr.port(), &req, &config).await.unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.seeders, Some(1));
        fake_task.await.unwrap();
    }
}
