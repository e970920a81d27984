use std::collections::HashMap;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use serde::{de, Deserialize};
use url::Url;

use crate::config::AnnouncerConfig;
use crate::error::{AnnouncerError, Result};
use crate::request::{AnnounceRequest, AnnounceResponse, ScrapeFileEntry, ScrapeRequest, ScrapeResponse};

/// HTTP(S) tracker transport: builds announce/scrape URLs, issues a GET
/// through `reqwest`, and decodes the bencoded body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub async fn announce(
        &self,
        announce_url: &Url,
        req: &AnnounceRequest,
        config: &AnnouncerConfig,
    ) -> Result<AnnounceResponse> {
        let url = build_announce_url(announce_url, req);
        tracing::debug!(%url, "http announce");

        let raw = tokio::time::timeout(config.request_timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| AnnouncerError::Timeout(config.request_timeout))??
            .bytes()
            .await?;

        if config.curl_verbose {
            eprintln!("announce response body ({url}): {}", String::from_utf8_lossy(&raw));
        }

        let wire: HttpAnnounceWire = bencode::decode_bytes(&raw)?;
        tracing::debug!(?wire, "http announce response");
        let mut response = wire.into_response();
        response.did_connect = true;
        response.did_timeout = false;
        Ok(response)
    }

    pub async fn scrape(
        &self,
        scrape_url: &Url,
        req: &ScrapeRequest,
        config: &AnnouncerConfig,
    ) -> Result<ScrapeResponse> {
        let url = build_scrape_url(scrape_url, req);
        tracing::debug!(%url, "http scrape");

        let raw = tokio::time::timeout(config.request_timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| AnnouncerError::Timeout(config.request_timeout))??
            .bytes()
            .await?;

        if config.curl_verbose {
            eprintln!("scrape response body ({url}): {}", String::from_utf8_lossy(&raw));
        }

        // Trackers that choke on a too-long query string respond with a
        // plain-text (non-bencoded) error; check for that before trying
        // to parse the body as bencode.
        if let Some(marker) = scrape_batch_rejected_marker(&raw) {
            return Ok(ScrapeResponse {
                did_connect: true,
                did_timeout: false,
                errmsg: Some(marker.to_string()),
                batch_too_large: true,
                ..Default::default()
            });
        }

        let wire: HttpScrapeWire = bencode::decode_bytes(&raw)?;
        let mut files = HashMap::new();
        for (hash, entry) in wire.files {
            let Ok(hash): std::result::Result<[u8; 20], _> = hash.into_vec().try_into() else {
                continue;
            };
            files.insert(
                hash,
                ScrapeFileEntry {
                    complete: entry.complete,
                    incomplete: entry.incomplete,
                    downloaded: entry.downloaded,
                    downloaders: entry.downloaders,
                },
            );
        }
        Ok(ScrapeResponse {
            files,
            min_request_interval: wire.flags.and_then(|f| f.min_request_interval),
            did_connect: true,
            did_timeout: false,
            errmsg: None,
            batch_too_large: false,
        })
    }
}

/// Substrings a tracker uses to complain the scrape query string is too
/// long.
const SCRAPE_TOO_LONG_MARKERS: &[&str] = &["Bad Request", "GET string too long", "Request-URI Too Long"];

fn scrape_batch_rejected_marker(body: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(body);
    SCRAPE_TOO_LONG_MARKERS.iter().find(|m| text.contains(**m)).copied()
}

fn build_announce_url(announce_url: &Url, req: &AnnounceRequest) -> Url {
    let mut s = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&key={:08X}",
        announce_url.as_str(),
        if announce_url.query().is_some() { "&" } else { "?" },
        urlencoding::encode_binary(&req.info_hash),
        urlencoding::encode_binary(&req.peer_id),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
        req.numwant,
        req.key,
    );
    if let Some(tracker_id) = &req.tracker_id {
        s.push_str(&format!("&tracker_id={}", urlencoding::encode(tracker_id)));
    }
    s.push_str("&compact=1&supportcrypto=1");
    if req.require_crypto {
        s.push_str("&requirecrypto=1");
    }
    if let Some(ipv6) = req.ipv6 {
        s.push_str(&format!("&ipv6={ipv6}"));
    }
    // BEP-21: partial seeds announce as the literal `paused` event unless
    // they're stopping for good.
    let wire_event = if req.partial_seed && req.event != crate::event::AnnounceEvent::Stopped {
        Some("paused")
    } else {
        req.event.as_wire_str()
    };
    if let Some(event) = wire_event {
        s.push_str(&format!("&event={event}"));
    }
    Url::parse(&s).expect("announce url built from a valid base url stays valid")
}

fn build_scrape_url(scrape_url: &Url, req: &ScrapeRequest) -> Url {
    let mut s = scrape_url.as_str().to_string();
    let sep = if scrape_url.query().is_some() { "&" } else { "?" };
    s.push_str(sep);
    let parts: Vec<String> = req
        .info_hashes
        .iter()
        .map(|h| format!("info_hash={}", urlencoding::encode_binary(h)))
        .collect();
    s.push_str(&parts.join("&"));
    Url::parse(&s).expect("scrape url built from a valid base url stays valid")
}

#[derive(Deserialize, Debug, Default)]
struct HttpAnnounceWire {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    downloaded: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_peers_v4")]
    peers: Vec<SocketAddrV4>,
    #[serde(default, deserialize_with = "deserialize_peers_v6")]
    peers6: Vec<SocketAddrV6>,
}

impl HttpAnnounceWire {
    fn into_response(self) -> AnnounceResponse {
        AnnounceResponse {
            failure_reason: self.failure_reason,
            warning_message: self.warning_message,
            interval: self.interval,
            min_interval: self.min_interval,
            tracker_id: self.tracker_id,
            seeders: self.complete,
            leechers: self.incomplete,
            downloads: self.downloaded,
            peers_v4: self.peers,
            peers_v6: self.peers6,
            did_connect: false,
            did_timeout: false,
        }
    }
}

#[derive(Deserialize, Debug)]
struct HttpScrapeWire {
    #[serde(default)]
    files: HashMap<serde_bytes::ByteBuf, HttpScrapeFileWire>,
    flags: Option<HttpScrapeFlagsWire>,
}

#[derive(Deserialize, Debug)]
struct HttpScrapeFileWire {
    complete: Option<u32>,
    incomplete: Option<u32>,
    downloaded: Option<u32>,
    downloaders: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct HttpScrapeFlagsWire {
    min_request_interval: Option<u64>,
}

/// The tracker can return either a compacted byte string or a list of
/// `{ip, port}` dictionaries for `peers`/`peers6`, independent of what the
/// request's `compact` flag asked for. Both forms are parsed the same way
/// for both address families.
fn deserialize_peers_v4<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddrV4>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(PeerVisitor::<SocketAddrV4>::default())
}

fn deserialize_peers_v6<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddrV6>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(PeerVisitor::<SocketAddrV6>::default())
}

struct PeerVisitor<T>(std::marker::PhantomData<T>);

impl<T> Default for PeerVisitor<T> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

#[derive(Deserialize)]
struct PeerDictItem {
    ip: String,
    port: u16,
}

impl<'de> de::Visitor<'de> for PeerVisitor<SocketAddrV4> {
    type Value = Vec<SocketAddrV4>;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a compact byte string or a list of peer dictionaries")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        crate::peers::decode_compact_ipv4(v).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut peers = Vec::new();
        while let Some(item) = seq.next_element::<PeerDictItem>()? {
            if let Ok(IpAddr::V4(ip)) = item.ip.parse() {
                peers.push(SocketAddrV4::new(ip, item.port));
            }
        }
        Ok(peers)
    }
}

impl<'de> de::Visitor<'de> for PeerVisitor<SocketAddrV6> {
    type Value = Vec<SocketAddrV6>;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a compact byte string or a list of peer dictionaries")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        crate::peers::decode_compact_ipv6(v).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut peers = Vec::new();
        while let Some(item) = seq.next_element::<PeerDictItem>()? {
            if let Ok(IpAddr::V6(ip)) = item.ip.parse() {
                peers.push(SocketAddrV6::new(ip, item.port, 0, 0));
            }
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AnnounceEvent;

    #[test]
    fn parses_compact_ipv4_response() {
        // d8:completei9e10:incompletei1e8:intervali1800e12:min intervali1800e5:peers60:...e
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let wire: HttpAnnounceWire = bencode::decode_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(wire.interval, Some(1800));
        assert_eq!(wire.complete, Some(9));
        assert_eq!(wire.incomplete, Some(1));
        assert_eq!(wire.peers.len(), 10);
    }

    #[test]
    fn builds_announce_url_with_every_standard_query_param() {
        let req = AnnounceRequest {
            info_hash: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11, 0x22, 0x33, 0x44],
            peer_id: *b"-TR4050-ABCDEFGHIJKL",
            port: 51413,
            uploaded: 1_048_576,
            downloaded: 2_097_152,
            left: 0,
            event: AnnounceEvent::Completed,
            numwant: 80,
            key: 0xC0FFEE42,
            tracker_id: None,
            partial_seed: false,
            require_crypto: false,
            ipv6: None,
        };
        let base = Url::parse("http://tracker.example/announce").unwrap();
        let url = build_announce_url(&base, &req);
        assert!(url.as_str().ends_with(
            "info_hash=%11%22%33%44%55%66%77%88%99%AA%BB%CC%DD%EE%FF%00%11%22%33%44\
&peer_id=-TR4050-ABCDEFGHIJKL&port=51413&uploaded=1048576&downloaded=2097152&left=0\
&numwant=80&key=C0FFEE42&compact=1&supportcrypto=1&event=completed"
        ));
    }

    #[test]
    fn scrape_too_long_marker_is_detected_before_bencode_parse() {
        assert_eq!(
            scrape_batch_rejected_marker(b"414 Request-URI Too Long"),
            Some("Request-URI Too Long")
        );
        assert_eq!(scrape_batch_rejected_marker(b"d8:completei1ee"), None);
    }
}
