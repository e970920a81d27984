use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AnnouncerError, Result};

/// Encodes a compact IPv4 peer list: 6-byte records of `(addr4, port)`,
/// network byte order.
pub fn encode_compact_ipv4(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(peers.len() * 6);
    for peer in peers {
        buf.put_slice(&peer.ip().octets());
        buf.put_u16(peer.port());
    }
    buf.to_vec()
}

/// Decodes a compact IPv4 peer list produced by [`encode_compact_ipv4`].
pub fn decode_compact_ipv4(mut bytes: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if bytes.len() % 6 != 0 {
        return Err(AnnouncerError::MalformedDatagram(
            "compact ipv4 peer list not a multiple of 6 bytes".into(),
        ));
    }
    let mut peers = Vec::with_capacity(bytes.len() / 6);
    while bytes.has_remaining() {
        let ip = Ipv4Addr::from(bytes.get_u32());
        let port = bytes.get_u16();
        peers.push(SocketAddrV4::new(ip, port));
    }
    Ok(peers)
}

/// Encodes a compact IPv6 peer list: 18-byte records of `(addr6, port)`.
pub fn encode_compact_ipv6(peers: &[SocketAddrV6]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(peers.len() * 18);
    for peer in peers {
        buf.put_slice(&peer.ip().octets());
        buf.put_u16(peer.port());
    }
    buf.to_vec()
}

pub fn decode_compact_ipv6(mut bytes: &[u8]) -> Result<Vec<SocketAddrV6>> {
    if bytes.len() % 18 != 0 {
        return Err(AnnouncerError::MalformedDatagram(
            "compact ipv6 peer list not a multiple of 18 bytes".into(),
        ));
    }
    let mut peers = Vec::with_capacity(bytes.len() / 18);
    while bytes.has_remaining() {
        let mut octets = [0u8; 16];
        bytes.copy_to_slice(&mut octets);
        let port = bytes.get_u16();
        peers.push(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0));
    }
    Ok(peers)
}

/// Like [`decode_compact_ipv4`], but silently drops a trailing partial
/// record instead of erroring — used for UDP announce/scrape responses,
/// which are not guaranteed to end on a record boundary.
pub fn decode_compact_ipv4_prefix(bytes: &[u8]) -> Vec<SocketAddrV4> {
    let whole = bytes.len() - (bytes.len() % 6);
    decode_compact_ipv4(&bytes[..whole]).unwrap_or_default()
}
