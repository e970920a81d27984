use rand::Rng;

pub const INFO_HASH_LEN: usize = 20;
pub const PEER_ID_LEN: usize = 20;

pub type InfoHash = [u8; INFO_HASH_LEN];
pub type PeerId = [u8; PEER_ID_LEN];

/// The literal client signature embedded in every peer id
/// (`-TRxyzb-` + 12 random alphanumerics). `xyzb` stands in for a version;
/// we keep it fixed since the announcer doesn't track a release version.
const PEER_ID_PREFIX: &[u8; 8] = b"-TR4050-";
const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generates a fresh per-torrent peer id: the fixed client prefix followed
/// by 12 random alphanumeric characters.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; PEER_ID_LEN];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for slot in &mut id[8..] {
        *slot = ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())];
    }
    id
}

/// Per-torrent 32-bit `key=` identifier, generated once and
/// reused for the torrent's lifetime.
pub fn generate_key() -> u32 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_fixed_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert!(id[8..].iter().all(|b| ALPHANUMERIC.contains(b)));
    }

    #[test]
    fn peer_ids_are_not_trivially_repeated() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_ne!(a, b, "two successive peer ids collided, RNG looks broken");
    }
}
