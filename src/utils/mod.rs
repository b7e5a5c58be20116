pub mod env;
pub mod multipart;
pub mod sse;

#[doc(hidden)]
pub mod test_support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static RANDOM_FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// OS randomness, falling back to a clock/sequence hash when the source is unavailable.
pub(crate) fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_ok() {
        return u64::from_le_bytes(bytes);
    }
    let ts_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let seq = RANDOM_FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
    hash64_fnv1a(format!("{ts_ns}:{seq}").as_bytes())
}

pub(crate) fn random_hex(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    if getrandom::fill(&mut bytes).is_err() {
        for chunk in bytes.chunks_mut(8) {
            let value = random_u64().to_le_bytes();
            chunk.copy_from_slice(&value[..chunk.len()]);
        }
    }
    hex_encode(&bytes)
}

pub(crate) fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(hash64_fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(hash64_fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn random_hex_has_requested_width() {
        let value = random_hex(12);
        assert_eq!(value.len(), 24);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
