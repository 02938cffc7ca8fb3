//! Transaction IDs: 30-byte values that sort chronologically as raw bytes.
//!
//! Layout: 6 bytes big-endian UTC seconds, 2 bytes fractional ticks
//! (1/65536 s), 22 bytes hash material. The canonical ASCII form is 48
//! characters of the geohash base-32 alphabet; because the alphabet is
//! ASCII-ascending and the encoding is MSB-first, ASCII order equals byte
//! order equals chronological order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::{WireError, WireResult};

pub const TID_BINARY_LEN: usize = 30;
pub const TID_ASCII_LEN: usize = 48;

const HASH_LEN: usize = 22;
const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// A transaction identifier. On the wire it travels as the raw 30 bytes in
/// `val_buf` under `ValType::Tid`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid([u8; TID_BINARY_LEN]);

static TID_SALT: AtomicU64 = AtomicU64::new(0);

impl Tid {
    /// Build a TID for the current wall clock with fresh hash material.
    pub fn now() -> Tid {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let frac = ((elapsed.subsec_nanos() as u64 * 65536) / 1_000_000_000) as u16;

        let salt = TID_SALT.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(elapsed.as_nanos().to_be_bytes());
        hasher.update(salt.to_be_bytes());
        let digest = hasher.finalize();

        Tid::from_parts(elapsed.as_secs(), frac, &digest[..HASH_LEN])
    }

    /// Assemble a TID from its timestamp and up to 22 bytes of hash material.
    pub fn from_parts(utc_secs: u64, frac_ticks: u16, hash: &[u8]) -> Tid {
        let mut bytes = [0u8; TID_BINARY_LEN];
        bytes[0] = (utc_secs >> 40) as u8;
        bytes[1] = (utc_secs >> 32) as u8;
        bytes[2] = (utc_secs >> 24) as u8;
        bytes[3] = (utc_secs >> 16) as u8;
        bytes[4] = (utc_secs >> 8) as u8;
        bytes[5] = utc_secs as u8;
        bytes[6..8].copy_from_slice(&frac_ticks.to_be_bytes());
        let n = hash.len().min(HASH_LEN);
        bytes[8..8 + n].copy_from_slice(&hash[..n]);
        Tid(bytes)
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Tid> {
        let arr: [u8; TID_BINARY_LEN] = buf.try_into().ok()?;
        Some(Tid(arr))
    }

    pub fn as_bytes(&self) -> &[u8; TID_BINARY_LEN] {
        &self.0
    }

    pub fn utc_secs(&self) -> u64 {
        ((self.0[0] as u64) << 40)
            | ((self.0[1] as u64) << 32)
            | ((self.0[2] as u64) << 24)
            | ((self.0[3] as u64) << 16)
            | ((self.0[4] as u64) << 8)
            | (self.0[5] as u64)
    }

    pub fn frac_ticks(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    /// The canonical 48-character base-32 form.
    pub fn encode_ascii(&self) -> String {
        let mut out = String::with_capacity(TID_ASCII_LEN);
        for i in 0..TID_ASCII_LEN {
            let bit = i * 5;
            let byte = bit / 8;
            let shift = bit % 8;
            let mut window = (self.0[byte] as u16) << 8;
            if byte + 1 < TID_BINARY_LEN {
                window |= self.0[byte + 1] as u16;
            }
            let five = ((window >> (11 - shift)) & 0x1F) as usize;
            out.push(ALPHABET[five] as char);
        }
        out
    }

    /// Decode the canonical ASCII form back to the 30-byte value.
    pub fn decode_ascii(text: &str) -> WireResult<Tid> {
        if text.len() != TID_ASCII_LEN {
            return Err(WireError::BadTid(format!(
                "expected {TID_ASCII_LEN} characters, got {}",
                text.len()
            )));
        }
        let mut bytes = [0u8; TID_BINARY_LEN];
        for (i, ch) in text.bytes().enumerate() {
            let five = ALPHABET
                .iter()
                .position(|&a| a == ch)
                .ok_or_else(|| WireError::BadTid(format!("invalid character {:?}", ch as char)))?
                as u16;
            let bit = i * 5;
            let byte = bit / 8;
            let shift = bit % 8;
            let window = five << (11 - shift);
            bytes[byte] |= (window >> 8) as u8;
            if byte + 1 < TID_BINARY_LEN {
                bytes[byte + 1] |= window as u8;
            }
        }
        Ok(Tid(bytes))
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode_ascii())
    }
}

impl std::fmt::Debug for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tid({})", self.encode_ascii())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parts_roundtrip() {
        let tid = Tid::from_parts(1_700_000_000, 0x8001, &[0xAB; 22]);
        assert_eq!(tid.utc_secs(), 1_700_000_000);
        assert_eq!(tid.frac_ticks(), 0x8001);
        assert_eq!(Tid::from_bytes(tid.as_bytes()), Some(tid));
    }

    #[test]
    fn ascii_form_has_fixed_length() {
        assert_eq!(Tid::now().encode_ascii().len(), TID_ASCII_LEN);
    }

    #[test]
    fn decode_rejects_bad_text() {
        assert!(Tid::decode_ascii("short").is_err());
        let bad = "A".repeat(TID_ASCII_LEN); // uppercase is not in the alphabet
        assert!(Tid::decode_ascii(&bad).is_err());
    }

    proptest! {
        #[test]
        fn ascii_roundtrip(bytes in proptest::array::uniform30(any::<u8>())) {
            let tid = Tid::from_bytes(&bytes).unwrap();
            let text = tid.encode_ascii();
            prop_assert_eq!(Tid::decode_ascii(&text).unwrap(), tid);
        }

        #[test]
        fn ascii_order_matches_chronological_order(
            secs_a in 0u64..(1 << 48),
            secs_b in 0u64..(1 << 48),
            frac_a in any::<u16>(),
            frac_b in any::<u16>(),
            hash in proptest::array::uniform22(any::<u8>()),
        ) {
            let a = Tid::from_parts(secs_a, frac_a, &hash);
            let b = Tid::from_parts(secs_b, frac_b, &hash);
            let chrono = (secs_a, frac_a).cmp(&(secs_b, frac_b));
            prop_assert_eq!(a.encode_ascii().cmp(&b.encode_ascii()), chrono);
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), chrono);
        }
    }
}
