use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Per-process random component, fixed at startup.
static PROCESS_SEED: Lazy<[u8; 5]> = Lazy::new(|| {
    let mut seed = [0u8; 5];
    OsRng.fill_bytes(&mut seed);
    seed
});

/// Monotonic counter; only the low three bytes are used, so it wraps mod 2^24.
static COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(OsRng.next_u32()));

/// A 12-byte document identifier.
///
/// Layout: bytes `0..4` are the big-endian Unix seconds at generation time,
/// bytes `4..9` a per-process random value fixed at startup, and bytes
/// `9..12` the low three bytes of an atomically incremented counter seeded
/// from a CSPRNG.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub const LEN: usize = 12;

    /// Generates a fresh id from the current time and process-wide state.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_SEED);

        let c = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        // The most significant byte is ignored for correct wraparound.
        bytes[9] = (c >> 16) as u8;
        bytes[10] = (c >> 8) as u8;
        bytes[11] = c as u8;

        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Unix seconds encoded in the id.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Lowercase 24-character hex form.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(24);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parses the 24-character hex form.
    pub fn parse_hex(s: &str) -> Result<Self> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(Error::Validation(format!("invalid ObjectId {s:?}")));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::Validation(format!("invalid ObjectId {s:?}")))?;
        }
        Ok(ObjectId(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_generated_together_differ() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        // Same process seed in both.
        assert_eq!(a.as_bytes()[4..9], b.as_bytes()[4..9]);
    }

    #[test]
    fn counter_is_monotonic_mod_2_24() {
        let tail = |id: ObjectId| {
            let b = id.as_bytes();
            (u32::from(b[9]) << 16) | (u32::from(b[10]) << 8) | u32::from(b[11])
        };
        let a = tail(ObjectId::new());
        let b = tail(ObjectId::new());
        // Other tests may generate ids concurrently; only require forward
        // movement by a small step, wrapping mod 2^24.
        let step = (b + (1 << 24) - a) % (1 << 24);
        assert!(step >= 1 && step < 64, "step {step}");
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::new();
        let parsed = ObjectId::parse_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(ObjectId::parse_hex("xyz").is_err());
        assert!(ObjectId::parse_hex("zz0102030405060708090a0b").is_err());
        assert!(ObjectId::parse_hex("0102030405060708090a0b").is_err());
    }

    #[test]
    fn timestamp_is_recent() {
        let id = ObjectId::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        assert!(now - id.timestamp() < 5);
    }
}
