//! Timestamp identifiers used as record keys.
//!
//! A TID packs 53 bits of microseconds since the epoch and a 10-bit clock id
//! into 13 characters of sortable base32, so keys order by creation time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;
const TIMESTAMP_MASK: u64 = (1 << 53) - 1;
const CLOCK_ID_MASK: u64 = (1 << 10) - 1;

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);
static CLOCK_ID: OnceLock<u16> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(String);

impl Tid {
    /// Next identifier for this process; strictly greater than any returned
    /// before, even when the wall clock stalls or steps back.
    pub fn next() -> Self {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let previous = LAST_MICROS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let micros = now.max(previous + 1);
        let clock_id = *CLOCK_ID.get_or_init(|| rand::random::<u16>() & CLOCK_ID_MASK as u16);
        Self::from_parts(micros, clock_id)
    }

    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        let mut value = ((micros & TIMESTAMP_MASK) << 10) | (u64::from(clock_id) & CLOCK_ID_MASK);
        let mut encoded = [b'2'; TID_LEN];
        for slot in encoded.iter_mut().rev() {
            *slot = ALPHABET[(value & 31) as usize];
            value >>= 5;
        }
        Self(encoded.iter().map(|&b| b as char).collect())
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != TID_LEN || !s.bytes().all(|b| ALPHABET.contains(&b)) {
            return None;
        }
        // the leading character carries the unused top bit
        if !b"234567abcdefghij".contains(&s.as_bytes()[0]) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.value() >> 10
    }

    pub fn clock_id(&self) -> u16 {
        (self.value() & CLOCK_ID_MASK) as u16
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn value(&self) -> u64 {
        self.0.bytes().fold(0u64, |acc, b| {
            let digit = ALPHABET.iter().position(|&c| c == b).unwrap_or(0) as u64;
            (acc << 5) | digit
        })
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
