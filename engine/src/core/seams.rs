//! Deterministic seams for time and randomness.
//!
//! Production code takes a `Clock` and an `RngHandle` instead of calling
//! `Utc::now()` / thread-rng directly, so property tests can pin both.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Wall-clock source. Implementations must be cheap and thread-safe.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Lowercase letters and digits 2-7, safe in filenames on every supported
/// filesystem.
const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Shared random source. Seedable so that generated names (side-rename
/// suffixes, instance ids) are reproducible in tests.
pub struct RngHandle {
    inner: Mutex<StdRng>,
}

impl RngHandle {
    pub fn from_entropy() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().unwrap().next_u64()
    }

    /// A short base32 string, e.g. for `(old-<suffix>)` side-renames.
    pub fn base32_string(&self, len: usize) -> String {
        let mut rng = self.inner.lock().unwrap();
        (0..len)
            .map(|_| BASE32_ALPHABET[rng.gen_range(0..BASE32_ALPHABET.len())] as char)
            .collect()
    }
}

impl Default for RngHandle {
    fn default() -> Self {
        Self::from_entropy()
    }
}
