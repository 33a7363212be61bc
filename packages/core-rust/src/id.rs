//! Correlation ids linking a request envelope to its response.
//!
//! Ids combine a random per-generator prefix with an incrementing counter,
//! both rendered in base 36. They are unique for the lifetime of the
//! generator that minted them; an optional context tag keeps ids minted by
//! different contexts apart in logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const PREFIX_LEN: usize = 6;

/// Unique token carried by a call envelope and echoed by its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps an id received from another context.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints process-lifetime-unique [`CorrelationId`]s.
///
/// Thread-safe: the counter is atomic, so one generator can be shared by
/// every task of a context.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator with a fresh random prefix, e.g. `k3f9qz-1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prefix: random_prefix(),
            counter: AtomicU64::new(0),
        }
    }

    /// Creates a generator whose ids carry a context tag, e.g. `r-k3f9qz-1`.
    #[must_use]
    pub fn with_tag(tag: &str) -> Self {
        Self {
            prefix: format!("{tag}-{}", random_prefix()),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the next id. Counters start at 1.
    pub fn next_id(&self) -> CorrelationId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        CorrelationId(format!("{}-{}", self.prefix, to_base36(n)))
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn random_prefix() -> String {
    let mut prefix = to_base36(rand::random::<u64>());
    // Pad short encodings so every prefix has the same width.
    while prefix.len() < PREFIX_LEN {
        prefix.insert(0, '0');
    }
    prefix.truncate(PREFIX_LEN);
    prefix
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ids_are_sequential_under_one_prefix() {
        let ids = IdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert_eq!(first.as_str(), format!("{}-1", ids.prefix()));
        assert_eq!(second.as_str(), format!("{}-2", ids.prefix()));
    }

    #[test]
    fn prefix_has_fixed_width() {
        for _ in 0..32 {
            assert_eq!(IdGenerator::new().prefix().len(), PREFIX_LEN);
        }
    }

    #[test]
    fn tagged_ids_start_with_tag() {
        let ids = IdGenerator::with_tag("r");
        assert!(ids.next_id().as_str().starts_with("r-"));
    }

    #[test]
    fn concurrent_ids_are_unique() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id minted");
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn base36_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    proptest! {
        #[test]
        fn base36_parses_back(n in any::<u64>()) {
            prop_assert_eq!(u64::from_str_radix(&to_base36(n), 36).unwrap(), n);
        }
    }
}
