//! # Clock
//!
//! Wall-clock milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// A `u64` of milliseconds reaches past the year 584,000,000 CE, so overflow
/// is not a practical concern; a system clock set before 1970 collapses to 0.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2020-01-01 in milliseconds
        assert!(epoch_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_epoch_millis_does_not_decrease() {
        let a = epoch_millis();
        let b = epoch_millis();
        assert!(b >= a);
    }
}
