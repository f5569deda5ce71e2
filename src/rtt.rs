//! # RTT Tracker
//!
//! Smoothed round-trip estimate used by the replay window's enlargement
//! heuristic.

/// Holds one smoothed round-trip estimate in milliseconds.
///
/// Round-trip times use `u32` rather than `u16`: (2^16 - 1) ms is about 65
/// seconds, and in rare circumstances a round trip can exceed that.
#[derive(Debug)]
pub struct RttTracker {
    current: u32,
    unused: bool,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            current: 0,
            unused: true,
        }
    }

    /// The current smoothed estimate in milliseconds (0 before any sample).
    pub fn current_rtt(&self) -> u32 {
        self.current
    }

    /// Fold one measurement into the estimate.
    ///
    /// The first sample is installed verbatim; afterwards the smoothing
    /// formula from the original TCP specification is applied:
    /// `new = sample + 0.9 * (current - sample)`.
    pub fn update(&mut self, sample: u32) {
        if self.unused {
            self.current = sample;
            self.unused = false;
        } else {
            let drift = f64::from(self.current) - f64::from(sample);
            self.current = (f64::from(sample) + 0.9 * drift) as u32;
        }
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_installed_verbatim() {
        let mut rtt = RttTracker::new();
        rtt.update(120);
        assert_eq!(rtt.current_rtt(), 120);
    }

    #[test]
    fn test_smoothing_pulls_slowly_toward_samples() {
        let mut rtt = RttTracker::new();
        rtt.update(100);
        rtt.update(200);
        // 200 + 0.9 * (100 - 200) = 110
        assert_eq!(rtt.current_rtt(), 110);
        rtt.update(10);
        // 10 + 0.9 * (110 - 10) = 100
        assert_eq!(rtt.current_rtt(), 100);
    }

    #[test]
    fn test_steady_samples_converge() {
        let mut rtt = RttTracker::new();
        for _ in 0..200 {
            rtt.update(50);
        }
        assert_eq!(rtt.current_rtt(), 50);
    }
}
