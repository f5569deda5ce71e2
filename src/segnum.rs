//! # Segment Number Generator
//!
//! Allocates 48-bit segment numbers that are strictly increasing within a
//! process and strictly greater than anything any previous run could have
//! produced. Uniqueness of segment numbers is vital for security (a reused
//! segment number would mean a reused AEAD nonce), so the generator combines
//! the system clock with a persistent record of the numbers already handed
//! out.
//!
//! The persistent record is kept in two files, `<base>_FIRST` and
//! `<base>_SECOND`, written one after the other so that a crash during
//! either write still leaves one parseable file holding a number at least as
//! large as anything already returned. Each file holds the same decimal
//! value on two identical lines; a file is only trusted when both lines
//! agree. The files are never created by the generator itself: at least one
//! must be initialised out-of-band with a small positive value before the
//! first run, so that a deleted record is an error rather than a silent
//! restart from zero.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::clock::epoch_millis;
use crate::constants::SEGNUM_MAX;
use crate::error::{CommsError, Result};

const FILE_SUFFIX_FIRST: &str = "_FIRST";
const FILE_SUFFIX_SECOND: &str = "_SECOND";

/// How long to wait before retrying a store whose read-back did not match.
const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Thread-safe allocator of unique 48-bit segment numbers.
pub struct SegmentNumGenerator {
    inner: Mutex<GeneratorState>,
}

struct GeneratorState {
    first_path: PathBuf,
    second_path: PathBuf,
    reserved: u64,
    /// Next number to hand out. 0 together with `reserve_at == 0` forces a
    /// reservation on the first call.
    next: u64,
    /// Handing out this number requires a fresh reservation first.
    reserve_at: u64,
}

impl SegmentNumGenerator {
    /// Open the generator against the record files at `<base>_FIRST` and
    /// `<base>_SECOND`.
    ///
    /// At least one of the files must already hold a valid value; otherwise
    /// this fails with a startup error. No numbers are reserved yet: the
    /// first reservation happens lazily at the first [`next`](Self::next)
    /// call, which allows [`set_reserved`](Self::set_reserved) to be called
    /// first.
    pub fn new(base_path: &str, reserved: u64) -> Result<Self> {
        if reserved == 0 {
            return Err(CommsError::Config(
                "segment number reservation size must be at least 1".to_string(),
            ));
        }

        let first_path = PathBuf::from(format!("{}{}", base_path, FILE_SUFFIX_FIRST));
        let second_path = PathBuf::from(format!("{}{}", base_path, FILE_SUFFIX_SECOND));

        // Verify now that a stored value exists, so a missing or corrupt
        // record is reported at startup rather than at the first send.
        match (read_stored(&first_path), read_stored(&second_path)) {
            (None, None) => {
                return Err(CommsError::Startup(format!(
                    "no valid stored segment number in {} or {}",
                    first_path.display(),
                    second_path.display()
                )));
            }
            _ => {}
        }

        Ok(SegmentNumGenerator {
            inner: Mutex::new(GeneratorState {
                first_path,
                second_path,
                reserved,
                next: 0,
                reserve_at: 0,
            }),
        })
    }

    /// Return a fresh segment number, reserving a new range if the current
    /// one is exhausted.
    pub fn next(&self) -> Result<u64> {
        let mut state = self.inner.lock().unwrap();

        if state.next == state.reserve_at {
            state.reserve()?;
        }

        let num = state.next;
        state.next += 1;
        Ok(num)
    }

    /// Set how many numbers each reservation claims. Must be at least 1.
    pub fn set_reserved(&self, reserved: u64) -> Result<()> {
        if reserved == 0 {
            return Err(CommsError::Config(
                "segment number reservation size must be at least 1".to_string(),
            ));
        }
        self.inner.lock().unwrap().reserved = reserved;
        Ok(())
    }
}

impl GeneratorState {
    /// Reserve a fresh range of segment numbers and persist its upper bound.
    fn reserve(&mut self) -> Result<()> {
        // The stored value is the highest number any run could have used.
        let stored = match (read_stored(&self.first_path), read_stored(&self.second_path)) {
            (None, None) => {
                return Err(CommsError::Reservation(format!(
                    "no valid stored segment number in {} or {}",
                    self.first_path.display(),
                    self.second_path.display()
                )));
            }
            (a, b) => a.unwrap_or(0).max(b.unwrap_or(0)),
        };
        if stored == 0 {
            return Err(CommsError::Reservation(
                "stored segment number must be at least 1".to_string(),
            ));
        }

        // Generate a candidate from the clock, and wait until it ticks at
        // least once so that no previous run of this process (under a
        // monotone clock) could have generated the same candidate. The spin
        // is acceptable: reservations happen once at startup and then very
        // rarely, given a sensible reservation size.
        let base_clock = clock_segnum()?;
        let mut clock = base_clock;
        while clock == base_clock {
            thread::sleep(Duration::from_millis(1));
            clock = clock_segnum()?;
        }

        self.next = (stored + 1).max(clock);
        let reserve_at = self.next + self.reserved;
        if reserve_at > SEGNUM_MAX {
            return Err(CommsError::Reservation(
                "new upper segment number limit exceeds the 48-bit range".to_string(),
            ));
        }
        self.reserve_at = reserve_at;

        log::debug!(
            "reserved segment numbers [{}, {})",
            self.next,
            self.reserve_at
        );

        // Persist the highest number this reservation can hand out, one
        // file at a time, so that at least one file is parseable at every
        // instant.
        store_segnum(self.reserve_at - 1, &self.first_path)?;
        store_segnum(self.reserve_at - 1, &self.second_path)?;
        Ok(())
    }
}

/// A segment number candidate from the system clock, as milliseconds since
/// the Unix epoch.
fn clock_segnum() -> Result<u64> {
    let millis = epoch_millis();
    // The clock will not reach SEGNUM_MAX until after 10,000 CE; anything
    // bigger means hostile clock skew.
    if millis >= SEGNUM_MAX {
        return Err(CommsError::Reservation(
            "timestamp from the system clock is too big".to_string(),
        ));
    }
    Ok(millis)
}

/// Load the stored segment number from one record file.
///
/// A file is valid only when its first two lines exist, are byte-equal,
/// consist solely of decimal digits, any further lines are empty, and the
/// decoded value is below 2^48 - 1. Anything else yields `None`.
fn read_stored(path: &Path) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();

    let first = lines.next()?;
    let second = lines.next()?;
    if first != second || first.is_empty() {
        return None;
    }
    if !first.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if lines.any(|line| !line.is_empty()) {
        return None;
    }

    let value: u64 = first.parse().ok()?;
    if value >= SEGNUM_MAX {
        return None;
    }
    Some(value)
}

/// Write `segnum` to one record file and verify it by reading it back,
/// retrying until the read-back matches. The read-back should succeed first
/// time pretty much always; the retry loop covers a filesystem that lies
/// about completed writes.
fn store_segnum(segnum: u64, path: &Path) -> Result<()> {
    let content = format!("{}\n{}\n", segnum, segnum);
    loop {
        fs::write(path, &content).map_err(|e| {
            CommsError::Reservation(format!(
                "could not write stored segment number file {}: {}",
                path.display(),
                e
            ))
        })?;

        if read_stored(path) == Some(segnum) {
            return Ok(());
        }

        log::warn!(
            "stored segment number in {} did not read back, retrying",
            path.display()
        );
        thread::sleep(STORE_RETRY_BACKOFF);
    }
}
