//! # Replay Window
//!
//! Bounded-memory filter over the 48-bit message number space, used on the
//! receive side to reject replayed packets. Message numbers are marked as
//! delivered with [`ReplayWindow::log`] and queried with
//! [`ReplayWindow::seen`]. A complete log of every number would be
//! infeasible, so the window forgets old numbers and conservatively reports
//! anything below its floor as already seen.
//!
//! ## Structure
//!
//! The window is a ring of blocks of 256 bits, one bit per message number.
//! `current_block` marks the ring head, which corresponds to `base_msgnum`,
//! the lowest number still tracked. Each block carries a count of set bits
//! and the timestamp of its most recent set.
//!
//! Logging a number above the top of the window moves the window forward.
//! The preferred way is the standard ring move: advance the head and recycle
//! the blocks it passes over. But before a block is recycled its metadata is
//! consulted: if the block still has unseen numbers (count below 256) and
//! was written to within the current round-trip time, packets for it may
//! still legitimately arrive, so the ring is enlarged instead (up to
//! `MAX_BLOCKS` blocks) to keep it.

use std::sync::{Arc, Mutex};

use crate::clock::epoch_millis;
use crate::rtt::RttTracker;

/// Bits (message numbers) per block.
pub const BLOCK_SIZE: usize = 256;

/// Upper bound on the number of blocks in the ring.
pub const MAX_BLOCKS: usize = 64;

const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 64;

#[derive(Debug, Clone, Copy, Default)]
struct BlockMeta {
    count_set: u32,
    last_set_ms: u64,
}

/// Sliding-window replay filter. See the module documentation.
pub struct ReplayWindow {
    rtt: Arc<Mutex<RttTracker>>,
    /// Bit storage, `WORDS_PER_BLOCK` words per block.
    bits: Vec<u64>,
    blocks: Vec<BlockMeta>,
    /// Ring head: index of the block holding `base_msgnum`.
    current_block: usize,
    /// Lowest message number still tracked.
    base_msgnum: u64,
}

impl ReplayWindow {
    pub fn new(rtt: Arc<Mutex<RttTracker>>) -> Self {
        ReplayWindow {
            rtt,
            bits: vec![0; WORDS_PER_BLOCK],
            blocks: vec![BlockMeta::default()],
            current_block: 0,
            base_msgnum: 0,
        }
    }

    /// Forget every logged number, ready for a fresh segment.
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.blocks.fill(BlockMeta::default());
        self.current_block = 0;
        self.base_msgnum = 0;
    }

    /// Whether `msgnum` is recorded as delivered.
    ///
    /// Guaranteed true for every number passed to [`log`](Self::log); also
    /// true for every number below the window floor, whose records have been
    /// discarded and which must be assumed seen.
    pub fn seen(&self, msgnum: u64) -> bool {
        if msgnum < self.base_msgnum {
            return true;
        }
        if msgnum >= self.base_msgnum + self.capacity() as u64 {
            return false;
        }
        let pos = self.records_pos(msgnum);
        self.bits[pos / 64] & (1u64 << (pos % 64)) != 0
    }

    /// Record `msgnum` as delivered, moving or enlarging the window if the
    /// number lies above its top. Numbers below the window floor cannot be
    /// recorded and are ignored.
    pub fn log(&mut self, msgnum: u64) {
        if msgnum < self.base_msgnum {
            return;
        }

        let now = epoch_millis();

        if msgnum >= self.base_msgnum + self.capacity() as u64 {
            // blocks the window must move forward to bring msgnum in range
            let forward =
                (msgnum - (self.base_msgnum + self.capacity() as u64)) / BLOCK_SIZE as u64 + 1;
            let current_rtt = self.rtt.lock().unwrap().current_rtt();
            let extra = self.extra_blocks_wanted(forward, now, current_rtt);

            if extra == 0 {
                self.move_window(forward);
            } else {
                self.reallocate(forward, extra);
            }
        }

        let pos = self.records_pos(msgnum);
        let word = pos / 64;
        let mask = 1u64 << (pos % 64);
        let block = &mut self.blocks[pos / BLOCK_SIZE];
        if self.bits[word] & mask == 0 {
            self.bits[word] |= mask;
            block.count_set += 1;
        }
        block.last_set_ms = now;
    }

    fn capacity(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }

    /// Ring position of an in-window message number.
    fn records_pos(&self, msgnum: u64) -> usize {
        let offset = (msgnum - self.base_msgnum) as usize;
        (offset + self.current_block * BLOCK_SIZE) % self.capacity()
    }

    /// How many blocks the ring should grow by for a forward move of
    /// `forward` blocks.
    ///
    /// Walks the blocks that the move would recycle, looking for the first
    /// one still worth keeping: not saturated, and written to within the
    /// current round-trip time. Growing by `forward - i` blocks (bounded by
    /// `MAX_BLOCKS`) lets that block survive the move.
    fn extra_blocks_wanted(&self, forward: u64, now: u64, current_rtt: u32) -> usize {
        let nblocks = self.blocks.len();
        if nblocks == MAX_BLOCKS {
            return 0;
        }

        let limit = (nblocks as u64).min(forward);
        let mut keep_offset = None;
        for i in 0..limit {
            let block = &self.blocks[(i as usize + self.current_block) % nblocks];
            if block.count_set < BLOCK_SIZE as u32
                && now.saturating_sub(block.last_set_ms) <= u64::from(current_rtt)
            {
                keep_offset = Some(i);
                break;
            }
        }

        // no block worth keeping: recycle in place
        let Some(offset) = keep_offset else { return 0 };
        let wanted = forward - offset;
        let room = (MAX_BLOCKS - nblocks) as u64;
        wanted.min(room) as usize
    }

    /// Advance the ring head by `forward` blocks, recycling the blocks it
    /// passes over.
    fn move_window(&mut self, forward: u64) {
        let nblocks = self.blocks.len();
        let to_reset = (nblocks as u64).min(forward) as usize;

        for i in 0..to_reset {
            let b = (self.current_block + i) % nblocks;
            self.bits[b * WORDS_PER_BLOCK..(b + 1) * WORDS_PER_BLOCK].fill(0);
            self.blocks[b] = BlockMeta::default();
        }

        self.current_block = ((self.current_block as u64 + forward) % nblocks as u64) as usize;
        self.base_msgnum += forward * BLOCK_SIZE as u64;
    }

    /// Move the window forward by `forward` blocks while growing the ring by
    /// `extra` blocks, copying the surviving tail blocks to the head of the
    /// new ring.
    fn reallocate(&mut self, forward: u64, extra: usize) {
        let old_n = self.blocks.len();
        let new_n = old_n + extra;
        let mut new_bits = vec![0u64; new_n * WORDS_PER_BLOCK];
        let mut new_blocks = vec![BlockMeta::default(); new_n];

        // blocks the window still moves forward after growing
        let advance = forward - extra as u64;
        let to_copy = if advance >= old_n as u64 {
            0
        } else {
            old_n - advance as usize
        };
        let copy_start = (self.current_block + (old_n - to_copy)) % old_n;

        for i in 0..to_copy {
            let src = (copy_start + i) % old_n;
            new_blocks[i] = self.blocks[src];
            new_bits[i * WORDS_PER_BLOCK..(i + 1) * WORDS_PER_BLOCK]
                .copy_from_slice(&self.bits[src * WORDS_PER_BLOCK..(src + 1) * WORDS_PER_BLOCK]);
        }

        self.bits = new_bits;
        self.blocks = new_blocks;
        self.current_block = 0;
        self.base_msgnum += advance * BLOCK_SIZE as u64;
    }
}

impl std::fmt::Debug for ReplayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWindow")
            .field("base_msgnum", &self.base_msgnum)
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}
