//! Puts the lines of a measured region into a known place in the cache hierarchy and a known
//! coherence state.
//!
//! Nothing here decides which thread does what. The coherence sequences are described as
//! [`PrimeStep`]s naming a role, and the orchestrator hands each step to the worker that plays
//! that role for the current measurement.

use std::hint::black_box;

use crate::buffer::Buffer;
use crate::{AccessPlan, CacheLevel, CoherenceMode, FlushOrder, arch};

/// One kind of access applied to every line of a plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Access {
    Read,

    /// Writes back the value just read, so the content of the line is preserved.
    Write,

    /// Evicts the line from every cache of every processor.
    LineFlush,
}

impl Access {
    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::LineFlush => 2,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::LineFlush),
            _ => None,
        }
    }
}

/// Who performs a step of a coherence sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Role {
    /// The worker that owns the measured region.
    Owner,

    /// Every sharing worker, one after another in configuration order.
    Sharers,

    /// Only the first sharing worker.
    FirstSharer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PrimeStep {
    pub(crate) role: Role,
    pub(crate) access: Access,
}

const fn step(role: Role, access: Access) -> PrimeStep {
    PrimeStep { role, access }
}

/// The access sequence that leaves the owner's lines in `mode`.
///
/// Each step completes on every participating processor before the next one starts.
pub(crate) fn coherence_steps(
    mode: CoherenceMode,
    has_sharers: bool,
    line_flush_available: bool,
) -> Vec<PrimeStep> {
    use Access::{LineFlush, Read, Write};
    use Role::{FirstSharer, Owner, Sharers};

    match mode {
        CoherenceMode::Modified => vec![step(Owner, Write)],
        CoherenceMode::Exclusive | CoherenceMode::ReadOnly => vec![step(Owner, Read)],
        CoherenceMode::Shared | CoherenceMode::Forward => {
            vec![step(Owner, Read), step(Sharers, Read)]
        }
        CoherenceMode::Owned => vec![step(Owner, Write), step(Sharers, Read)],
        CoherenceMode::MustUseOnceWritten => vec![step(FirstSharer, Write), step(Owner, Read)],
        CoherenceMode::Invalid if has_sharers => {
            vec![step(Owner, Read), step(FirstSharer, Write)]
        }
        CoherenceMode::Invalid if line_flush_available => {
            vec![step(Owner, Read), step(Owner, LineFlush)]
        }
        // Only reachable on architectures without line flush, where configuration
        // validation has already rejected it.
        CoherenceMode::Invalid | CoherenceMode::Disabled => Vec::new(),
    }
}

/// The owner's accesses that place the data before the caches are flushed.
pub(crate) fn placement_accesses(mode: CoherenceMode, line_flush_available: bool) -> Vec<Access> {
    match mode {
        CoherenceMode::Modified => vec![Access::Write],
        CoherenceMode::Invalid if line_flush_available => vec![Access::Write, Access::LineFlush],
        CoherenceMode::Invalid => vec![Access::Write],
        CoherenceMode::Disabled => Vec::new(),
        _ => vec![Access::Read],
    }
}

/// Applies `access` to every line of the plan, `repetitions` times.
///
/// Every access is followed by a full memory fence so the coherence protocol has settled on
/// each line before the next one is touched.
pub(crate) fn touch(plan: &AccessPlan, access: Access, repetitions: u32) {
    let mut checksum = 0_u64;

    for _ in 0..repetitions {
        for line in plan.lines() {
            let word = line.cast::<u64>();

            match access {
                // SAFETY: The plan only contains lines valid for reads, aligned to 8 bytes.
                Access::Read => checksum ^= unsafe { word.read_volatile() },
                Access::Write => {
                    // SAFETY: The plan only contains lines valid for reads and writes.
                    let value = unsafe { word.read_volatile() };
                    // SAFETY: As above.
                    unsafe { word.write_volatile(value) };
                }
                // SAFETY: The line is mapped into the process.
                Access::LineFlush => unsafe { arch::flush_line(line.as_ptr()) },
            }

            arch::memory_fence();
        }
    }

    black_box(checksum);
}

/// Displaces everything else from the selected cache levels by reading through a flush buffer.
///
/// Levels are flushed outermost first, each by reading `(100 + extra) / 50` times its size at its
/// own line stride. Returns a checksum of what was read so the reads cannot be elided.
pub(crate) fn flush(
    flush_buffer: &Buffer,
    levels: &[CacheLevel],
    extra_percent: u32,
    order: FlushOrder,
) -> u64 {
    let mut checksum = 0_u64;
    let base = flush_buffer.as_ptr();

    for level in levels.iter().rev() {
        let stride = (level.line_size() as usize).max(size_of::<u64>());
        let len = usize::try_from(level.size() * (100 + u64::from(extra_percent)) / 50)
            .unwrap_or(usize::MAX)
            .min(flush_buffer.len());

        // Whole words only, so the last read never crosses the end of the buffer.
        let lines = len.saturating_sub(size_of::<u64>() - 1).div_ceil(stride);

        let mut read_line = |line: usize| {
            // SAFETY: line * stride + 8 <= len <= buffer length, and the buffer is 8-aligned.
            checksum ^= unsafe { base.add(line * stride).cast::<u64>().read_volatile() };
        };

        match order {
            FlushOrder::Fifo => (0..lines).for_each(&mut read_line),
            FlushOrder::Lifo => (0..lines).rev().for_each(&mut read_line),
        }
    }

    arch::memory_fence();
    black_box(checksum)
}

/// Loads a translation for every page of the plan, so the timed accesses do not miss in the TLB
/// level the plan was restricted to.
///
/// Touches one line per page, which also brings that line into the local caches.
pub(crate) fn restrict_to_tlb_level(plan: &AccessPlan) {
    let mut checksum = 0_u64;

    for head in plan.page_heads() {
        // SAFETY: Every page head is a planned line, valid for reads and 8-aligned.
        checksum ^= unsafe { head.cast::<u64>().read_volatile() };
    }

    arch::memory_fence();
    black_box(checksum);
}
