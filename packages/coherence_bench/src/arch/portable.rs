use std::sync::LazyLock;
use std::sync::atomic::{self, compiler_fence};
use std::time::Instant;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Whether `flush_line()` really evicts the line.
pub(crate) const LINE_FLUSH_AVAILABLE: bool = false;

#[inline(always)]
pub(crate) fn serialize() {
    atomic::fence(atomic::Ordering::SeqCst);
    compiler_fence(atomic::Ordering::SeqCst);
}

/// Nanoseconds since the first call. The monotonic clock stands in for a cycle counter.
#[inline(always)]
pub(crate) fn timestamp() -> u64 {
    u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[inline(always)]
pub(crate) fn memory_fence() {
    atomic::fence(atomic::Ordering::SeqCst);
}

/// There is no portable way to evict a line, so this is a plain fence.
///
/// # Safety
///
/// `address` must point into memory mapped into this process.
#[inline(always)]
pub(crate) unsafe fn flush_line(_address: *const u8) {
    memory_fence();
}

pub(crate) const fn counter_frequency() -> Option<u64> {
    Some(1_000_000_000)
}
