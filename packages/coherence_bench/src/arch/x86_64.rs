use std::arch::x86_64::{_mm_clflush, _mm_lfence, _mm_mfence, _rdtsc};

/// Whether `flush_line()` really evicts the line.
pub(crate) const LINE_FLUSH_AVAILABLE: bool = true;

#[inline(always)]
pub(crate) fn serialize() {
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        _mm_mfence();
    }
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        _mm_lfence();
    }
}

#[inline(always)]
pub(crate) fn timestamp() -> u64 {
    // SAFETY: RDTSC is available on every x86_64 processor.
    unsafe { _rdtsc() }
}

#[inline(always)]
pub(crate) fn memory_fence() {
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        _mm_mfence();
    }
}

/// # Safety
///
/// `address` must point into memory mapped into this process.
#[inline(always)]
pub(crate) unsafe fn flush_line(address: *const u8) {
    // SAFETY: Forwarding the caller's guarantees. CLFLUSH is part of the x86_64 baseline.
    unsafe {
        _mm_clflush(address);
    }
}

/// The TSC frequency is not architecturally visible to user mode, so it is always calibrated.
pub(crate) const fn counter_frequency() -> Option<u64> {
    None
}
