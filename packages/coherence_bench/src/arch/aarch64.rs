use std::arch::asm;

/// Whether `flush_line()` really evicts the line.
pub(crate) const LINE_FLUSH_AVAILABLE: bool = true;

#[inline(always)]
pub(crate) fn serialize() {
    // SAFETY: Barriers have no memory safety implications.
    unsafe {
        asm!("dsb sy", "isb", options(nostack, preserves_flags));
    }
}

/// Reads the virtual counter. This is a fixed-frequency timer rather than a core cycle counter
/// but it is readable from user mode and consistent across cores.
#[inline(always)]
pub(crate) fn timestamp() -> u64 {
    let value: u64;

    // SAFETY: CNTVCT_EL0 is readable from EL0 on Linux.
    unsafe {
        asm!("mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack, preserves_flags));
    }

    value
}

#[inline(always)]
pub(crate) fn memory_fence() {
    // SAFETY: Barriers have no memory safety implications.
    unsafe {
        asm!("dmb ish", options(nostack, preserves_flags));
    }
}

/// # Safety
///
/// `address` must point into memory mapped into this process.
#[inline(always)]
pub(crate) unsafe fn flush_line(address: *const u8) {
    // SAFETY: Forwarding the caller's guarantees. Linux enables DC CIVAC for EL0.
    unsafe {
        asm!("dc civac, {}", in(reg) address, options(nostack, preserves_flags));
    }
}

pub(crate) fn counter_frequency() -> Option<u64> {
    let value: u64;

    // SAFETY: CNTFRQ_EL0 is readable from EL0 on Linux.
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) value, options(nomem, nostack, preserves_flags));
    }

    (value != 0).then_some(value)
}
