//! Per-architecture instruction sequences: the serialized cycle counter, memory fences and
//! cache line eviction. Nothing outside this module uses inline assembly or intrinsics.
//!
//! Every implementation exposes the same set of functions:
//!
//! * `serialize()` - waits until all earlier instructions and memory operations have completed
//!   and prevents later ones from starting early.
//! * `timestamp()` - reads the cycle counter (not serialized on its own).
//! * `memory_fence()` - orders all earlier memory operations before all later ones.
//! * `flush_line()` - evicts the cache line containing an address from the whole hierarchy.
//! * `counter_frequency()` - the counter frequency if the hardware reports it directly.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod portable;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) use portable::*;

use std::time::{Duration, Instant};

/// How long we watch the cycle counter tick when the hardware does not report its frequency.
const CALIBRATION_PERIOD: Duration = Duration::from_millis(100);

/// Determines how many cycle counter ticks happen per second.
///
/// Uses the frequency reported by the hardware if available, otherwise compares the counter
/// against the monotonic clock for a short period.
#[cfg_attr(test, mutants::skip)] // Timing-dependent, cannot be asserted precisely.
pub(crate) fn clock_rate() -> u64 {
    if let Some(frequency) = counter_frequency() {
        return frequency;
    }

    serialize();
    let start_instant = Instant::now();
    let start_ticks = timestamp();

    while start_instant.elapsed() < CALIBRATION_PERIOD {
        std::hint::spin_loop();
    }

    serialize();
    let end_ticks = timestamp();
    let elapsed = start_instant.elapsed();

    let ticks = u128::from(end_ticks.saturating_sub(start_ticks));
    let nanos = elapsed.as_nanos().max(1);

    u64::try_from(ticks.saturating_mul(1_000_000_000) / nanos).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn timestamp_does_not_go_backwards_on_one_thread() {
        serialize();
        let first = timestamp();
        serialize();
        let second = timestamp();

        assert!(second >= first);
    }

    #[test]
    fn clock_rate_is_plausible() {
        let rate = clock_rate();

        // Anything from a slow architectural timer to a very fast TSC.
        assert!(rate >= 1_000_000, "clock rate {rate} is implausibly low");
    }

    #[test]
    fn flush_line_accepts_any_readable_address() {
        let value = Box::new(42_u64);

        // SAFETY: The box is alive and readable.
        unsafe {
            flush_line(std::ptr::from_ref(&*value).cast());
        }

        memory_fence();
        assert_eq!(*value, 42);
    }
}
