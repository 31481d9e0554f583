//! Timing of the primitive and conversion of the raw samples into the result vector.

use std::fmt;

use crate::{AccessPlan, NoopPrimitive, TimedPrimitive, arch};

/// Reported in place of every value that could not be measured.
pub const INVALID_MEASUREMENT: f64 = -7.77e7;

/// How many loop overhead timings in a row must fail to find a new minimum before we stop.
const OVERHEAD_STABLE_RUNS: u32 = 1000;

/// Upper bound for the loop overhead calibration, in case the minimum keeps creeping down.
const OVERHEAD_MAX_RUNS: u32 = 1_000_000;

/// The outcome of one timed run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MeasurementSample {
    /// Elapsed cycle counter ticks.
    Cycles(u64),

    /// Nothing meaningful could be measured.
    Invalid,
}

impl MeasurementSample {
    /// The elapsed cycles, if the sample is valid.
    #[must_use]
    pub fn cycles(self) -> Option<u64> {
        match self {
            Self::Cycles(cycles) => Some(cycles),
            Self::Invalid => None,
        }
    }

    /// Whether the sample holds a cycle count.
    #[must_use]
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Cycles(_))
    }

    /// The raw value as reported in the result vector.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Cycles(cycles) => cycles as f64,
            Self::Invalid => INVALID_MEASUREMENT,
        }
    }

    /// Converts to nanoseconds at the given clock rate. Invalid samples stay invalid.
    #[must_use]
    pub fn to_nanoseconds(self, clock_rate: u64) -> f64 {
        match self {
            Self::Cycles(_) if clock_rate == 0 => INVALID_MEASUREMENT,
            Self::Cycles(cycles) => cycles as f64 / clock_rate as f64 * 1e9,
            Self::Invalid => INVALID_MEASUREMENT,
        }
    }

    /// Removes a constant overhead, never going below zero.
    #[must_use]
    pub fn compensate(self, overhead: u64) -> Self {
        match self {
            Self::Cycles(cycles) => Self::Cycles(cycles.saturating_sub(overhead)),
            Self::Invalid => Self::Invalid,
        }
    }
}

impl fmt::Display for MeasurementSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycles(cycles) => write!(f, "{cycles} cycles"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Times `access_count` accesses of the primitive.
///
/// The cycle counter reads are fenced on both sides so that neither earlier work nor the timed
/// accesses can be reordered across them.
#[inline(never)]
pub fn measure_once(
    primitive: &dyn TimedPrimitive,
    plan: &AccessPlan,
    access_count: u64,
) -> MeasurementSample {
    arch::serialize();
    let start = arch::timestamp();

    primitive.run(plan, access_count);

    arch::serialize();
    let end = arch::timestamp();

    // Only possible if the thread migrated between processors with unsynchronized counters.
    end.checked_sub(start)
        .map_or(MeasurementSample::Invalid, MeasurementSample::Cycles)
}

/// Finds the smallest overhead of the timing sequence around an empty primitive.
///
/// Keeps timing until a long enough streak of runs has passed without a new minimum.
#[cfg_attr(test, mutants::skip)] // Timing-dependent, the exact value cannot be asserted.
pub(crate) fn loop_overhead(plan: &AccessPlan) -> u64 {
    let mut minimum = u64::MAX;
    let mut streak = 0;

    for _ in 0..OVERHEAD_MAX_RUNS {
        if let Some(cycles) = measure_once(&NoopPrimitive, plan, 0).cycles()
            && cycles < minimum
        {
            minimum = cycles;
            streak = 0;
            continue;
        }

        streak += 1;
        if streak >= OVERHEAD_STABLE_RUNS {
            break;
        }
    }

    if minimum == u64::MAX { 0 } else { minimum }
}

/// The per-slot results of one problem size.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SlotResult {
    pub(crate) sample: MeasurementSample,

    // One per configured counter; `None` if the counter could not be read.
    pub(crate) counters: Vec<Option<u64>>,
}

impl SlotResult {
    pub(crate) fn invalid(counter_count: usize) -> Self {
        Self {
            sample: MeasurementSample::Invalid,
            counters: vec![None; counter_count],
        }
    }

    /// Whether this run should replace `other` as the reported one: a valid sample beats an
    /// invalid one, a smaller sample beats a larger one.
    pub(crate) fn is_better_than(&self, other: &Self) -> bool {
        match (self.sample, other.sample) {
            (MeasurementSample::Cycles(ours), MeasurementSample::Cycles(theirs)) => ours < theirs,
            (MeasurementSample::Cycles(_), MeasurementSample::Invalid) => true,
            (MeasurementSample::Invalid, _) => false,
        }
    }
}

/// Lays out the results of one problem size for the harness:
/// `[size, cycles of every slot, nanoseconds of every slot, counter 0 of every slot, ...]`.
pub(crate) fn results_vector(
    problem_size: u64,
    slots: &[SlotResult],
    counter_count: usize,
    clock_rate: u64,
) -> Vec<f64> {
    let mut results = Vec::with_capacity(1 + slots.len() * (2 + counter_count));

    results.push(problem_size as f64);
    results.extend(slots.iter().map(|slot| slot.sample.to_f64()));
    results.extend(slots.iter().map(|slot| slot.sample.to_nanoseconds(clock_rate)));

    for counter in 0..counter_count {
        results.extend(slots.iter().map(|slot| {
            slot.counters
                .get(counter)
                .copied()
                .flatten()
                .map_or(INVALID_MEASUREMENT, |value| value as f64)
        }));
    }

    results
}
