//! Hardware performance counters sampled around the timed region, via `perf_event_open()`.

use std::os::fd::{AsRawFd, OwnedFd};
use std::str::FromStr;

use derive_more::derive::Display;
use tracing::{debug, warn};

use crate::pal::{Bindings, BindingsFacade};
use crate::{Error, Result};

// From linux/perf_event.h.
const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_RAW: u32 = 4;
const PERF_ATTR_SIZE_VER0: u32 = 64;

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const FLAG_EXCLUDE_HV: u64 = 1 << 6;

const PERF_EVENT_IOC_ENABLE: libc::Ioctl = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::Ioctl = 0x2401;
const PERF_EVENT_IOC_RESET: libc::Ioctl = 0x2403;

/// The first (version 0) layout of `struct perf_event_attr`. The kernel accepts it from any
/// caller that reports the matching size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub(crate) struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

impl PerfEventAttr {
    fn counting(kind: u32, config: u64) -> Self {
        Self {
            kind,
            size: PERF_ATTR_SIZE_VER0,
            config,
            flags: FLAG_DISABLED | FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV,
            ..Self::default()
        }
    }
}

/// A hardware event that can be counted, named the way `perf list` names it.
///
/// Raw events are written as `r` followed by the hexadecimal event code, e.g. `r01c2`.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum CounterEvent {
    /// Processor cycles, affected by frequency scaling.
    #[display("cycles")]
    Cycles,

    /// Retired instructions.
    #[display("instructions")]
    Instructions,

    /// Last level cache accesses.
    #[display("cache-references")]
    CacheReferences,

    /// Last level cache misses.
    #[display("cache-misses")]
    CacheMisses,

    /// Retired branch instructions.
    #[display("branch-instructions")]
    BranchInstructions,

    /// Mispredicted branch instructions.
    #[display("branch-misses")]
    BranchMisses,

    /// Bus cycles, which can differ from processor cycles.
    #[display("bus-cycles")]
    BusCycles,

    /// Cycles in which the instruction issue stage stalled.
    #[display("stalled-cycles-frontend")]
    StalledCyclesFrontend,

    /// Cycles in which the retirement stage stalled.
    #[display("stalled-cycles-backend")]
    StalledCyclesBackend,

    /// Cycles at the reference clock rate, not affected by frequency scaling.
    #[display("ref-cycles")]
    RefCycles,

    /// A model-specific event, by its raw event code.
    #[display("r{_0:x}")]
    Raw(u64),
}

impl CounterEvent {
    fn attr(self) -> PerfEventAttr {
        let generic = match self {
            Self::Cycles => 0,
            Self::Instructions => 1,
            Self::CacheReferences => 2,
            Self::CacheMisses => 3,
            Self::BranchInstructions => 4,
            Self::BranchMisses => 5,
            Self::BusCycles => 6,
            Self::StalledCyclesFrontend => 7,
            Self::StalledCyclesBackend => 8,
            Self::RefCycles => 9,
            Self::Raw(code) => return PerfEventAttr::counting(PERF_TYPE_RAW, code),
        };

        PerfEventAttr::counting(PERF_TYPE_HARDWARE, generic)
    }
}

impl FromStr for CounterEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let event = match s {
            "cycles" | "cpu-cycles" => Self::Cycles,
            "instructions" => Self::Instructions,
            "cache-references" => Self::CacheReferences,
            "cache-misses" => Self::CacheMisses,
            "branch-instructions" | "branches" => Self::BranchInstructions,
            "branch-misses" => Self::BranchMisses,
            "bus-cycles" => Self::BusCycles,
            "stalled-cycles-frontend" => Self::StalledCyclesFrontend,
            "stalled-cycles-backend" => Self::StalledCyclesBackend,
            "ref-cycles" => Self::RefCycles,
            other => {
                let code = other
                    .strip_prefix('r')
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| format!("unknown hardware counter '{other}'"))?;
                Self::Raw(code)
            }
        };

        Ok(event)
    }
}

/// Open counters of the thread that created the set.
///
/// The counters only count events of that thread, so the set must be started, stopped and read
/// on it too.
#[derive(Debug)]
pub(crate) struct CounterSet {
    counters: Vec<(CounterEvent, OwnedFd)>,
    bindings: BindingsFacade,
}

impl CounterSet {
    /// Opens one counter per event for the current thread.
    pub(crate) fn open(events: &[CounterEvent], bindings: BindingsFacade) -> Result<Self> {
        let counters = events
            .iter()
            .map(|&event| {
                bindings
                    .perf_event_open(&event.attr())
                    .map(|fd| (event, fd))
                    .map_err(|source| Error::Counter {
                        name: event.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(count = counters.len(), "opened hardware counters");

        Ok(Self { counters, bindings })
    }

    pub(crate) fn len(&self) -> usize {
        self.counters.len()
    }

    /// Zeroes and enables every counter.
    pub(crate) fn start(&self) {
        for (event, fd) in &self.counters {
            let result = self
                .bindings
                .perf_event_ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_RESET)
                .and_then(|()| {
                    self.bindings
                        .perf_event_ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE)
                });

            if let Err(e) = result {
                warn!("could not start counter {event}: {e}");
            }
        }
    }

    /// Disables every counter and reads its value. A counter that cannot be read yields `None`.
    pub(crate) fn stop(&self) -> Vec<Option<u64>> {
        for (event, fd) in &self.counters {
            if let Err(e) = self
                .bindings
                .perf_event_ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE)
            {
                warn!("could not stop counter {event}: {e}");
            }
        }

        self.counters
            .iter()
            .map(|(event, fd)| match self.bindings.read_counter(fd.as_raw_fd()) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("could not read counter {event}: {e}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fs::File;
    use std::io;

    use super::*;
    use crate::pal::MockBindings;

    fn dummy_fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn attr_has_version_zero_layout() {
        assert_eq!(size_of::<PerfEventAttr>(), PERF_ATTR_SIZE_VER0 as usize);

        let attr = CounterEvent::CacheMisses.attr();
        assert_eq!(attr.kind, PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, 3);
        assert_eq!(attr.flags & FLAG_DISABLED, FLAG_DISABLED);

        let attr = CounterEvent::Raw(0x01c2).attr();
        assert_eq!(attr.kind, PERF_TYPE_RAW);
        assert_eq!(attr.config, 0x01c2);
    }

    #[test]
    fn event_names() {
        assert_eq!("cycles".parse::<CounterEvent>(), Ok(CounterEvent::Cycles));
        assert_eq!("branches".parse::<CounterEvent>(), Ok(CounterEvent::BranchInstructions));
        assert_eq!("r1f".parse::<CounterEvent>(), Ok(CounterEvent::Raw(0x1f)));
        assert_eq!(CounterEvent::Raw(0x1f).to_string(), "r1f");
        "rzz".parse::<CounterEvent>().unwrap_err();
        "flops".parse::<CounterEvent>().unwrap_err();
    }

    #[test]
    fn open_failure_names_the_counter() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_perf_event_open()
            .times(1)
            .returning(|_| Ok(dummy_fd()));
        bindings
            .expect_perf_event_open()
            .times(1)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::ENOENT)));

        let error = CounterSet::open(
            &[CounterEvent::Cycles, CounterEvent::CacheMisses],
            BindingsFacade::from_mock(bindings),
        )
        .unwrap_err();

        assert!(matches!(error, Error::Counter { ref name, .. } if name == "cache-misses"));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn unreadable_counter_yields_none() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_perf_event_open()
            .times(2)
            .returning(|_| Ok(dummy_fd()));
        bindings
            .expect_perf_event_ioctl()
            .withf(|_, request| *request == PERF_EVENT_IOC_RESET)
            .times(2)
            .returning(|_, _| Ok(()));
        bindings
            .expect_perf_event_ioctl()
            .withf(|_, request| *request == PERF_EVENT_IOC_ENABLE)
            .times(2)
            .returning(|_, _| Ok(()));
        bindings
            .expect_perf_event_ioctl()
            .withf(|_, request| *request == PERF_EVENT_IOC_DISABLE)
            .times(2)
            .returning(|_, _| Ok(()));
        bindings.expect_read_counter().times(1).returning(|_| Ok(1234));
        bindings
            .expect_read_counter()
            .times(1)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EIO)));

        let counters = CounterSet::open(
            &[CounterEvent::Cycles, CounterEvent::Instructions],
            BindingsFacade::from_mock(bindings),
        )
        .unwrap();

        assert_eq!(counters.len(), 2);
        counters.start();
        assert_eq!(counters.stop(), vec![Some(1234), None]);
    }

    #[test]
    fn empty_set_does_nothing() {
        let counters = CounterSet::open(&[], BindingsFacade::from_mock(MockBindings::new())).unwrap();

        assert_eq!(counters.len(), 0);
        counters.start();
        assert!(counters.stop().is_empty());
    }
}
