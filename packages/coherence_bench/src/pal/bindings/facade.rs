#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

use libc::cpu_set_t;

use crate::counters::PerfEventAttr;
#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Bindings for BindingsFacade {
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.sched_setaffinity_current(cpuset),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_setaffinity_current(cpuset),
        }
    }

    fn sched_getaffinity_current(&self) -> io::Result<cpu_set_t> {
        match self {
            Self::Target(bindings) => bindings.sched_getaffinity_current(),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_getaffinity_current(),
        }
    }

    fn page_size(&self) -> usize {
        match self {
            Self::Target(bindings) => bindings.page_size(),
            #[cfg(test)]
            Self::Mock(mock) => mock.page_size(),
        }
    }

    fn bind_memory_to_node(&self, node: u32) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.bind_memory_to_node(node),
            #[cfg(test)]
            Self::Mock(mock) => mock.bind_memory_to_node(node),
        }
    }

    fn map_hugetlbfs(&self, directory: &Path, len: usize) -> io::Result<NonNull<u8>> {
        match self {
            Self::Target(bindings) => bindings.map_hugetlbfs(directory, len),
            #[cfg(test)]
            Self::Mock(mock) => mock.map_hugetlbfs(directory, len),
        }
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        match self {
            // SAFETY: Forwarding the caller's guarantees.
            Self::Target(bindings) => unsafe { bindings.munmap(ptr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding the caller's guarantees.
            Self::Mock(mock) => unsafe { mock.munmap(ptr, len) },
        }
    }

    fn perf_event_open(&self, attr: &PerfEventAttr) -> io::Result<OwnedFd> {
        match self {
            Self::Target(bindings) => bindings.perf_event_open(attr),
            #[cfg(test)]
            Self::Mock(mock) => mock.perf_event_open(attr),
        }
    }

    fn perf_event_ioctl(&self, fd: RawFd, request: libc::Ioctl) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.perf_event_ioctl(fd, request),
            #[cfg(test)]
            Self::Mock(mock) => mock.perf_event_ioctl(fd, request),
        }
    }

    fn read_counter(&self, fd: RawFd) -> io::Result<u64> {
        match self {
            Self::Target(bindings) => bindings.read_counter(fd),
            #[cfg(test)]
            Self::Mock(mock) => mock.read_counter(fd),
        }
    }

    fn block_termination_signals(&self) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.block_termination_signals(),
            #[cfg(test)]
            Self::Mock(mock) => mock.block_termination_signals(),
        }
    }

    fn terminate_process(&self, pid: u32) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.terminate_process(pid),
            #[cfg(test)]
            Self::Mock(mock) => mock.terminate_process(pid),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
