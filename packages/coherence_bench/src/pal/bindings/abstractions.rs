#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use libc::cpu_set_t;

use crate::counters::PerfEventAttr;

/// Bindings for FFI calls into the operating system.
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    // sched_setaffinity() for the current thread
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> io::Result<()>;

    // sched_getaffinity() for the current thread
    fn sched_getaffinity_current(&self) -> io::Result<cpu_set_t>;

    // sysconf(_SC_PAGESIZE)
    fn page_size(&self) -> usize;

    /// Restricts future allocations of the current thread to a single memory node
    /// (`set_mempolicy` with `MPOL_BIND`).
    fn bind_memory_to_node(&self, node: u32) -> io::Result<()>;

    /// Creates a file in a hugetlbfs mount, maps `len` bytes of it into the address space and
    /// unlinks the file again, so the mapping is private to this process.
    fn map_hugetlbfs(&self, directory: &Path, len: usize) -> io::Result<NonNull<u8>>;

    /// Releases a mapping created by `map_hugetlbfs()`.
    ///
    /// # Safety
    ///
    /// The caller must pass a pointer and length previously returned by/passed to
    /// `map_hugetlbfs()` and must not access the memory afterwards.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// `perf_event_open()` for the current thread on whatever processor it runs on.
    fn perf_event_open(&self, attr: &PerfEventAttr) -> io::Result<OwnedFd>;

    // ioctl() on a perf event file descriptor
    fn perf_event_ioctl(&self, fd: RawFd, request: libc::Ioctl) -> io::Result<()>;

    /// Reads the current 64-bit value of a perf event counter.
    fn read_counter(&self, fd: RawFd) -> io::Result<u64>;

    /// Blocks SIGINT and SIGTERM for the current thread.
    fn block_termination_signals(&self) -> io::Result<()>;

    /// Sends SIGTERM to the process with the given ID.
    fn terminate_process(&self, pid: u32) -> io::Result<()>;
}
