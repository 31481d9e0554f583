use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU64};
use std::{io, mem, process};

use libc::cpu_set_t;

use crate::counters::PerfEventAttr;
use crate::pal::Bindings;

// From linux/mempolicy.h, not exported by libc.
const MPOL_BIND: libc::c_int = 2;

// From linux/perf_event.h.
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;

/// Largest node index we can express in the memory policy node mask.
const MAX_NODES: usize = 1024;
const BITS_PER_WORD: usize = libc::c_ulong::BITS as usize;

/// Makes every hugetlbfs file name we create unique within the process.
static NEXT_HUGETLBFS_FILE: AtomicU64 = AtomicU64::new(0);

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

// Real OS bindings are excluded from coverage measurement because:
// 1. They are tested via integration tests running on actual Linux.
// 2. Error paths require OS-level failures that are impractical to trigger in tests.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Bindings for BuildTargetBindings {
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> io::Result<()> {
        // 0 means current thread.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::sched_setaffinity(0, size_of::<cpu_set_t>(), cpuset) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn sched_getaffinity_current(&self) -> io::Result<cpu_set_t> {
        // SAFETY: All zeroes is a valid cpu_set_t.
        let mut cpuset: cpu_set_t = unsafe { mem::zeroed() };

        // 0 means current thread.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::sched_getaffinity(0, size_of::<cpu_set_t>(), &raw mut cpuset) };

        if result == 0 {
            Ok(cpuset)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn page_size(&self) -> usize {
        // SAFETY: No safety requirements.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        // The page size query cannot fail on Linux but we stay sensible if it ever does.
        usize::try_from(result).unwrap_or(4096)
    }

    fn bind_memory_to_node(&self, node: u32) -> io::Result<()> {
        let node = node as usize;

        if node >= MAX_NODES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("memory node {node} is beyond the supported maximum of {MAX_NODES}"),
            ));
        }

        let mut mask = [0 as libc::c_ulong; MAX_NODES / BITS_PER_WORD];
        *mask
            .get_mut(node / BITS_PER_WORD)
            .expect("we verified above that the node fits into the mask") |=
            1 << (node % BITS_PER_WORD);

        // The kernel expects the number of bits in the mask plus one.
        let max_node = (MAX_NODES + 1) as libc::c_ulong;

        // SAFETY: The mask outlives the call and its bit count is passed correctly.
        let result = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                MPOL_BIND,
                mask.as_ptr(),
                max_node,
            )
        };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn map_hugetlbfs(&self, directory: &Path, len: usize) -> io::Result<NonNull<u8>> {
        let path = directory.join(format!(
            "coherence_bench.{}.{}",
            process::id(),
            NEXT_HUGETLBFS_FILE.fetch_add(1, atomic::Ordering::Relaxed)
        ));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        // SAFETY: We request a fresh mapping at an address of the kernel's choosing,
        // backed by a file descriptor we own.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        let map_error = (mapping == libc::MAP_FAILED).then(io::Error::last_os_error);

        // The mapping stays valid after the file is closed and unlinked. Nobody else can open
        // the file once it is unlinked, so the memory is exclusively ours.
        let unlink_result = fs::remove_file(&path);

        if let Some(e) = map_error {
            return Err(e);
        }

        let mapping = NonNull::new(mapping.cast::<u8>())
            .expect("mmap() never returns a null pointer on success");

        if let Err(e) = unlink_result {
            // SAFETY: We just created this mapping and nobody has seen it yet.
            _ = unsafe { self.munmap(mapping, len) };
            return Err(e);
        }

        Ok(mapping)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: Forwarding the caller's guarantees.
        let result = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn perf_event_open(&self, attr: &PerfEventAttr) -> io::Result<OwnedFd> {
        // pid 0 and cpu -1 mean "this thread, wherever it runs". No group leader.
        // SAFETY: The attribute structure outlives the call and carries its own size.
        let result = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                ptr::from_ref(attr),
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let fd = RawFd::try_from(result)
            .map_err(|_| io::Error::other("perf_event_open() returned an out of range descriptor"))?;

        // SAFETY: The kernel just handed us this descriptor and nobody else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn perf_event_ioctl(&self, fd: RawFd, request: libc::Ioctl) -> io::Result<()> {
        // SAFETY: The perf event ioctls we use take no pointer argument.
        let result = unsafe { libc::ioctl(fd, request, 0) };

        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn read_counter(&self, fd: RawFd) -> io::Result<u64> {
        let mut value: u64 = 0;

        // SAFETY: We read at most size_of::<u64>() bytes into a u64 we own.
        let result = unsafe {
            libc::read(
                fd,
                (&raw mut value).cast::<libc::c_void>(),
                size_of::<u64>(),
            )
        };

        match usize::try_from(result) {
            Ok(n) if n == size_of::<u64>() => Ok(value),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from performance counter",
            )),
            Err(_) => Err(io::Error::last_os_error()),
        }
    }

    fn block_termination_signals(&self) -> io::Result<()> {
        // SAFETY: All zeroes is a valid (if unspecified) sigset_t, initialized right below.
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };

        // SAFETY: The set is a valid sigset_t owned by us.
        unsafe {
            libc::sigemptyset(&raw mut set);
        }
        // SAFETY: As above.
        unsafe {
            libc::sigaddset(&raw mut set, libc::SIGINT);
        }
        // SAFETY: As above.
        unsafe {
            libc::sigaddset(&raw mut set, libc::SIGTERM);
        }

        // pthread_sigmask() returns the error number instead of setting errno.
        // SAFETY: The set is valid and we do not want the old mask back.
        let result = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &raw const set, ptr::null_mut()) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(result))
        }
    }

    fn terminate_process(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process ID out of range"))?;

        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
