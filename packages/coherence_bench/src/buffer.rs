use std::alloc::{self, Layout};
use std::io;
use std::path::Path;
use std::ptr::NonNull;

use tracing::debug;

use crate::pal::{Bindings, BindingsFacade};
use crate::{Error, Result, arch};

/// A block of memory owned by one worker, either a test buffer or a flush buffer.
///
/// After allocation every 8-byte word holds its own byte offset and the whole buffer has been
/// evicted from the caches, so the first access of a measurement always starts from memory.
///
/// The memory is only ever accessed through raw pointers. Which thread touches it when is
/// coordinated by the phase barrier, not by the type system.
#[derive(Debug)]
pub(crate) struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Heap(Layout),
    HugePages(BindingsFacade),
}

// SAFETY: The buffer is plain memory without thread affinity. We only hand out raw pointers to
// it and accesses through those are ordered by the phase barrier.
unsafe impl Send for Buffer {}
// SAFETY: See above.
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates a buffer from the current thread's memory policy, fills it and flushes it.
    ///
    /// With `hugetlbfs` set, the memory comes from a file in that directory instead of the heap
    /// and `len` must be a whole number of huge pages.
    pub(crate) fn allocate(
        what: &str,
        len: u64,
        alignment: u64,
        line_size: u32,
        hugetlbfs: Option<&Path>,
        bindings: &BindingsFacade,
    ) -> Result<Self> {
        let resource_error = |source| Error::resource(format!("{what} ({len} bytes)"), source);

        let len = usize::try_from(len)
            .map_err(|_| resource_error(io::Error::from(io::ErrorKind::OutOfMemory)))?;
        let alignment = usize::try_from(alignment.max(size_of::<u64>() as u64))
            .map_err(|_| resource_error(io::Error::from(io::ErrorKind::InvalidInput)))?;

        if len == 0 {
            return Err(resource_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized buffer",
            )));
        }

        let mut buffer = match hugetlbfs {
            Some(directory) => {
                let ptr = bindings
                    .map_hugetlbfs(directory, len)
                    .map_err(resource_error)?;

                Self {
                    ptr,
                    len,
                    backing: Backing::HugePages(bindings.clone()),
                }
            }
            None => {
                let layout = Layout::from_size_align(len, alignment).map_err(|e| {
                    resource_error(io::Error::new(io::ErrorKind::InvalidInput, e))
                })?;

                // SAFETY: The layout has a non-zero size, checked above.
                let ptr = unsafe { alloc::alloc(layout) };

                let ptr = NonNull::new(ptr)
                    .ok_or_else(|| resource_error(io::Error::from(io::ErrorKind::OutOfMemory)))?;

                Self {
                    ptr,
                    len,
                    backing: Backing::Heap(layout),
                }
            }
        };

        buffer.fill();
        buffer.flush(line_size);

        debug!(what, len, hugepages = hugetlbfs.is_some(), "allocated buffer");

        Ok(buffer)
    }

    /// Writes the byte offset of every 8-byte word into that word.
    fn fill(&mut self) {
        let words = self.len / size_of::<u64>();
        let base = self.ptr.as_ptr().cast::<u64>();

        for word in 0..words {
            // SAFETY: The word lies within the allocation and the base is at least 8-aligned
            // (heap layouts are, and mappings are page-aligned).
            unsafe {
                base.add(word).write((word * size_of::<u64>()) as u64);
            }
        }
    }

    /// Evicts every line of the buffer from the whole cache hierarchy, if the architecture can.
    fn flush(&self, line_size: u32) {
        if !arch::LINE_FLUSH_AVAILABLE || line_size == 0 {
            return;
        }

        for offset in (0..self.len).step_by(line_size as usize) {
            // SAFETY: The offset lies within our allocation.
            unsafe {
                arch::flush_line(self.ptr.as_ptr().add(offset));
            }
        }

        arch::memory_fence();
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match &self.backing {
            // SAFETY: Allocated above with exactly this layout.
            Backing::Heap(layout) => unsafe { alloc::dealloc(self.ptr.as_ptr(), *layout) },
            Backing::HugePages(bindings) => {
                // SAFETY: Mapped above with exactly this length and nobody uses it anymore.
                if let Err(e) = unsafe { bindings.munmap(self.ptr, self.len) } {
                    tracing::warn!("could not unmap huge page buffer: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::MockBindings;

    assert_impl_all!(Buffer: Send, Sync);

    #[test]
    fn heap_buffer_is_aligned_and_filled() {
        let bindings = BindingsFacade::from_mock(MockBindings::new());
        let buffer = Buffer::allocate("test buffer", 4096 + 16, 4096, 64, None, &bindings).unwrap();

        assert_eq!(buffer.len(), 4096 + 16);
        assert_eq!(buffer.as_ptr() as usize % 4096, 0);

        for word in [0_usize, 1, 100, 513] {
            // SAFETY: Within the buffer and aligned.
            let value = unsafe { buffer.as_ptr().cast::<u64>().add(word).read() };
            assert_eq!(value, (word * 8) as u64);
        }
    }

    #[test]
    fn zero_size_is_resource_error() {
        let bindings = BindingsFacade::from_mock(MockBindings::new());
        let error = Buffer::allocate("test buffer", 0, 64, 64, None, &bindings).unwrap_err();

        assert!(matches!(error, Error::ResourceExhaustion { .. }));
        assert_eq!(error.exit_code(), 127);
    }

    #[test]
    fn hugetlbfs_failure_is_resource_error() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_map_hugetlbfs()
            .withf(|directory, len| directory == Path::new("/mnt/huge") && *len == 2 * 1024 * 1024)
            .times(1)
            .returning(|_, _| Err(io::Error::from_raw_os_error(libc::ENOMEM)));

        let error = Buffer::allocate(
            "test buffer",
            2 * 1024 * 1024,
            64,
            64,
            Some(Path::new("/mnt/huge")),
            &BindingsFacade::from_mock(bindings),
        )
        .unwrap_err();

        assert!(matches!(error, Error::ResourceExhaustion { .. }));
    }

    #[test]
    fn hugetlbfs_mapping_is_released_on_drop() {
        const LEN: usize = 8192;

        // Stands in for the mapping the kernel would give us.
        let layout = Layout::from_size_align(LEN, 4096).unwrap();
        // SAFETY: Non-zero size.
        let memory = NonNull::new(unsafe { alloc::alloc(layout) }).unwrap();
        let address = memory.as_ptr() as usize;

        let mut bindings = MockBindings::new();
        bindings
            .expect_map_hugetlbfs()
            .times(1)
            .returning(move |_, _| Ok(NonNull::new(address as *mut u8).unwrap()));
        bindings
            .expect_munmap()
            .withf(move |ptr, len| ptr.as_ptr() as usize == address && *len == LEN)
            .times(1)
            .returning(|_, _| Ok(()));

        let buffer = Buffer::allocate(
            "test buffer",
            LEN as u64,
            64,
            64,
            Some(Path::new("/mnt/huge")),
            &BindingsFacade::from_mock(bindings),
        )
        .unwrap();

        // SAFETY: Within the buffer and aligned.
        assert_eq!(unsafe { buffer.as_ptr().cast::<u64>().add(3).read() }, 24);
        drop(buffer);

        // SAFETY: Allocated above with this layout; the mock did not free it.
        unsafe { alloc::dealloc(memory.as_ptr(), layout) };
    }
}
