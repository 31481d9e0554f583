//! The code executed inside the timed region and the layout of the memory it touches.

use std::fmt::Debug;
use std::hint::black_box;
use std::ptr::NonNull;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::TlbLevel;

/// The cache lines of one measured region.
///
/// Normally every line of the region is part of the plan. When restricted to a TLB level, only
/// the lines of pages that fit into that TLB at the same time are included: at most `entries`
/// pages in total and at most `ways` pages per TLB set.
#[derive(Debug)]
pub struct AccessPlan {
    base: NonNull<u8>,
    size: u64,
    line_size: usize,
    page_size: usize,

    // Byte offsets of the lines from `base`, in address order.
    lines: Vec<usize>,
}

impl AccessPlan {
    /// Lays out the lines of `size` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for as long as the plan is used,
    /// and must be aligned to at least 8 bytes. `line_size` must be at least 8.
    ///
    /// # Panics
    ///
    /// Panics if `line_size` or `page_size` is zero.
    #[must_use]
    pub unsafe fn new(
        base: NonNull<u8>,
        size: u64,
        line_size: u32,
        page_size: u64,
        tlb: Option<&TlbLevel>,
    ) -> Self {
        assert!(line_size > 0, "cache line size must be known");
        assert!(page_size > 0, "page size must be known");

        let line_size = line_size as usize;
        let page_size = usize::try_from(page_size).unwrap_or(usize::MAX);

        // A region larger than the address space cannot have been allocated.
        let region = usize::try_from(size).unwrap_or(usize::MAX);

        let lines = match tlb {
            None => (0..region).step_by(line_size).collect(),
            Some(tlb) => tlb_lines(base, region, line_size, page_size, tlb),
        };

        Self {
            base,
            size,
            line_size,
            page_size,
            lines,
        }
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Distance between consecutive lines in bytes.
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Number of lines in the plan, which is less than the region holds if restricted to a TLB
    /// level.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Whether the plan touches nothing (the region is smaller than a line).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The first byte of the `index`-th line of the plan.
    #[must_use]
    pub fn line(&self, index: usize) -> Option<NonNull<u8>> {
        let offset = *self.lines.get(index)?;

        // SAFETY: Every planned offset is within the region the caller vouched for.
        Some(unsafe { self.base.add(offset) })
    }

    /// The first byte of every line of the plan, in address order.
    pub fn lines(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.lines.iter().map(|&offset| {
            // SAFETY: Every planned offset is within the region the caller vouched for.
            unsafe { self.base.add(offset) }
        })
    }

    /// The word at `address`, if it lies on the line grid and entirely within the region.
    fn word_at(&self, address: usize) -> Option<NonNull<u8>> {
        let offset = address.checked_sub(self.base.as_ptr() as usize)?;
        let end = offset.checked_add(size_of::<usize>())?;

        if offset % self.line_size != 0 || end > usize::try_from(self.size).unwrap_or(usize::MAX) {
            return None;
        }

        // SAFETY: The offset is within the region the caller vouched for.
        Some(unsafe { self.base.add(offset) })
    }

    /// The first planned line of every page touched by the plan.
    pub fn page_heads(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let mut last_page = None;

        self.lines().filter(move |line| {
            let page = line.as_ptr() as usize / self.page_size;
            let is_new = last_page != Some(page);
            last_page = Some(page);
            is_new
        })
    }
}

fn tlb_lines(
    base: NonNull<u8>,
    region: usize,
    line_size: usize,
    page_size: usize,
    tlb: &TlbLevel,
) -> Vec<usize> {
    let sets = tlb.sets().max(1) as usize;
    let ways = tlb.ways().max(1) as usize;
    let max_pages = tlb.entries() as usize;

    let mut pages_per_set = vec![0_usize; sets];
    let mut page_count = 0;
    let mut lines = Vec::new();

    let start = base.as_ptr() as usize;
    let end = start.saturating_add(region);

    let mut page_start = start - start % page_size;

    while page_start < end && page_count < max_pages {
        let set = (page_start / page_size) % sets;
        let slot = pages_per_set
            .get_mut(set)
            .expect("set index is reduced modulo the set count");

        if *slot < ways {
            *slot += 1;
            page_count += 1;

            let from = page_start.max(start) - start;
            let to = page_start.saturating_add(page_size).min(end) - start;

            // Keep the line grid anchored at the region start.
            let first = from.div_ceil(line_size) * line_size;
            lines.extend((first..to).step_by(line_size));
        }

        page_start = page_start.saturating_add(page_size);
    }

    lines
}

/// The operation whose duration is measured.
///
/// `prepare()` runs on the thread that owns the memory, before the coherence state is set up and
/// outside the timed region. `run()` executes `access_count` accesses on the measuring thread
/// and must not be optimized away, which is why it returns a value derived from what it read.
///
/// Accesses made while setting up coherence states read and write back the first word of every
/// line, so anything `prepare()` stores there survives.
pub trait TimedPrimitive: Debug + Send + Sync {
    /// Lays out whatever the primitive needs in the planned lines.
    fn prepare(&self, plan: &AccessPlan);

    /// Performs `access_count` accesses to the planned lines.
    ///
    /// Must not rely on `prepare()` having run on this plan: the result is meaningless then, but
    /// the call has to remain sound.
    fn run(&self, plan: &AccessPlan, access_count: u64) -> u64;
}

/// Dependent loads through the planned lines in a random cyclic order.
///
/// Each line's first word holds the address of the next line, so every access has to wait for
/// the previous one and the hardware prefetchers cannot guess the pattern.
#[derive(Debug)]
pub struct PointerChase {
    seed: u64,
}

impl PointerChase {
    /// Creates a chase whose line order is shuffled with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl TimedPrimitive for PointerChase {
    fn prepare(&self, plan: &AccessPlan) {
        if plan.is_empty() {
            return;
        }

        let mut order: Vec<usize> = (1..plan.line_count()).collect();
        order.shuffle(&mut SmallRng::seed_from_u64(self.seed));

        // The chain always starts at line 0 so `run()` knows where to begin.
        let chain = std::iter::once(0).chain(order).collect::<Vec<_>>();

        for (index, &from) in chain.iter().enumerate() {
            let to = chain.get(index + 1).copied().unwrap_or(0);

            let (Some(from), Some(to)) = (plan.line(from), plan.line(to)) else {
                unreachable!("chain indexes are all below the line count");
            };

            // SAFETY: The plan's lines are valid for writes and 8-aligned.
            unsafe {
                from.cast::<usize>().write_volatile(to.as_ptr() as usize);
            }
        }
    }

    fn run(&self, plan: &AccessPlan, access_count: u64) -> u64 {
        let Some(mut cursor) = plan.line(0) else {
            return 0;
        };

        for _ in 0..access_count {
            // SAFETY: The cursor is always a line-aligned word within the region, so it is valid
            // for reads and 8-aligned.
            let next = unsafe { cursor.cast::<usize>().read_volatile() };

            // Without a chain from prepare() the word holds something else; stop there.
            let Some(next) = plan.word_at(next) else {
                break;
            };

            cursor = next;
        }

        black_box(cursor.as_ptr() as u64)
    }
}

/// Does nothing; measures the bare overhead of the timing sequence.
#[derive(Debug, Default)]
pub struct NoopPrimitive;

impl TimedPrimitive for NoopPrimitive {
    fn prepare(&self, _plan: &AccessPlan) {}

    fn run(&self, _plan: &AccessPlan, access_count: u64) -> u64 {
        black_box(access_count)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::{self, Layout};
    use std::collections::HashSet;

    use super::*;

    const PAGE: u64 = 4096;

    struct Region {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Region {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, PAGE as usize).unwrap();
            // SAFETY: Non-zero size.
            let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }

        fn plan(&self, size: u64, tlb: Option<&TlbLevel>) -> AccessPlan {
            assert!(size as usize <= self.layout.size());
            // SAFETY: The region is valid for its whole layout and outlives every plan.
            unsafe { AccessPlan::new(self.ptr, size, 64, PAGE, tlb) }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            // SAFETY: Allocated with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn plan_covers_every_line() {
        let region = Region::new(64 * 1024);
        let plan = region.plan(1000, None);

        assert_eq!(plan.line_count(), 16);
        assert_eq!(plan.size(), 1000);
        assert_eq!(plan.line(1).unwrap().as_ptr() as usize - region.ptr.as_ptr() as usize, 64);
        assert!(plan.line(16).is_none());
        assert_eq!(plan.page_heads().count(), 1);
    }

    #[test]
    fn tiny_region_has_one_line() {
        let region = Region::new(4096);
        assert_eq!(region.plan(8, None).line_count(), 1);
        assert!(region.plan(0, None).is_empty());
    }

    #[test]
    fn tlb_restriction_limits_pages() {
        let region = Region::new(64 * PAGE as usize);

        // 8 entries, fully associative.
        let plan = region.plan(64 * PAGE, Some(&TlbLevel::new(1, 8, 0)));
        assert_eq!(plan.page_heads().count(), 8);
        assert_eq!(plan.line_count(), 8 * 64);

        // 16 entries in 4 sets of 4 ways: 16 consecutive pages fill every set evenly.
        let plan = region.plan(64 * PAGE, Some(&TlbLevel::new(1, 16, 4)));
        assert_eq!(plan.page_heads().count(), 16);

        // A small region needs fewer pages than the TLB holds.
        let plan = region.plan(2 * PAGE, Some(&TlbLevel::new(1, 16, 4)));
        assert_eq!(plan.line_count(), 128);
    }

    #[test]
    fn tlb_restriction_respects_ways() {
        let region = Region::new(64 * PAGE as usize);

        // 64 entries, 2 ways: 32 sets, so at most 2 pages per set. Consecutive pages map to
        // consecutive sets, so only the first 64 pages would qualify, which is the whole region.
        let plan = region.plan(64 * PAGE, Some(&TlbLevel::new(1, 64, 2)));
        assert_eq!(plan.page_heads().count(), 64);

        // 4 entries in 1 set of 4 ways is the same as fully associative.
        let plan = region.plan(64 * PAGE, Some(&TlbLevel::new(1, 4, 4)));
        assert_eq!(plan.page_heads().count(), 4);
    }

    #[test]
    fn pointer_chase_visits_every_line_once_per_cycle() {
        let region = Region::new(64 * 1024);
        let plan = region.plan(32 * 1024, None);

        let primitive = PointerChase::new(42);
        primitive.prepare(&plan);

        let mut visited = HashSet::new();
        let mut cursor = plan.line(0).unwrap();

        for _ in 0..plan.line_count() {
            assert!(visited.insert(cursor.as_ptr() as usize));
            // SAFETY: prepare() stored valid addresses.
            cursor = NonNull::new(unsafe { cursor.cast::<usize>().read() } as *mut u8).unwrap();
        }

        assert_eq!(visited.len(), plan.line_count());
        assert_eq!(cursor, plan.line(0).unwrap());

        // A full cycle ends where it started.
        assert_eq!(
            primitive.run(&plan, plan.line_count() as u64),
            plan.line(0).unwrap().as_ptr() as u64
        );
    }

    #[test]
    fn pointer_chase_order_depends_on_seed() {
        let first = Region::new(64 * 1024);
        let second = Region::new(64 * 1024);

        let first_plan = first.plan(64 * 1024, None);
        let second_plan = second.plan(64 * 1024, None);

        PointerChase::new(1).prepare(&first_plan);
        PointerChase::new(2).prepare(&second_plan);

        // Successor of every line, relative to the region start.
        let successors = |plan: &AccessPlan, base: NonNull<u8>| {
            plan.lines()
                .map(|line| {
                    // SAFETY: prepare() stored a valid address in every planned line.
                    let next = unsafe { line.cast::<usize>().read() };
                    next - base.as_ptr() as usize
                })
                .collect::<Vec<_>>()
        };

        assert_ne!(
            successors(&first_plan, first.ptr),
            successors(&second_plan, second.ptr)
        );
    }

    #[test]
    fn pointer_chase_without_prepare_stops_at_first_line() {
        let region = Region::new(64 * 1024);
        let plan = region.plan(16 * 1024, None);
        let start = plan.line(0).unwrap().as_ptr() as u64;

        // A zeroed region holds no chain at all.
        assert_eq!(PointerChase::new(1).run(&plan, 1000), start);

        // Neither do region offsets, misaligned addresses or addresses past the end.
        let words = [
            64,
            start as usize + 8,
            start as usize + 16 * 1024,
            usize::MAX,
        ];

        for word in words {
            // SAFETY: The first line is valid for writes and 8-aligned.
            unsafe { plan.line(0).unwrap().cast::<usize>().write(word) };
            assert_eq!(PointerChase::new(1).run(&plan, 1000), start, "{word:#x}");
        }

        // A chain that leaves the plan partway is followed only while it stays inside.
        let second = plan.line(1).unwrap();
        // SAFETY: Both lines are valid for writes and 8-aligned.
        unsafe {
            plan.line(0).unwrap().cast::<usize>().write(second.as_ptr() as usize);
            second.cast::<usize>().write(0);
        }
        assert_eq!(PointerChase::new(1).run(&plan, 1000), second.as_ptr() as u64);
    }

    #[test]
    fn noop_and_empty_plans() {
        let region = Region::new(4096);
        let empty = region.plan(0, None);

        assert_eq!(NoopPrimitive.run(&empty, 5), 5);

        let chase = PointerChase::new(0);
        chase.prepare(&empty);
        assert_eq!(chase.run(&empty, 100), 0);
    }
}
