use derive_more::derive::Display;
use itertools::Itertools;

use crate::Result;
use crate::pal::{BindingsFacade, FilesystemFacade};

mod detect;

/// Operating system identifier of a logical processor.
pub type ProcessorId = u32;

/// Operating system identifier of a NUMA memory node.
pub type MemoryNodeId = u32;

/// The processor vendor, which decides which coherence states the hardware can produce.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Vendor {
    /// Intel processors (MESIF protocol, no Owned state).
    Intel,

    /// AMD processors (MOESI protocol, no Forward state).
    Amd,

    /// ARM-based processors.
    Arm,

    /// Anything we do not recognize.
    Other,
}

/// One level of the data cache hierarchy, as seen by one processor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheLevel {
    level: u8,
    size: u64,
    line_size: u32,
    associativity: u32,
    shared_by: u32,
}

impl CacheLevel {
    /// Describes a data or unified cache. `level` is 1-based; `line_size` 0 means unknown.
    #[must_use]
    pub fn new(level: u8, size: u64, line_size: u32, associativity: u32) -> Self {
        Self {
            level,
            size,
            line_size,
            associativity,
            shared_by: 1,
        }
    }

    /// Records how many logical processors share this cache.
    #[must_use]
    pub fn with_shared_by(mut self, processor_count: u32) -> Self {
        self.shared_by = processor_count.max(1);
        self
    }

    /// 1-based cache level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Cache line size in bytes, 0 if unknown.
    #[must_use]
    pub fn line_size(&self) -> u32 {
        self.line_size
    }

    /// Number of ways, 0 if unknown.
    #[must_use]
    pub fn associativity(&self) -> u32 {
        self.associativity
    }

    /// Number of logical processors sharing this cache.
    #[must_use]
    pub fn shared_by(&self) -> u32 {
        self.shared_by
    }
}

/// One level of the data translation lookaside buffer for the base page size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlbLevel {
    level: u8,
    entries: u32,
    associativity: u32,
}

impl TlbLevel {
    /// Describes a TLB level. An associativity of 0 means fully associative.
    #[must_use]
    pub fn new(level: u8, entries: u32, associativity: u32) -> Self {
        Self {
            level,
            entries,
            associativity,
        }
    }

    /// 1-based TLB level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Number of pages this level can translate.
    #[must_use]
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Number of ways, 0 for fully associative.
    #[must_use]
    pub fn associativity(&self) -> u32 {
        self.associativity
    }

    /// Number of sets that page numbers are distributed over.
    #[must_use]
    pub fn sets(&self) -> u32 {
        if self.associativity == 0 || self.associativity >= self.entries {
            1
        } else {
            self.entries / self.associativity
        }
    }

    /// How many pages fit into one set.
    #[must_use]
    pub fn ways(&self) -> u32 {
        self.entries / self.sets()
    }
}

/// A logical processor and where it sits in the system.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Processor {
    id: ProcessorId,
    core_id: u32,
    package_id: u32,
    memory_node: MemoryNodeId,
    allowed: bool,
}

impl Processor {
    /// Describes a processor the current process may be bound to.
    #[must_use]
    pub fn new(id: ProcessorId, core_id: u32, package_id: u32, memory_node: MemoryNodeId) -> Self {
        Self {
            id,
            core_id,
            package_id,
            memory_node,
            allowed: true,
        }
    }

    /// Marks whether the current process may bind threads to this processor.
    #[must_use]
    pub fn with_allowed(mut self, allowed: bool) -> Self {
        self.allowed = allowed;
        self
    }

    /// Operating system processor ID.
    #[must_use]
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Physical core ID, unique within a package.
    #[must_use]
    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// Physical package (socket) ID.
    #[must_use]
    pub fn package_id(&self) -> u32 {
        self.package_id
    }

    /// Memory node closest to this processor.
    #[must_use]
    pub fn memory_node(&self) -> MemoryNodeId {
        self.memory_node
    }

    /// Whether the current process may bind threads to this processor.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Hardware facts the measurement depends on: clock rate, cache and TLB geometry and the
/// processor layout.
///
/// Obtain one from [`Topology::detect()`] on a real system or assemble one with
/// [`Topology::builder()`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    clock_rate: u64,
    vendor: Vendor,

    // Sorted by level, at most one entry per level.
    caches: Vec<CacheLevel>,

    // Sorted by level, at most one entry per level.
    tlbs: Vec<TlbLevel>,

    page_size: u64,
    huge_page_size: Option<u64>,

    // Sorted by ID.
    processors: Vec<Processor>,
}

impl Topology {
    /// Inspects the current system.
    ///
    /// The clock rate is calibrated by watching the cycle counter for a short period, so this
    /// takes roughly a tenth of a second.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedState`][crate::Error::UnsupportedState] if no processors or no
    /// data caches can be found.
    pub fn detect() -> Result<Self> {
        detect::detect(
            &FilesystemFacade::target(),
            &BindingsFacade::target(),
            crate::arch::clock_rate(),
        )
    }

    /// Starts assembling a topology by hand.
    #[must_use]
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Cycle counter ticks per second.
    #[must_use]
    pub fn clock_rate(&self) -> u64 {
        self.clock_rate
    }

    /// The processor vendor.
    #[must_use]
    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Data and unified cache levels, innermost first.
    #[must_use]
    pub fn cache_levels(&self) -> &[CacheLevel] {
        &self.caches
    }

    /// A specific cache level, if the hardware has it.
    #[must_use]
    pub fn cache_level(&self, level: u8) -> Option<&CacheLevel> {
        self.caches.iter().find(|c| c.level == level)
    }

    /// Data TLB levels, innermost first.
    #[must_use]
    pub fn tlb_levels(&self) -> &[TlbLevel] {
        &self.tlbs
    }

    /// A specific TLB level, if known.
    #[must_use]
    pub fn tlb_level(&self, level: u8) -> Option<&TlbLevel> {
        self.tlbs.iter().find(|t| t.level == level)
    }

    /// The base page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The default huge page size in bytes, if huge pages are supported.
    #[must_use]
    pub fn huge_page_size(&self) -> Option<u64> {
        self.huge_page_size
    }

    /// All processors in the system, by ascending ID.
    #[must_use]
    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    /// A specific processor.
    #[must_use]
    pub fn processor(&self, id: ProcessorId) -> Option<&Processor> {
        self.processors
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .and_then(|index| self.processors.get(index))
    }

    /// Whether the current process may bind a thread to the processor.
    #[must_use]
    pub fn is_allowed(&self, id: ProcessorId) -> bool {
        self.processor(id).is_some_and(Processor::is_allowed)
    }

    /// The processors the current process may bind threads to.
    pub fn allowed_processors(&self) -> impl Iterator<Item = &Processor> {
        self.processors.iter().filter(|p| p.allowed)
    }

    /// Number of distinct physical packages.
    #[must_use]
    pub fn package_count(&self) -> usize {
        self.processors.iter().map(|p| p.package_id).unique().count()
    }

    /// Number of distinct physical cores.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.processors
            .iter()
            .map(|p| (p.package_id, p.core_id))
            .unique()
            .count()
    }

    pub(crate) fn set_clock_rate(&mut self, clock_rate: u64) {
        self.clock_rate = clock_rate;
    }

    /// Overrides the size of a cache level, adding the level if it was not detected.
    pub(crate) fn set_cache_size(&mut self, level: u8, size: u64) {
        if let Some(cache) = self.caches.iter_mut().find(|c| c.level == level) {
            cache.size = size;
        } else {
            self.caches.push(CacheLevel::new(level, size, 0, 0));
            self.caches.sort_by_key(|c| c.level);
        }
    }

    /// Overrides the line size of every cache level.
    pub(crate) fn set_line_size(&mut self, line_size: u32) {
        for cache in &mut self.caches {
            cache.line_size = line_size;
        }
    }

    /// Replaces the geometry of a TLB level, adding the level if it was not detected.
    pub(crate) fn set_tlb_level(&mut self, level: u8, entries: u32, associativity: u32) {
        self.tlbs.retain(|t| t.level != level);
        self.tlbs.push(TlbLevel::new(level, entries, associativity));
        self.tlbs.sort_by_key(|t| t.level);
    }
}

/// Assembles a [`Topology`] from known facts, for tests and for systems where detection does
/// not work.
#[derive(Debug)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    fn new() -> Self {
        Self {
            topology: Topology {
                clock_rate: 1_000_000_000,
                vendor: Vendor::Other,
                caches: Vec::new(),
                tlbs: Vec::new(),
                page_size: 4096,
                huge_page_size: None,
                processors: Vec::new(),
            },
        }
    }

    /// Cycle counter ticks per second. Defaults to 1 GHz.
    #[must_use]
    pub fn clock_rate(mut self, clock_rate: u64) -> Self {
        self.topology.clock_rate = clock_rate;
        self
    }

    /// Defaults to [`Vendor::Other`].
    #[must_use]
    pub fn vendor(mut self, vendor: Vendor) -> Self {
        self.topology.vendor = vendor;
        self
    }

    /// Adds or replaces a cache level.
    #[must_use]
    pub fn cache(mut self, cache: CacheLevel) -> Self {
        self.topology.caches.retain(|c| c.level != cache.level);
        self.topology.caches.push(cache);
        self.topology.caches.sort_by_key(|c| c.level);
        self
    }

    /// Adds or replaces a TLB level.
    #[must_use]
    pub fn tlb(mut self, tlb: TlbLevel) -> Self {
        self.topology.tlbs.retain(|t| t.level != tlb.level);
        self.topology.tlbs.push(tlb);
        self.topology.tlbs.sort_by_key(|t| t.level);
        self
    }

    /// Base page size in bytes. Defaults to 4096.
    #[must_use]
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.topology.page_size = page_size;
        self
    }

    /// Huge page size in bytes. Defaults to none (huge pages unsupported).
    #[must_use]
    pub fn huge_page_size(mut self, huge_page_size: u64) -> Self {
        self.topology.huge_page_size = Some(huge_page_size);
        self
    }

    /// Adds or replaces a processor.
    #[must_use]
    pub fn processor(mut self, processor: Processor) -> Self {
        self.topology.processors.retain(|p| p.id != processor.id);
        self.topology.processors.push(processor);
        self.topology.processors.sort_by_key(|p| p.id);
        self
    }

    /// Builds the topology.
    #[must_use]
    pub fn build(self) -> Topology {
        self.topology
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn two_package_topology() -> Topology {
        Topology::builder()
            .vendor(Vendor::Amd)
            .cache(CacheLevel::new(2, 512 * 1024, 64, 8))
            .cache(CacheLevel::new(1, 32 * 1024, 64, 8))
            .processor(Processor::new(3, 1, 1, 1))
            .processor(Processor::new(0, 0, 0, 0))
            .processor(Processor::new(1, 0, 0, 0))
            .processor(Processor::new(2, 0, 1, 1).with_allowed(false))
            .build()
    }

    #[test]
    fn builder_orders_levels_and_processors() {
        let topology = two_package_topology();

        assert_eq!(
            topology
                .cache_levels()
                .iter()
                .map(CacheLevel::level)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            topology
                .processors()
                .iter()
                .map(Processor::id)
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn processor_queries() {
        let topology = two_package_topology();

        assert!(topology.is_allowed(0));
        assert!(!topology.is_allowed(2));
        assert!(!topology.is_allowed(99));
        assert_eq!(topology.allowed_processors().count(), 3);
        assert_eq!(topology.package_count(), 2);
        assert_eq!(topology.core_count(), 3);
        assert_eq!(topology.processor(3).map(Processor::memory_node), Some(1));
    }

    #[test]
    fn overrides_replace_or_add_levels() {
        let mut topology = two_package_topology();

        topology.set_cache_size(1, 48 * 1024);
        topology.set_cache_size(3, 8 * 1024 * 1024);
        topology.set_line_size(128);
        topology.set_tlb_level(1, 64, 4);

        assert_eq!(topology.cache_level(1).map(CacheLevel::size), Some(48 * 1024));
        assert_eq!(topology.cache_level(3).map(CacheLevel::line_size), Some(128));
        assert_eq!(topology.tlb_level(1).map(TlbLevel::sets), Some(16));
    }

    #[test]
    fn tlb_geometry() {
        assert_eq!(TlbLevel::new(1, 64, 0).sets(), 1);
        assert_eq!(TlbLevel::new(1, 64, 0).ways(), 64);
        assert_eq!(TlbLevel::new(2, 1536, 6).sets(), 256);
        assert_eq!(TlbLevel::new(2, 1536, 6).ways(), 6);
        assert_eq!(TlbLevel::new(1, 8, 16).sets(), 1);
    }
}
