use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use derive_more::derive::Display;
use itertools::Itertools;
use nonempty::NonEmpty;
use tracing::{info, warn};

use crate::binding_list::{parse_ordered, parse_processors};
use crate::counters::CounterEvent;
use crate::{
    CacheLevel, ConfigProblems, Error, MemoryNodeId, ParameterStore, ProblemSchedule,
    ProcessorId, Result, TlbLevel, Topology, Vendor,
};

/// Extra bytes at the end of every test buffer, so accesses right at the end of the largest
/// problem size stay in bounds.
const BUFFER_PADDING: u64 = 2 * size_of::<u64>() as u64;

/// Used when huge pages are requested and the topology does not say how large they are.
const DEFAULT_HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

const DEFAULT_HUGEPAGE_DIR: &str = "/mnt/huge";
const DEFAULT_INIT_TIMEOUT_SECONDS: u64 = 10;
const MAX_FLUSH_EXTRA: u32 = 1000;

/// Cache levels that can be selected for flushing.
const FLUSHABLE_LEVELS: [u8; 4] = [1, 2, 3, 4];

/// The cache coherence state a buffer's lines are put into before the timed accesses.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum CoherenceMode {
    /// Written by the owning processor; no other processor holds a copy.
    #[display("M")]
    Modified,

    /// Read by the owning processor; no other processor holds a copy.
    #[display("E")]
    Exclusive,

    /// Read by the owner and then by at least one sharing processor.
    #[display("S")]
    Shared,

    /// Written by a sharing processor after the owner last touched it.
    #[display("I")]
    Invalid,

    /// Written by the owner and then read by sharing processors (MOESI only).
    #[display("O")]
    Owned,

    /// Read by the owner and then by the sharing processors in order; the last reader holds the
    /// forwarding copy (MESIF only).
    #[display("F")]
    Forward,

    /// Read by the owner only, for data that is never written.
    #[display("R")]
    ReadOnly,

    /// Written once by a sharing processor and then read by the owner.
    #[display("U")]
    MustUseOnceWritten,

    /// No coherence access at all.
    #[display("D")]
    Disabled,
}

impl CoherenceMode {
    /// Whether establishing this state needs at least one sharing processor.
    #[must_use]
    pub fn requires_sharers(self) -> bool {
        matches!(
            self,
            Self::Shared | Self::Owned | Self::Forward | Self::MustUseOnceWritten
        )
    }

    /// Whether the vendor's coherence protocol has this state.
    #[must_use]
    pub fn is_supported_by(self, vendor: Vendor) -> bool {
        match vendor {
            Vendor::Intel => !matches!(self, Self::Owned | Self::MustUseOnceWritten),
            Vendor::Amd => self != Self::Forward,
            _ => true,
        }
    }
}

impl FromStr for CoherenceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "M" => Ok(Self::Modified),
            "E" => Ok(Self::Exclusive),
            "S" => Ok(Self::Shared),
            "I" => Ok(Self::Invalid),
            "O" => Ok(Self::Owned),
            "F" => Ok(Self::Forward),
            "R" => Ok(Self::ReadOnly),
            "U" => Ok(Self::MustUseOnceWritten),
            "D" => Ok(Self::Disabled),
            other => Err(format!(
                "unknown coherence mode '{other}', expected one of M, E, S, I, O, F, R, U, D"
            )),
        }
    }
}

/// Order in which the flush buffer is walked.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum FlushOrder {
    /// From the start of the buffer to the end.
    #[display("FIFO")]
    Fifo,

    /// From the end of the buffer to the start.
    #[display("LIFO")]
    Lifo,
}

impl FromStr for FlushOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FIFO" => Ok(Self::Fifo),
            "LIFO" => Ok(Self::Lifo),
            other => Err(format!("unknown flush order '{other}', expected FIFO or LIFO")),
        }
    }
}

/// Which memory node each worker allocates its memory from.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum MemoryPolicy {
    /// Every worker uses the node of worker 0.
    #[display("G")]
    Global,

    /// Every worker uses the node of its own processor.
    #[display("L")]
    Local,

    /// Every worker uses the node of the processor listed for it in `MEM_BIND`.
    #[display("B")]
    Explicit,
}

impl FromStr for MemoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "G" => Ok(Self::Global),
            "L" => Ok(Self::Local),
            "B" => Ok(Self::Explicit),
            other => Err(format!("unknown allocation policy '{other}', expected G, L or B")),
        }
    }
}

/// Whether workers share one flush buffer or each has its own.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum FlushBufferScope {
    /// One buffer touched by every worker.
    #[display("G")]
    Global,

    /// One private buffer per worker.
    #[display("T")]
    PerThread,
}

impl FromStr for FlushBufferScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "G" => Ok(Self::Global),
            "T" => Ok(Self::PerThread),
            other => Err(format!("unknown flush buffer scope '{other}', expected G or T")),
        }
    }
}

/// Bitmask of enabled behaviors, shared with every worker.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Settings(u32);

impl Settings {
    /// Compensate measured cycles for the timing loop overhead.
    pub const LOOP_OVERHEAD_COMPENSATION: Self = Self(0x100);

    /// Worker 0 flushes its caches before accessing another worker's buffer.
    pub const FLUSH_CPU0: Self = Self(0x200);

    /// Timed accesses are limited to the pages that fit into the selected TLB level.
    pub const RESTRICT_TLB: Self = Self(0x400);

    /// Buffers are backed by huge pages.
    pub const HUGEPAGES: Self = Self(0x800);

    /// Flush the given cache level (1-based) before timing.
    #[must_use]
    pub const fn flush(level: u8) -> Self {
        Self(1 << (level - 1))
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// Everything a measurement session needs to know, validated once and never changed.
///
/// Workers `0..result_count()` are the processors of `CPU_LIST`; worker 0 is the thread that
/// drives the measurement. The sharing processors of `SHARED_CPU_LIST` follow as additional
/// workers that only ever help establish coherence states.
#[derive(Clone, Debug)]
pub struct RunConfig {
    topology: Topology,
    schedule: ProblemSchedule,

    result_processors: NonEmpty<ProcessorId>,
    sharing_processors: Vec<ProcessorId>,

    // One per worker, in worker order.
    memory_nodes: Vec<MemoryNodeId>,
    memory_policy: MemoryPolicy,

    hugepage_dir: PathBuf,
    alignment: u64,
    offset: u64,
    accesses: u64,
    runs: NonZero<u32>,

    tlb_level: Option<TlbLevel>,

    // Selected levels that exist on this hardware, innermost first.
    flush_levels: Vec<CacheLevel>,
    flush_mode: CoherenceMode,
    flush_accesses: u32,
    flush_buffer_scope: FlushBufferScope,
    flush_order: FlushOrder,
    flush_extra: u32,
    flush_sharing_processors: bool,
    line_flush: bool,

    use_mode: CoherenceMode,
    use_accesses: u32,
    code_prefetch: bool,

    timeout: Duration,
    init_timeout: Duration,

    counters: Vec<CounterEvent>,

    settings: Settings,
}

impl RunConfig {
    /// Validates the parameters against the hardware and builds the configuration.
    ///
    /// Cache geometry and clock rate parameters (`L1_SIZE`..`L4_SIZE`, `CACHELINE_SIZE`,
    /// `CPU_FREQUENCY`, `TLB_ENTRIES`, `TLB_SETS`) override what `topology` says.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] listing every missing or malformed parameter, or
    /// [`Error::UnsupportedState`] if the parameters are valid but ask for something the hardware
    /// cannot do.
    pub fn new(store: &ParameterStore, mut topology: Topology) -> Result<Self> {
        let mut problems = ConfigProblems::default();

        apply_topology_overrides(store, &mut topology, &mut problems);

        if topology.clock_rate() == 0 {
            problems.push(
                "CPU_FREQUENCY",
                "the clock rate could not be determined, set it explicitly",
            );
        }

        let schedule = parse_schedule(store, &mut problems);

        let result_processors =
            processor_list(store, "CPU_LIST", &topology, &mut problems).or_else(|| {
                store.get("CPU_LIST").is_none().then(|| {
                    topology
                        .allowed_processors()
                        .map(|p| p.id())
                        .collect::<Vec<_>>()
                })
            });

        let result_processors = match result_processors.and_then(NonEmpty::from_vec) {
            Some(list) => Some(list),
            None => {
                problems.push("CPU_LIST", "no usable processors selected");
                None
            }
        };

        let mut sharing_processors =
            processor_list(store, "SHARED_CPU_LIST", &topology, &mut problems).unwrap_or_default();

        if let Some(result_processors) = &result_processors {
            let before = sharing_processors.len();
            sharing_processors.retain(|id| !result_processors.contains(id));

            if sharing_processors.len() != before {
                warn!("SHARED_CPU_LIST entries that are also in CPU_LIST are ignored");
            }
        }

        let memory_policy: Option<MemoryPolicy> = store.required("ALLOC", &mut problems);

        let mut hugepages = store.required_flag("HUGEPAGES", &mut problems);
        let hugepage_dir = store
            .get("HUGEPAGE_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_HUGEPAGE_DIR), PathBuf::from);

        if hugepages && topology.huge_page_size().is_none() {
            warn!("huge pages are not available on this system, using regular pages");
            hugepages = false;
        }

        let alignment: Option<u64> = store.required("ALIGNMENT", &mut problems);
        if let Some(alignment) = alignment
            && !alignment.is_power_of_two()
        {
            problems.push("ALIGNMENT", format!("{alignment} is not a power of two"));
        }

        let offset: Option<u64> = store.required("OFFSET", &mut problems);
        if let Some(offset) = offset
            && offset % 8 != 0
        {
            problems.push("OFFSET", format!("{offset} is not a multiple of 8"));
        }

        let accesses = positive::<u64>(store, "ACCESSES", None, &mut problems);
        let runs = positive::<u32>(store, "RUNS", Some(1), &mut problems).and_then(NonZero::new);

        let tlb_mode: Option<u8> = store.required("TLB_MODE", &mut problems);

        let flush_selection = FLUSHABLE_LEVELS
            .iter()
            .map(|&level| (level, store.required_flag(&format!("FLUSH_L{level}"), &mut problems)))
            .collect_vec();

        let flush_mode = store.or_default("FLUSH_MODE", CoherenceMode::Exclusive, &mut problems);
        if !matches!(
            flush_mode,
            CoherenceMode::Modified
                | CoherenceMode::Exclusive
                | CoherenceMode::Invalid
                | CoherenceMode::ReadOnly
        ) {
            problems.push("FLUSH_MODE", format!("mode {flush_mode} is not one of M, E, I, R"));
        }

        let flush_accesses = positive::<u32>(store, "FLUSH_ACCESSES", Some(1), &mut problems);
        let flush_buffer_scope =
            store.or_default("FLUSH_BUFFER", FlushBufferScope::PerThread, &mut problems);
        let flush_order = store.or_default("FLUSH_ORDER", FlushOrder::Fifo, &mut problems);

        let flush_extra: u32 = store.or_default("FLUSH_EXTRA", 0, &mut problems);
        if flush_extra > MAX_FLUSH_EXTRA {
            problems.push(
                "FLUSH_EXTRA",
                format!("{flush_extra} exceeds the maximum of {MAX_FLUSH_EXTRA}"),
            );
        }

        let flush_sharing_processors = store.flag("FLUSH_SHARED_CPU", false, &mut problems);
        let always_flush_cpu0 = store.flag("ALWAYS_FLUSH_CPU0", false, &mut problems);
        let line_flush = !store.flag("DISABLE_CLFLUSH", true, &mut problems);

        let use_mode = store.or_default("USE_MODE", CoherenceMode::Exclusive, &mut problems);
        let use_accesses = positive::<u32>(store, "USE_ACCESSES", Some(1), &mut problems);
        let code_prefetch = store.flag("ENABLE_CODE_PREFETCH", false, &mut problems);

        let loop_overhead_compensation = match store.get("LOOP_OVERHEAD_COMPENSATION") {
            None | Some("disabled") => false,
            Some("enabled") => true,
            Some(other) => {
                problems.push(
                    "LOOP_OVERHEAD_COMPENSATION",
                    format!("invalid value '{other}', expected enabled or disabled"),
                );
                false
            }
        };

        let timeout = Duration::from_secs(store.or_default("TIMEOUT", 0, &mut problems));
        let init_timeout = Duration::from_secs(
            positive::<u64>(
                store,
                "INIT_TIMEOUT",
                Some(DEFAULT_INIT_TIMEOUT_SECONDS),
                &mut problems,
            )
            .unwrap_or(DEFAULT_INIT_TIMEOUT_SECONDS),
        );

        let counters = parse_counters(store, &mut problems);

        let memory_nodes = match (&result_processors, memory_policy) {
            (Some(result_processors), Some(policy)) => memory_nodes(
                store,
                policy,
                result_processors,
                &sharing_processors,
                &topology,
                &mut problems,
            ),
            _ => Vec::new(),
        };

        // Everything below needs valid parameters, so this is where configuration errors stop us.
        problems.into_result()?;

        let (
            Some(schedule),
            Some(result_processors),
            Some(memory_policy),
            Some(alignment),
            Some(offset),
            Some(accesses),
            Some(runs),
            Some(tlb_mode),
            Some(flush_accesses),
            Some(use_accesses),
        ) = (
            schedule,
            result_processors,
            memory_policy,
            alignment,
            offset,
            accesses,
            runs,
            tlb_mode,
            flush_accesses,
            use_accesses,
        )
        else {
            unreachable!("every missing value has been reported as a configuration problem");
        };

        let tlb_level = match tlb_mode {
            0 => None,
            level => Some(topology.tlb_level(level).cloned().ok_or_else(|| {
                Error::unsupported(format!(
                    "TLB_MODE {level} selects a TLB level this system does not describe"
                ))
            })?),
        };

        let mut flush_levels = Vec::new();
        for (level, selected) in flush_selection {
            if !selected {
                continue;
            }

            let Some(cache) = topology.cache_level(level) else {
                warn!("FLUSH_L{level} is set but this system has no level {level} cache, ignoring");
                continue;
            };

            if cache.line_size() == 0 {
                return Err(Error::unsupported(format!(
                    "unknown cache line size for the L{level} cache, set CACHELINE_SIZE"
                )));
            }

            flush_levels.push(cache.clone());
        }

        for (key, mode) in [("USE_MODE", use_mode), ("FLUSH_MODE", flush_mode)] {
            check_mode_supported(key, mode, &topology, &sharing_processors)?;
        }

        let mut settings = Settings::default();
        for cache in &flush_levels {
            settings.insert(Settings::flush(cache.level()));
        }
        if loop_overhead_compensation {
            settings.insert(Settings::LOOP_OVERHEAD_COMPENSATION);
        }
        if always_flush_cpu0 {
            settings.insert(Settings::FLUSH_CPU0);
        }
        if tlb_level.is_some() {
            settings.insert(Settings::RESTRICT_TLB);
        }
        if hugepages {
            settings.insert(Settings::HUGEPAGES);
        }

        Ok(Self {
            topology,
            schedule,
            result_processors,
            sharing_processors,
            memory_nodes,
            memory_policy,
            hugepage_dir,
            alignment,
            offset,
            accesses,
            runs,
            tlb_level,
            flush_levels,
            flush_mode,
            flush_accesses,
            flush_buffer_scope,
            flush_order,
            flush_extra,
            flush_sharing_processors,
            line_flush,
            use_mode,
            use_accesses,
            code_prefetch,
            timeout,
            init_timeout,
            counters,
            settings,
        })
    }

    /// The hardware description, including any overrides from the parameters.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The problem sizes to visit.
    #[must_use]
    pub fn schedule(&self) -> &ProblemSchedule {
        &self.schedule
    }

    /// Total number of worker threads, including worker 0 and the sharing workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.result_processors.len() + self.sharing_processors.len()
    }

    /// Number of workers whose memory is measured, i.e. the length of `CPU_LIST`.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.result_processors.len()
    }

    /// Index of the first sharing worker.
    #[must_use]
    pub fn first_sharing_worker(&self) -> usize {
        self.result_processors.len()
    }

    /// Number of sharing workers.
    #[must_use]
    pub fn sharing_count(&self) -> usize {
        self.sharing_processors.len()
    }

    /// The processor a worker is pinned to.
    #[must_use]
    pub fn worker_processor(&self, worker: usize) -> Option<ProcessorId> {
        self.result_processors
            .iter()
            .chain(&self.sharing_processors)
            .nth(worker)
            .copied()
    }

    /// The memory node a worker allocates from.
    #[must_use]
    pub fn worker_memory_node(&self, worker: usize) -> Option<MemoryNodeId> {
        self.memory_nodes.get(worker).copied()
    }

    /// How memory nodes were assigned to workers.
    #[must_use]
    pub fn memory_policy(&self) -> MemoryPolicy {
        self.memory_policy
    }

    /// Whether buffers are backed by huge pages.
    #[must_use]
    pub fn hugepages(&self) -> bool {
        self.settings.contains(Settings::HUGEPAGES)
    }

    /// The hugetlbfs mount used for huge page backed buffers.
    #[must_use]
    pub fn hugepage_dir(&self) -> &Path {
        &self.hugepage_dir
    }

    /// Alignment of the measured region within the test buffer.
    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Offset of the measured region after alignment.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of timed accesses per run.
    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    /// Repetitions per problem size. The smallest valid sample is reported.
    #[must_use]
    pub fn runs(&self) -> NonZero<u32> {
        self.runs
    }

    /// The TLB level the timed accesses are restricted to.
    #[must_use]
    pub fn tlb_level(&self) -> Option<&TlbLevel> {
        self.tlb_level.as_ref()
    }

    /// The cache levels flushed before timing, innermost first.
    #[must_use]
    pub fn flush_levels(&self) -> &[CacheLevel] {
        &self.flush_levels
    }

    /// State the data is placed in before the flush.
    #[must_use]
    pub fn flush_mode(&self) -> CoherenceMode {
        self.flush_mode
    }

    /// Repetitions of the placement access.
    #[must_use]
    pub fn flush_accesses(&self) -> u32 {
        self.flush_accesses
    }

    /// Whether workers share one flush buffer.
    #[must_use]
    pub fn flush_buffer_scope(&self) -> FlushBufferScope {
        self.flush_buffer_scope
    }

    /// Walk order of the flush buffer.
    #[must_use]
    pub fn flush_order(&self) -> FlushOrder {
        self.flush_order
    }

    /// Extra flush size in percent.
    #[must_use]
    pub fn flush_extra(&self) -> u32 {
        self.flush_extra
    }

    /// Whether sharing workers flush their caches after establishing the coherence state.
    #[must_use]
    pub fn flush_sharing_processors(&self) -> bool {
        self.flush_sharing_processors
    }

    /// Whether line flush instructions are used in addition to the flush buffer.
    #[must_use]
    pub fn line_flush(&self) -> bool {
        self.line_flush
    }

    /// The coherence state established before timing.
    #[must_use]
    pub fn use_mode(&self) -> CoherenceMode {
        self.use_mode
    }

    /// Repetitions of the coherence access.
    #[must_use]
    pub fn use_accesses(&self) -> u32 {
        self.use_accesses
    }

    /// Whether the instruction cache is warmed before timing.
    #[must_use]
    pub fn code_prefetch(&self) -> bool {
        self.code_prefetch
    }

    /// Watchdog timeout; zero disables the watchdog.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How long to wait for one worker to acknowledge initialization.
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Hardware counters sampled around the timed region.
    #[must_use]
    pub fn counters(&self) -> &[CounterEvent] {
        &self.counters
    }

    /// The enabled behaviors as a bitmask.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Size of each worker's test buffer.
    ///
    /// Large enough for the largest problem size plus alignment, offset and padding, rounded up
    /// to whole huge pages if huge pages are used.
    #[must_use]
    pub fn buffer_size(&self) -> u64 {
        let size = self.schedule.max_size() + self.alignment + self.offset + BUFFER_PADDING;

        if self.hugepages() {
            let huge_page_size = self
                .topology
                .huge_page_size()
                .unwrap_or(DEFAULT_HUGE_PAGE_SIZE);
            size.div_ceil(huge_page_size) * huge_page_size
        } else {
            size
        }
    }

    /// Size of each flush buffer.
    #[must_use]
    pub fn flush_buffer_size(&self) -> u64 {
        flush_buffer_size(self.topology.cache_levels(), self.flush_extra)
    }

    /// Logs what the measurement is about to do.
    pub(crate) fn log_summary(&self) {
        for cache in &self.flush_levels {
            info!("enabled L{} flushes", cache.level());
        }

        if let Some(tlb) = &self.tlb_level {
            info!(
                "using only {} pages (which fit in the level {} TLB) for the measurement",
                tlb.entries(),
                tlb.level()
            );
        }

        info!(
            "{} packages, {} cores, {} logical processors",
            self.topology.package_count(),
            self.topology.core_count(),
            self.topology.processors().len()
        );
        info!("using {} threads", self.worker_count());

        for worker in 0..self.worker_count() {
            let Some(processor) = self
                .worker_processor(worker)
                .and_then(|id| self.topology.processor(id))
            else {
                continue;
            };

            info!(
                "thread {worker} runs on processor {}, core {} in package {}, memory node {}",
                processor.id(),
                processor.core_id(),
                processor.package_id(),
                self.worker_memory_node(worker).unwrap_or_default()
            );
        }
    }
}

/// Bytes of flush buffer needed to evict data from every cache level.
///
/// The sum of all cache sizes is scaled by `(100 + extra) / 50`. The factor of two over the
/// plain sum accounts for replacement policies that only evict reliably after a cache's
/// capacity has been streamed through more than once.
#[must_use]
pub fn flush_buffer_size(levels: &[CacheLevel], extra_percent: u32) -> u64 {
    let total: u64 = levels.iter().map(CacheLevel::size).sum();
    total * (100 + u64::from(extra_percent)) / 50
}

fn apply_topology_overrides(
    store: &ParameterStore,
    topology: &mut Topology,
    problems: &mut ConfigProblems,
) {
    if let Some(frequency) = store.optional::<u64>("CPU_FREQUENCY", problems) {
        topology.set_clock_rate(frequency);
    }

    for level in FLUSHABLE_LEVELS {
        if let Some(size) = store.optional::<u64>(&format!("L{level}_SIZE"), problems) {
            topology.set_cache_size(level, size);
        }
    }

    if let Some(line_size) = store.optional::<u32>("CACHELINE_SIZE", problems) {
        if line_size.is_power_of_two() {
            topology.set_line_size(line_size);
        } else {
            problems.push("CACHELINE_SIZE", format!("{line_size} is not a power of two"));
        }
    }

    let entries = number_list(store, "TLB_ENTRIES", problems);
    let ways = number_list(store, "TLB_SETS", problems);

    if !entries.is_empty() {
        if !ways.is_empty() && ways.len() != entries.len() {
            problems.push("TLB_SETS", "must list one value per TLB_ENTRIES level");
        }

        for (index, &level_entries) in entries.iter().enumerate() {
            let Ok(level) = u8::try_from(index + 1) else {
                break;
            };

            let level_ways = ways.get(index).copied().unwrap_or(0);
            topology.set_tlb_level(
                level,
                u32::try_from(level_entries).unwrap_or(u32::MAX),
                u32::try_from(level_ways).unwrap_or(u32::MAX),
            );
        }
    } else if !ways.is_empty() {
        problems.push("TLB_SETS", "requires TLB_ENTRIES");
    }
}

fn number_list(store: &ParameterStore, key: &str, problems: &mut ConfigProblems) -> Vec<u64> {
    let Some(raw) = store.get(key) else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter_map(|item| match item.parse::<u64>() {
            Ok(value) => Some(value),
            Err(e) => {
                problems.push(key, format!("invalid list entry '{item}': {e}"));
                None
            }
        })
        .collect()
}

fn parse_schedule(store: &ParameterStore, problems: &mut ConfigProblems) -> Option<ProblemSchedule> {
    let schedule = if let Some(list) = store.get("PROBLEMLIST") {
        parse_ordered(list)
            .and_then(ProblemSchedule::explicit)
            .map_err(|e| problems.push("PROBLEMLIST", e))
            .ok()?
    } else {
        let min: Option<u64> = store.required("MIN", problems);
        let max: Option<u64> = store.required("MAX", problems);
        let steps: Option<NonZero<usize>> = store.required("STEPS", problems);

        ProblemSchedule::geometric(min?, max?, steps?)
            .map_err(|e| problems.push("MIN/MAX/STEPS", e))
            .ok()?
    };

    if !store.flag("RANDOM", false, problems) {
        return Some(schedule);
    }

    let seed = store
        .optional::<u64>("RANDOM_SEED", problems)
        .unwrap_or_else(rand::random);

    info!("visiting problem sizes in random order, seed {seed}");
    Some(schedule.randomized(seed))
}

/// Parses a CPU list and drops processors the process may not use.
///
/// Returns `None` if the key is absent or malformed.
fn processor_list(
    store: &ParameterStore,
    key: &str,
    topology: &Topology,
    problems: &mut ConfigProblems,
) -> Option<Vec<ProcessorId>> {
    let raw = store.get(key)?;

    let list = match parse_processors(raw) {
        Ok(list) => list,
        Err(e) => {
            problems.push(key, e);
            return None;
        }
    };

    let (allowed, denied): (Vec<_>, Vec<_>) =
        list.into_iter().partition(|&id| topology.is_allowed(id));

    if !denied.is_empty() {
        warn!(
            "{key}: processors {} are not available to this process, ignoring them",
            cpulist::emit(denied)
        );
    }

    Some(allowed)
}

fn memory_nodes(
    store: &ParameterStore,
    policy: MemoryPolicy,
    result_processors: &NonEmpty<ProcessorId>,
    sharing_processors: &[ProcessorId],
    topology: &Topology,
    problems: &mut ConfigProblems,
) -> Vec<MemoryNodeId> {
    let node_of = |id: ProcessorId| topology.processor(id).map_or(0, |p| p.memory_node());
    let workers = result_processors.iter().chain(sharing_processors).copied();

    match policy {
        MemoryPolicy::Global => {
            let node = node_of(*result_processors.first());
            workers.map(|_| node).collect()
        }
        MemoryPolicy::Local => workers.map(node_of).collect(),
        MemoryPolicy::Explicit => {
            let Some(raw) = store.get("MEM_BIND") else {
                problems.push("MEM_BIND", "required when ALLOC is B");
                return Vec::new();
            };

            let worker_count = result_processors.len() + sharing_processors.len();

            match parse_processors(raw) {
                Ok(list) if list.len() >= worker_count => {
                    list.into_iter().take(worker_count).map(node_of).collect()
                }
                Ok(list) => {
                    problems.push(
                        "MEM_BIND",
                        format!(
                            "lists {} processors but {worker_count} threads are used",
                            list.len()
                        ),
                    );
                    Vec::new()
                }
                Err(e) => {
                    problems.push("MEM_BIND", e);
                    Vec::new()
                }
            }
        }
    }
}

fn parse_counters(store: &ParameterStore, problems: &mut ConfigProblems) -> Vec<CounterEvent> {
    let Some(raw) = store.get("COUNTERS") else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match name.parse::<CounterEvent>() {
            Ok(event) => Some(event),
            Err(e) => {
                problems.push("COUNTERS", e);
                None
            }
        })
        .collect()
}

/// Parses a numeric parameter that must be greater than zero.
fn positive<T>(
    store: &ParameterStore,
    key: &str,
    default: Option<T>,
    problems: &mut ConfigProblems,
) -> Option<T>
where
    T: FromStr + Default + PartialEq + Copy,
    T::Err: std::fmt::Display,
{
    let value = match default {
        Some(default) => {
            if store.get(key).is_none() {
                return Some(default);
            }
            store.optional(key, problems)?
        }
        None => store.required(key, problems)?,
    };

    if value == T::default() {
        problems.push(key, "must be greater than zero");
        return None;
    }

    Some(value)
}

fn check_mode_supported(
    key: &str,
    mode: CoherenceMode,
    topology: &Topology,
    sharing_processors: &[ProcessorId],
) -> Result<()> {
    if !mode.is_supported_by(topology.vendor()) {
        return Err(Error::unsupported(format!(
            "{key} {mode} does not exist in the coherence protocol of {} processors",
            topology.vendor()
        )));
    }

    if mode.requires_sharers() && sharing_processors.is_empty() {
        return Err(Error::unsupported(format!(
            "{key} {mode} requires at least one processor in SHARED_CPU_LIST"
        )));
    }

    if mode == CoherenceMode::Invalid
        && sharing_processors.is_empty()
        && !crate::arch::LINE_FLUSH_AVAILABLE
    {
        return Err(Error::unsupported(format!(
            "{key} I requires a processor in SHARED_CPU_LIST on this architecture"
        )));
    }

    Ok(())
}
