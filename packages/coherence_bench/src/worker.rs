//! What the workers do, and the state they share with the orchestrating thread.
//!
//! Worker 0 is the orchestrating thread itself, which executes its commands inline. Every other
//! worker is a dedicated thread looping in [`run`] until it receives [`Command::Stop`].

use std::ptr::NonNull;
use std::{fmt, io, mem};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::cache_control::{self, Access};
use crate::collector::measure_once;
use crate::handshake::{Ack, PhaseBarrier};
use crate::pal::{Bindings, BindingsFacade};
use crate::{
    AccessPlan, CacheLevel, FlushBufferScope, ProcessorId, Result, RunConfig, Settings,
    TimedPrimitive,
};

/// Used when the topology does not know the L1 line size.
const FALLBACK_LINE_SIZE: u32 = 64;

const ERR_POISONED_LOCK: &str = "worker failure lock is never held across a panic";

/// Accesses made by a code prefetch, enough to run every instruction of the primitive.
const PREFETCH_ACCESSES: u64 = 16;

/// The commands a worker understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Command {
    /// Pin the thread, bind its memory, allocate its buffers.
    Init = 1,

    /// Leave the command loop.
    Stop = 2,

    /// Apply the operation in the worker's parameters to the target region.
    UseMemory = 3,

    /// Acknowledge without doing anything.
    Wait = 4,

    /// Run the primitive on private scratch memory to warm the instruction cache.
    PrefetchCode = 5,

    /// Read through the flush buffer for the selected cache levels.
    Flush = 6,

    /// Read through the flush buffer for every cache level.
    FlushAll = 7,
}

impl Command {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::Stop,
            3 => Self::UseMemory,
            4 => Self::Wait,
            5 => Self::PrefetchCode,
            6 => Self::Flush,
            7 => Self::FlushAll,
            _ => return None,
        })
    }
}

/// What `UseMemory` does to the target region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MemoryOp {
    /// Let the primitive lay out its access pattern.
    Prepare,

    Touch(Access),
}

impl MemoryOp {
    const PREPARE: u8 = u8::MAX;

    fn to_u8(self) -> u8 {
        match self {
            Self::Prepare => Self::PREPARE,
            Self::Touch(access) => access.to_u8(),
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        if value == Self::PREPARE {
            Some(Self::Prepare)
        } else {
            Access::from_u8(value).map(Self::Touch)
        }
    }
}

/// Parameters of a `UseMemory` command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct UseMemory {
    /// The worker whose test buffer is accessed.
    pub(crate) target: usize,
    pub(crate) size: u64,
    pub(crate) op: MemoryOp,
    pub(crate) repetitions: u32,
}

/// State of one worker.
///
/// The parameters are written by the orchestrator before it publishes a command and read by the
/// worker after it has observed the command, so relaxed ordering is enough for them.
#[derive(Default)]
#[repr(align(128))]
pub(crate) struct WorkerSlot {
    target: AtomicUsize,
    size: AtomicU64,
    op: AtomicU8,
    repetitions: AtomicU32,

    test_buffer: OnceLock<Buffer>,
    flush_buffer: OnceLock<Buffer>,

    // The most recent failure, written before the failed acknowledgment is published.
    failure: Mutex<Option<String>>,

    // Set when the thread left its command loop without being stopped.
    exited: AtomicBool,
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("test_buffer", &self.test_buffer.get())
            .field("flush_buffer", &self.flush_buffer.get())
            .field("failure", &self.failure)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl WorkerSlot {
    fn set_params(&self, params: UseMemory) {
        self.target.store(params.target, Ordering::Relaxed);
        self.size.store(params.size, Ordering::Relaxed);
        self.op.store(params.op.to_u8(), Ordering::Relaxed);
        self.repetitions.store(params.repetitions, Ordering::Relaxed);
    }

    fn params(&self) -> Option<UseMemory> {
        Some(UseMemory {
            target: self.target.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            op: MemoryOp::from_u8(self.op.load(Ordering::Relaxed))?,
            repetitions: self.repetitions.load(Ordering::Relaxed),
        })
    }

    fn set_failure(&self, problem: String) {
        *self.failure.lock().expect(ERR_POISONED_LOCK) = Some(problem);
    }

    /// Why the worker failed most recently, if it ever did.
    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().expect(ERR_POISONED_LOCK).clone()
    }

    /// Whether the worker thread is gone and will never acknowledge another command.
    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Everything the orchestrator and the workers share for the lifetime of a kernel.
#[derive(Debug)]
pub(crate) struct SharedContext {
    config: RunConfig,
    barrier: PhaseBarrier,
    primitive: Arc<dyn TimedPrimitive>,
    bindings: BindingsFacade,
    slots: Box<[WorkerSlot]>,
    global_flush_buffer: OnceLock<Buffer>,
}

impl SharedContext {
    pub(crate) fn new(
        config: RunConfig,
        primitive: Arc<dyn TimedPrimitive>,
        bindings: BindingsFacade,
    ) -> Self {
        let worker_count = config.worker_count();

        Self {
            barrier: PhaseBarrier::new(worker_count),
            slots: (0..worker_count).map(|_| WorkerSlot::default()).collect(),
            global_flush_buffer: OnceLock::new(),
            config,
            primitive,
            bindings,
        }
    }

    pub(crate) fn config(&self) -> &RunConfig {
        &self.config
    }

    pub(crate) fn barrier(&self) -> &PhaseBarrier {
        &self.barrier
    }

    pub(crate) fn primitive(&self) -> &dyn TimedPrimitive {
        self.primitive.as_ref()
    }

    pub(crate) fn bindings(&self) -> &BindingsFacade {
        &self.bindings
    }

    pub(crate) fn slot(&self, worker: usize) -> &WorkerSlot {
        self.slots
            .get(worker)
            .expect("worker indexes are always below the worker count")
    }

    /// Sets the parameters of the next `UseMemory` command of a worker.
    pub(crate) fn set_use_memory(&self, worker: usize, params: UseMemory) {
        self.slot(worker).set_params(params);
    }

    /// Line size used for every plan.
    pub(crate) fn line_size(&self) -> u32 {
        self.config
            .topology()
            .cache_level(1)
            .map(CacheLevel::line_size)
            .filter(|&size| size >= size_of::<u64>() as u32)
            .unwrap_or(FALLBACK_LINE_SIZE)
    }

    fn page_size(&self) -> u64 {
        let topology = self.config.topology();

        if self.config.hugepages() {
            topology.huge_page_size().unwrap_or(topology.page_size())
        } else {
            topology.page_size()
        }
    }

    /// The plan for `size` bytes of a worker's test buffer.
    ///
    /// Returns `None` if that worker has no test buffer (it never completed INIT) or the size
    /// exceeds what the buffer was sized for.
    pub(crate) fn plan(&self, target: usize, size: u64) -> Option<AccessPlan> {
        let buffer = self.slots.get(target)?.test_buffer.get()?;
        let offset = usize::try_from(self.config.offset()).ok()?;

        let end = offset.checked_add(usize::try_from(size).ok()?)?;
        if end > buffer.len() {
            return None;
        }

        // SAFETY: The offset is within the buffer, checked above.
        let base = NonNull::new(unsafe { buffer.as_ptr().add(offset) })?;

        // SAFETY: The buffer covers offset + size bytes, is aligned to at least 8 bytes (and the
        // offset is a multiple of 8) and lives as long as the shared context.
        Some(unsafe {
            AccessPlan::new(
                base,
                size,
                self.line_size(),
                self.page_size(),
                self.config.tlb_level(),
            )
        })
    }

    /// The flush buffer a worker reads through.
    pub(crate) fn flush_buffer(&self, worker: usize) -> Option<&Buffer> {
        match self.config.flush_buffer_scope() {
            FlushBufferScope::Global => self.global_flush_buffer.get(),
            FlushBufferScope::PerThread => self.slot(worker).flush_buffer.get(),
        }
    }

    /// Whether any command will ever read through a flush buffer.
    pub(crate) fn needs_flush_buffer(&self) -> bool {
        !self.config.flush_levels().is_empty()
            || self.config.flush_sharing_processors()
            || self.config.settings().contains(Settings::FLUSH_CPU0)
    }

    /// Allocates the flush buffer shared by every worker, on the current thread's memory node.
    pub(crate) fn allocate_global_flush_buffer(&self) -> Result<()> {
        if self.config.flush_buffer_scope() != FlushBufferScope::Global
            || !self.needs_flush_buffer()
        {
            return Ok(());
        }

        let buffer = self.allocate_flush_buffer()?;
        _ = self.global_flush_buffer.set(buffer);
        Ok(())
    }

    fn allocate_flush_buffer(&self) -> Result<Buffer> {
        Buffer::allocate(
            "flush buffer",
            self.config.flush_buffer_size(),
            u64::from(self.line_size()),
            self.line_size(),
            None,
            &self.bindings,
        )
    }

    /// Releases the buffers in reverse order of acquisition: private flush buffers, test
    /// buffers, then the shared flush buffer.
    ///
    /// Only valid once no worker thread can touch them anymore.
    pub(crate) fn release_buffers(&mut self) {
        for slot in &mut self.slots {
            drop(slot.flush_buffer.take());
        }

        for slot in &mut self.slots {
            drop(slot.test_buffer.take());
        }

        drop(self.global_flush_buffer.take());
    }
}

/// Executes one command on behalf of `worker`, on the calling thread.
pub(crate) fn execute(
    context: &SharedContext,
    worker: usize,
    command: Command,
) -> Result<(), String> {
    match command {
        Command::Init => initialize(context, worker),
        Command::Stop | Command::Wait => Ok(()),
        Command::UseMemory => {
            let params = context
                .slot(worker)
                .params()
                .ok_or_else(|| "invalid memory operation".to_string())?;

            use_memory(context, params)
        }
        Command::PrefetchCode => {
            prefetch_code(context);
            Ok(())
        }
        Command::Flush => {
            flush(context, worker, false);
            Ok(())
        }
        Command::FlushAll => {
            flush(context, worker, true);
            Ok(())
        }
    }
}

/// The command loop of a worker thread.
pub(crate) fn run(context: &SharedContext, worker: usize) {
    loop {
        let raw = context.barrier.next_command(worker);

        let Some(command) = Command::from_u8(raw) else {
            context
                .slot(worker)
                .set_failure(format!("unknown command {raw}"));
            context.barrier.complete(worker, Ack::Failed);
            continue;
        };

        // A panicking command still has to be acknowledged, or the orchestrator spins forever.
        // The thread unwinds out of the loop afterwards, so it is marked as exited first.
        let failure_guard = scopeguard::guard((), |()| {
            let slot = context.slot(worker);
            slot.set_failure(format!("worker panicked while executing {command:?}"));
            slot.exited.store(true, Ordering::Release);
            context.barrier.complete(worker, Ack::Failed);
        });

        let result = execute(context, worker, command);

        scopeguard::ScopeGuard::into_inner(failure_guard);

        match result {
            Ok(()) => context.barrier.complete(worker, Ack::Done),
            Err(problem) => {
                context.slot(worker).set_failure(problem);
                context.barrier.complete(worker, Ack::Failed);
            }
        }

        if command == Command::Stop {
            debug!(worker, "worker stopped");
            return;
        }
    }
}

fn initialize(context: &SharedContext, worker: usize) -> Result<(), String> {
    let config = &context.config;

    let processor = config
        .worker_processor(worker)
        .ok_or_else(|| format!("no processor assigned to worker {worker}"))?;

    pin_current_thread(&context.bindings, processor)
        .map_err(|e| format!("could not pin to processor {processor}: {e}"))?;

    if let Some(node) = config.worker_memory_node(worker)
        && let Err(e) = context.bindings.bind_memory_to_node(node)
    {
        warn!(worker, node, "memory binding unavailable, allocating from any node: {e}");
    }

    let hugetlbfs = config.hugepages().then(|| config.hugepage_dir());

    let test_buffer = Buffer::allocate(
        "test buffer",
        config.buffer_size(),
        config.alignment(),
        context.line_size(),
        hugetlbfs,
        &context.bindings,
    )
    .map_err(|e| e.to_string())?;

    let slot = context.slot(worker);
    _ = slot.test_buffer.set(test_buffer);

    if config.flush_buffer_scope() == FlushBufferScope::PerThread && context.needs_flush_buffer()
    {
        let flush_buffer = context.allocate_flush_buffer().map_err(|e| e.to_string())?;
        _ = slot.flush_buffer.set(flush_buffer);
    }

    debug!(worker, processor, "worker initialized");
    Ok(())
}

/// Pins the calling thread to a single processor.
pub(crate) fn pin_current_thread(
    bindings: &BindingsFacade,
    processor: ProcessorId,
) -> io::Result<()> {
    // SAFETY: All zeroes is a valid cpu_set_t.
    let mut cpuset: libc::cpu_set_t = unsafe { mem::zeroed() };

    // SAFETY: Processor IDs come from the kernel and are below CPU_SETSIZE.
    unsafe { libc::CPU_SET(processor as usize, &mut cpuset) };

    bindings.sched_setaffinity_current(&cpuset)
}

fn use_memory(context: &SharedContext, params: UseMemory) -> Result<(), String> {
    let plan = context.plan(params.target, params.size).ok_or_else(|| {
        format!(
            "worker {} has no buffer for {} bytes",
            params.target, params.size
        )
    })?;

    match params.op {
        MemoryOp::Prepare => context.primitive.prepare(&plan),
        MemoryOp::Touch(access) => cache_control::touch(&plan, access, params.repetitions),
    }

    Ok(())
}

fn prefetch_code(context: &SharedContext) {
    #[repr(align(128))]
    struct Scratch([u64; 16]);

    let mut scratch = Scratch([0; 16]);

    // SAFETY: The scratch memory outlives the plan and is valid for 128 bytes.
    let plan = unsafe {
        AccessPlan::new(
            NonNull::from(&mut scratch).cast(),
            size_of::<Scratch>() as u64,
            context.line_size().min(size_of::<Scratch>() as u32),
            context.config.topology().page_size(),
            None,
        )
    };

    context.primitive.prepare(&plan);
    _ = measure_once(context.primitive.as_ref(), &plan, PREFETCH_ACCESSES);
}

fn flush(context: &SharedContext, worker: usize, all_levels: bool) {
    let Some(buffer) = context.flush_buffer(worker) else {
        return;
    };

    let config = &context.config;
    let levels = if all_levels {
        config.topology().cache_levels()
    } else {
        config.flush_levels()
    };

    _ = cache_control::flush(buffer, levels, config.flush_extra(), config.flush_order());
}
