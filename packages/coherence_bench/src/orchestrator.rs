use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use negative_impl::negative_impl;
use tracing::{debug, info, warn};

use crate::cache_control::{self, Access, PrimeStep, Role};
use crate::collector::{SlotResult, loop_overhead, measure_once, results_vector};
use crate::counters::CounterSet;
use crate::handshake::Ack;
use crate::pal::{Bindings, BindingsFacade};
use crate::worker::{self, Command, MemoryOp, SharedContext, UseMemory};
use crate::{
    AccessPlan, Error, MeasurementSample, Result, RunConfig, Settings, TimedPrimitive, Watchdog,
    arch,
};

/// A running measurement session: the pinned worker threads, their buffers and the watchdog.
///
/// The thread that calls [`Kernel::initialize()`] becomes worker 0, the one that performs the
/// timed accesses. It is pinned to the first processor of `CPU_LIST`, and the kernel has to stay
/// on that thread (it is neither `Send` nor `Sync`).
///
/// Dropping the kernel tears it down; [`Kernel::teardown()`] does the same explicitly.
pub struct Kernel {
    context: Arc<SharedContext>,
    threads: Vec<JoinHandle<()>>,
    counters: CounterSet,
    watchdog: Option<Watchdog>,
    loop_overhead: u64,
    original_affinity: Option<libc::cpu_set_t>,
    torn_down: bool,
}

impl Kernel {
    /// Starts the watchdog, creates and initializes every worker and allocates all buffers.
    ///
    /// Workers are initialized one after another, each on its own processor and memory node.
    ///
    /// # Errors
    ///
    /// Fails if a worker cannot be pinned or cannot allocate its buffers, if a worker does not
    /// acknowledge its initialization within `INIT_TIMEOUT`, or if a hardware counter cannot be
    /// opened. Whatever was already started is torn down again before returning.
    pub fn initialize(config: RunConfig, primitive: Arc<dyn TimedPrimitive>) -> Result<Self> {
        let watchdog = Watchdog::start(config.timeout())?;
        Self::initialize_with(config, primitive, BindingsFacade::target(), watchdog)
    }

    pub(crate) fn initialize_with(
        config: RunConfig,
        primitive: Arc<dyn TimedPrimitive>,
        bindings: BindingsFacade,
        watchdog: Option<Watchdog>,
    ) -> Result<Self> {
        config.log_summary();

        let original_affinity = bindings.sched_getaffinity_current().ok();
        let context = Arc::new(SharedContext::new(config, primitive, bindings.clone()));

        let mut kernel = Self {
            context: Arc::clone(&context),
            threads: Vec::new(),
            counters: CounterSet::open(&[], bindings.clone())?,
            watchdog,
            loop_overhead: 0,
            original_affinity,
            torn_down: false,
        };

        // From here on, dropping the kernel on an error path stops whatever was started.
        for worker in 1..context.config().worker_count() {
            let thread = thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn({
                    let context = Arc::clone(&context);
                    move || worker::run(&context, worker)
                })
                .map_err(|e| Error::resource(format!("thread for worker {worker}"), e))?;

            kernel.threads.push(thread);

            let timeout = context.config().init_timeout();
            match context
                .barrier()
                .issue_and_wait(worker, Command::Init as u8, Some(timeout))
            {
                Some(Ack::Done) => {}
                Some(Ack::Failed) => return Err(kernel.worker_failure(worker)),
                None => {
                    // The thread may still be spinning on INIT, so it cannot be asked to stop.
                    kernel.abandon_threads();
                    return Err(Error::WorkerUnresponsive {
                        worker,
                        waited: timeout,
                    });
                }
            }
        }

        // Worker 0 sets itself up last, after every other worker has its memory.
        worker::execute(&context, 0, Command::Init)
            .map_err(|problem| Error::WorkerFailed { worker: 0, problem })?;

        context.allocate_global_flush_buffer()?;

        kernel.counters = CounterSet::open(context.config().counters(), bindings)?;

        let workers = 1..context.config().worker_count();
        context.barrier().issue_all(workers.clone(), Command::Wait as u8);
        if let Some(&worker) = context.barrier().wait_all(workers).first() {
            return Err(kernel.worker_failure(worker));
        }

        if context
            .config()
            .settings()
            .contains(Settings::LOOP_OVERHEAD_COMPENSATION)
        {
            let plan = context
                .plan(0, 0)
                .expect("worker 0 has a test buffer after a successful INIT");
            kernel.loop_overhead = loop_overhead(&plan);
            info!("loop overhead: {} cycles", kernel.loop_overhead);
        }

        info!(
            workers = context.config().worker_count(),
            "all workers initialized"
        );

        Ok(kernel)
    }

    /// Measures the problem size at `index` of the schedule's visiting order.
    ///
    /// Returns `[problem size, cycles per slot, nanoseconds per slot, counter values per slot
    /// for each counter]`, with one slot per processor of `CPU_LIST`. Slot `k` is the time
    /// worker 0 needs to access the memory of worker `k`. Anything that could not be measured
    /// is [`INVALID_MEASUREMENT`][crate::INVALID_MEASUREMENT].
    ///
    /// # Errors
    ///
    /// Fails if `index` is outside the schedule or a worker fails a command.
    pub fn measure(&mut self, index: usize) -> Result<Vec<f64>> {
        let config = self.context.config();

        let size = config.schedule().size_at(index).ok_or_else(|| {
            Error::unsupported(format!(
                "problem index {index} is outside the schedule of {} sizes",
                config.schedule().len()
            ))
        })?;

        debug!(index, size, "measuring");

        let mut slots = Vec::with_capacity(config.result_count());

        for slot in 0..config.result_count() {
            let mut best: Option<SlotResult> = None;

            for _ in 0..config.runs().get() {
                let result = self.measure_slot(slot, size)?;

                best = match best {
                    Some(best) if !result.is_better_than(&best) => Some(best),
                    _ => Some(result),
                };
            }

            slots.push(best.unwrap_or_else(|| SlotResult::invalid(self.counters.len())));
        }

        Ok(results_vector(
            size,
            &slots,
            self.counters.len(),
            config.topology().clock_rate(),
        ))
    }

    fn measure_slot(&self, owner: usize, size: u64) -> Result<SlotResult> {
        let config = self.context.config();

        let Some(plan) = self.context.plan(owner, size) else {
            return Ok(SlotResult::invalid(self.counters.len()));
        };

        self.use_memory(owner, owner, size, MemoryOp::Prepare, 1)?;

        for Pass {
            worker,
            access,
            repetitions,
        } in self.priming_passes(owner)
        {
            self.use_memory(worker, owner, size, MemoryOp::Touch(access), repetitions)?;
        }

        if !config.flush_levels().is_empty() {
            self.command(owner, Command::Flush)?;

            if self.evict_with_line_flush() {
                self.use_memory(owner, owner, size, MemoryOp::Touch(Access::LineFlush), 1)?;
            }
        }

        if config.flush_sharing_processors() {
            for worker in self.sharing_workers() {
                self.command(worker, Command::FlushAll)?;
            }
        }

        if owner != 0 && config.settings().contains(Settings::FLUSH_CPU0) {
            self.command(0, Command::FlushAll)?;
        }

        if config.settings().contains(Settings::RESTRICT_TLB) {
            cache_control::restrict_to_tlb_level(&plan);
        }

        if config.code_prefetch() {
            self.command(0, Command::PrefetchCode)?;
        }

        Ok(self.timed_run(&plan))
    }

    /// The passes over slot `owner`'s lines that place them in the cache hierarchy and then
    /// establish the coherence state, in execution order.
    fn priming_passes(&self, owner: usize) -> Vec<Pass> {
        let config = self.context.config();

        let placement =
            cache_control::placement_accesses(config.flush_mode(), arch::LINE_FLUSH_AVAILABLE)
                .into_iter()
                .map(|access| Pass {
                    worker: owner,
                    access,
                    repetitions: config.flush_accesses(),
                });

        let steps = cache_control::coherence_steps(
            config.use_mode(),
            config.sharing_count() > 0,
            arch::LINE_FLUSH_AVAILABLE,
        );

        let coherence = steps.into_iter().flat_map(|PrimeStep { role, access }| {
            self.workers_for(role, owner).map(move |worker| Pass {
                worker,
                access,
                repetitions: config.use_accesses(),
            })
        });

        placement.chain(coherence).collect()
    }

    fn timed_run(&self, plan: &AccessPlan) -> SlotResult {
        let config = self.context.config();

        self.counters.start();
        let sample = measure_once(self.context.primitive(), plan, config.accesses());
        let counters = self.counters.stop();

        let sample = if config
            .settings()
            .contains(Settings::LOOP_OVERHEAD_COMPENSATION)
        {
            sample.compensate(self.loop_overhead)
        } else {
            sample
        };

        if sample == MeasurementSample::Invalid {
            debug!("timed run produced no valid sample");
        }

        SlotResult { sample, counters }
    }

    /// The line flush instructions also evict the last level cache, so they are only used when
    /// that level is being flushed.
    fn evict_with_line_flush(&self) -> bool {
        let config = self.context.config();

        config.line_flush()
            && arch::LINE_FLUSH_AVAILABLE
            && config
                .topology()
                .cache_levels()
                .last()
                .is_some_and(|outermost| {
                    config
                        .flush_levels()
                        .iter()
                        .any(|level| level.level() == outermost.level())
                })
    }

    fn sharing_workers(&self) -> Range<usize> {
        let config = self.context.config();
        let first = config.first_sharing_worker();
        first..first + config.sharing_count()
    }

    fn workers_for(&self, role: Role, owner: usize) -> Range<usize> {
        match role {
            Role::Owner => owner..owner + 1,
            Role::Sharers => self.sharing_workers(),
            Role::FirstSharer => {
                let sharers = self.sharing_workers();
                sharers.start..sharers.end.min(sharers.start + 1)
            }
        }
    }

    fn use_memory(
        &self,
        worker: usize,
        target: usize,
        size: u64,
        op: MemoryOp,
        repetitions: u32,
    ) -> Result<()> {
        self.context.set_use_memory(
            worker,
            UseMemory {
                target,
                size,
                op,
                repetitions,
            },
        );

        self.command(worker, Command::UseMemory)
    }

    /// Runs a command on one worker and waits for it to finish. Worker 0 runs it inline.
    fn command(&self, worker: usize, command: Command) -> Result<()> {
        if worker == 0 {
            return worker::execute(&self.context, 0, command)
                .map_err(|problem| Error::WorkerFailed { worker: 0, problem });
        }

        if self.context.slot(worker).has_exited() {
            return Err(self.worker_failure(worker));
        }

        match self
            .context
            .barrier()
            .issue_and_wait(worker, command as u8, None)
        {
            Some(Ack::Done) => Ok(()),
            _ => Err(self.worker_failure(worker)),
        }
    }

    fn worker_failure(&self, worker: usize) -> Error {
        Error::WorkerFailed {
            worker,
            problem: self
                .context
                .slot(worker)
                .failure()
                .unwrap_or_else(|| "no reason given".to_string()),
        }
    }

    /// Forgets threads that can no longer be stopped. The process is expected to exit soon.
    fn abandon_threads(&mut self) {
        warn!(
            threads = self.threads.len(),
            "abandoning worker threads that cannot be stopped"
        );
        self.threads.clear();
        self.torn_down = true;
    }

    /// Stops and joins every worker, cancels the watchdog and releases all buffers.
    pub fn teardown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        for (index, thread) in self.threads.drain(..).enumerate() {
            let worker = index + 1;

            if self.context.slot(worker).has_exited() {
                debug!(worker, "worker already exited, joining without STOP");
            } else if self
                .context
                .barrier()
                .issue_and_wait(worker, Command::Stop as u8, None)
                .is_none()
            {
                warn!(worker, "worker did not acknowledge STOP");
            }

            if thread.join().is_err() {
                warn!(worker, "worker thread panicked");
            }
        }

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }

        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.release_buffers();
        }

        if let Some(affinity) = &self.original_affinity
            && let Err(e) = self.context.bindings().sched_setaffinity_current(affinity)
        {
            warn!("could not restore the processor affinity of the calling thread: {e}");
        }

        debug!("kernel torn down");
    }
}

/// One worker applying one kind of access to every line of a measured region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Pass {
    worker: usize,
    access: Access,
    repetitions: u32,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("context", &self.context)
            .field("threads", &self.threads.len())
            .field("counters", &self.counters)
            .field("watchdog", &self.watchdog)
            .field("loop_overhead", &self.loop_overhead)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[negative_impl]
impl !Send for Kernel {}
#[negative_impl]
impl !Sync for Kernel {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::pal::MockBindings;
    use crate::{
        CacheLevel, INVALID_MEASUREMENT, NoopPrimitive, ParameterStore, PointerChase, Processor,
        Topology, Vendor,
    };

    assert_not_impl_any!(Kernel: Send, Sync);

    fn topology() -> Topology {
        Topology::builder()
            .vendor(Vendor::Amd)
            .clock_rate(1_000_000_000)
            .cache(CacheLevel::new(1, 32 * 1024, 64, 8))
            .cache(CacheLevel::new(2, 256 * 1024, 64, 8))
            .processor(Processor::new(0, 0, 0, 0))
            .processor(Processor::new(1, 1, 0, 0))
            .processor(Processor::new(2, 2, 0, 0))
            .processor(Processor::new(3, 3, 0, 0))
            .build()
    }

    fn store(pairs: &[(&str, &str)]) -> ParameterStore {
        let mut store = ParameterStore::from_pairs([
            ("PROBLEMLIST", "4096,32000"),
            ("CPU_LIST", "0,1"),
            ("ALLOC", "L"),
            ("HUGEPAGES", "0"),
            ("ALIGNMENT", "4096"),
            ("OFFSET", "0"),
            ("ACCESSES", "64"),
            ("TLB_MODE", "0"),
            ("FLUSH_L1", "1"),
            ("FLUSH_L2", "1"),
            ("FLUSH_L3", "0"),
            ("FLUSH_L4", "0"),
        ]);

        for (key, value) in pairs {
            store.set(*key, *value);
        }

        store
    }

    fn bindings(pin_calls: Arc<AtomicUsize>) -> BindingsFacade {
        let mut bindings = MockBindings::new();
        bindings
            .expect_sched_getaffinity_current()
            .returning(|| Err(io::Error::from_raw_os_error(libc::ENOSYS)));
        bindings.expect_sched_setaffinity_current().returning(move |_| {
            pin_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        bindings.expect_bind_memory_to_node().returning(|_| Ok(()));
        BindingsFacade::from_mock(bindings)
    }

    fn kernel(pairs: &[(&str, &str)], primitive: Arc<dyn TimedPrimitive>) -> Kernel {
        let config = RunConfig::new(&store(pairs), topology()).unwrap();
        Kernel::initialize_with(config, primitive, bindings(Arc::default()), None).unwrap()
    }

    #[test]
    fn results_have_one_entry_per_slot() {
        let mut kernel = kernel(&[], Arc::new(PointerChase::new(1)));

        for index in 0..2 {
            let results = kernel.measure(index).unwrap();

            assert_eq!(results.len(), 1 + 2 * 2);
            assert!(results.iter().skip(1).all(|&v| v >= 0.0));
        }

        kernel.teardown();
    }

    #[test]
    fn every_worker_is_pinned() {
        let pin_calls = Arc::new(AtomicUsize::new(0));
        let config = RunConfig::new(
            &store(&[("SHARED_CPU_LIST", "2"), ("USE_MODE", "S")]),
            topology(),
        )
        .unwrap();

        let kernel = Kernel::initialize_with(
            config,
            Arc::new(NoopPrimitive),
            bindings(Arc::clone(&pin_calls)),
            None,
        )
        .unwrap();

        assert_eq!(pin_calls.load(Ordering::Relaxed), 3);
        drop(kernel);
    }

    #[test]
    fn coherence_modes_run_through() {
        for (mode, extra) in [
            ("M", &[][..]),
            ("E", &[][..]),
            ("I", &[][..]),
            ("R", &[][..]),
            ("D", &[][..]),
            ("S", &[("SHARED_CPU_LIST", "2")][..]),
            ("O", &[("SHARED_CPU_LIST", "2"), ("FLUSH_SHARED_CPU", "1")][..]),
            ("U", &[("SHARED_CPU_LIST", "2"), ("ALWAYS_FLUSH_CPU0", "1")][..]),
        ] {
            let mut pairs = vec![("USE_MODE", mode), ("ENABLE_CODE_PREFETCH", "1")];
            pairs.extend_from_slice(extra);

            let mut kernel = kernel(&pairs, Arc::new(PointerChase::new(7)));
            let results = kernel.measure(1).unwrap();

            assert_eq!(results.first().copied(), Some(32000.0), "mode {mode}");
            assert_eq!(results.len(), 5, "mode {mode}");
        }
    }

    #[test]
    fn priming_passes_follow_roles() {
        use Access::{Read, Write};

        let pass = |worker, access, repetitions| Pass {
            worker,
            access,
            repetitions,
        };

        for (mode, owner, expected) in [
            (
                "S",
                1,
                vec![
                    pass(1, Read, 2),
                    pass(1, Read, 3),
                    pass(2, Read, 3),
                    pass(3, Read, 3),
                ],
            ),
            (
                "S",
                0,
                vec![
                    pass(0, Read, 2),
                    pass(0, Read, 3),
                    pass(2, Read, 3),
                    pass(3, Read, 3),
                ],
            ),
            (
                "O",
                1,
                vec![
                    pass(1, Read, 2),
                    pass(1, Write, 3),
                    pass(2, Read, 3),
                    pass(3, Read, 3),
                ],
            ),
            (
                "U",
                1,
                vec![pass(1, Read, 2), pass(2, Write, 3), pass(1, Read, 3)],
            ),
            (
                "I",
                1,
                vec![pass(1, Read, 2), pass(1, Read, 3), pass(2, Write, 3)],
            ),
        ] {
            let mut kernel = kernel(
                &[
                    ("USE_MODE", mode),
                    ("SHARED_CPU_LIST", "2,3"),
                    ("FLUSH_ACCESSES", "2"),
                    ("USE_ACCESSES", "3"),
                ],
                Arc::new(NoopPrimitive),
            );

            assert_eq!(kernel.priming_passes(owner), expected, "mode {mode}, owner {owner}");

            // The same passes run for real without any worker failing.
            assert_eq!(kernel.measure(0).unwrap().len(), 5, "mode {mode}");
        }
    }

    #[derive(Debug)]
    struct PanicsOnWorkerOne;

    impl TimedPrimitive for PanicsOnWorkerOne {
        fn prepare(&self, _plan: &AccessPlan) {
            assert_ne!(thread::current().name(), Some("worker-1"), "prepare failed");
        }

        fn run(&self, _plan: &AccessPlan, access_count: u64) -> u64 {
            access_count
        }
    }

    #[test]
    fn worker_panic_fails_measurement_and_teardown_completes() {
        let mut kernel = kernel(&[], Arc::new(PanicsOnWorkerOne));

        // Slot 0 is prepared inline, slot 1 by the panicking worker.
        let error = kernel.measure(0).unwrap_err();
        match &error {
            Error::WorkerFailed { worker: 1, problem } => {
                assert!(problem.contains("panicked"), "{problem}");
            }
            other => panic!("expected worker 1 to fail, got {other}"),
        }

        // The worker is gone, so later commands fail instead of waiting for it.
        assert!(matches!(
            kernel.measure(0),
            Err(Error::WorkerFailed { worker: 1, .. })
        ));

        kernel.teardown();
    }

    #[test]
    fn runs_and_compensation() {
        let mut kernel = kernel(
            &[
                ("RUNS", "3"),
                ("LOOP_OVERHEAD_COMPENSATION", "enabled"),
                ("FLUSH_BUFFER", "G"),
                ("FLUSH_ORDER", "LIFO"),
            ],
            Arc::new(NoopPrimitive),
        );

        let results = kernel.measure(0).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|&v| v != INVALID_MEASUREMENT));
    }

    #[test]
    fn index_outside_schedule_is_error() {
        let mut kernel = kernel(&[], Arc::new(NoopPrimitive));
        assert!(matches!(kernel.measure(2), Err(Error::UnsupportedState(_))));
    }

    #[test]
    fn worker_init_failure_surfaces() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut bindings = MockBindings::new();
        bindings
            .expect_sched_getaffinity_current()
            .returning(|| Err(io::Error::from_raw_os_error(libc::ENOSYS)));
        bindings.expect_sched_setaffinity_current().returning({
            let calls = Arc::clone(&calls);
            move |_| {
                // Worker 1 is the first to be pinned.
                if calls.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(io::Error::from_raw_os_error(libc::EINVAL))
                } else {
                    Ok(())
                }
            }
        });
        bindings.expect_bind_memory_to_node().returning(|_| Ok(()));

        let config = RunConfig::new(&store(&[]), topology()).unwrap();
        let error = Kernel::initialize_with(
            config,
            Arc::new(NoopPrimitive),
            BindingsFacade::from_mock(bindings),
            None,
        )
        .unwrap_err();

        assert!(matches!(error, Error::WorkerFailed { worker: 1, .. }), "{error}");
        assert_eq!(error.exit_code(), 2);
    }
}
