#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Measures how long it takes to access memory at cache line granularity, between pinned
//! processors and across memory nodes, with the accessed lines in a chosen cache coherence state.
//!
//! A measurement session is driven by a [`Kernel`]:
//!
//! 1. [`Kernel::initialize()`] starts one worker thread per selected processor, pins each of
//!    them, binds their memory to the configured node and lets every worker allocate its own test
//!    buffer there. The calling thread becomes worker 0, the one that does the timing.
//! 1. [`Kernel::measure()`] visits one problem size. For every processor of `CPU_LIST`, the owner
//!    of the memory lays out the access pattern, the workers establish the configured coherence
//!    state (for example, the owner writes every line and a sharing processor reads it to
//!    produce the Owned state), the selected cache levels are flushed and then worker 0 times
//!    the accesses.
//! 1. [`Kernel::teardown()`] (or dropping the kernel) stops the workers and releases everything.
//!
//! Workers are coordinated by busy-waiting on per-worker command cells instead of blocking
//! primitives, because the wake-up latency of a sleeping thread dwarfs the latencies measured.
//! A [`Watchdog`] terminates the whole process if a session exceeds its timeout.
//!
//! # Configuration
//!
//! Parameters are plain key-value pairs collected in a [`ParameterStore`], from a parameter file
//! and from prefixed environment variables. [`RunConfig::new()`] validates them against the
//! hardware [`Topology`] and reports every problem at once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coherence_bench::{Kernel, ParameterStore, PointerChase, RunConfig, Topology};
//!
//! let store = ParameterStore::from_pairs([
//!     ("MIN", "32000"),
//!     ("MAX", "2000000"),
//!     ("STEPS", "10"),
//!     ("CPU_LIST", "0,1"),
//!     ("ALLOC", "L"),
//!     ("HUGEPAGES", "0"),
//!     ("ALIGNMENT", "4096"),
//!     ("OFFSET", "0"),
//!     ("ACCESSES", "1000"),
//!     ("TLB_MODE", "0"),
//!     ("FLUSH_L1", "1"),
//!     ("FLUSH_L2", "1"),
//!     ("FLUSH_L3", "0"),
//!     ("FLUSH_L4", "0"),
//!     ("USE_MODE", "M"),
//! ])
//! .with_environment("CCBENCH_");
//!
//! let config = RunConfig::new(&store, Topology::detect()?)?;
//! let size_count = config.schedule().len();
//!
//! let mut kernel = Kernel::initialize(config, Arc::new(PointerChase::new(1)))?;
//!
//! for index in 0..size_count {
//!     let results = kernel.measure(index)?;
//!     println!("{results:?}");
//! }
//!
//! kernel.teardown();
//! # Ok::<(), coherence_bench::Error>(())
//! ```
//!
//! # Platform support
//!
//! Linux only. The cycle counter and the line flush instruction are implemented for x86-64 and
//! 64-bit ARM; other architectures fall back to the monotonic clock and skip line flushes.

#[cfg(not(target_os = "linux"))]
compile_error!("coherence_bench needs Linux: sysfs topology, set_mempolicy and hugetlbfs");

mod arch;
mod binding_list;
mod buffer;
mod cache_control;
mod collector;
mod config;
mod counters;
mod error;
mod handshake;
mod orchestrator;
mod pal;
mod parameters;
mod primitive;
mod schedule;
mod topology;
mod watchdog;
mod worker;

pub use collector::{INVALID_MEASUREMENT, MeasurementSample, measure_once};
pub use config::{
    CoherenceMode, FlushBufferScope, FlushOrder, MemoryPolicy, RunConfig, Settings,
    flush_buffer_size,
};
pub use counters::CounterEvent;
pub(crate) use error::ConfigProblems;
pub use error::{ConfigProblem, Error, Result};
pub use orchestrator::Kernel;
pub use parameters::{DEFAULT_ENV_PREFIX, ParameterStore};
pub use primitive::{AccessPlan, NoopPrimitive, PointerChase, TimedPrimitive};
pub use schedule::ProblemSchedule;
pub use topology::{
    CacheLevel, MemoryNodeId, Processor, ProcessorId, TlbLevel, Topology, TopologyBuilder, Vendor,
};
pub use watchdog::Watchdog;
