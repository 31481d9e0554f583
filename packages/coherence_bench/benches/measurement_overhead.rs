//! Benchmarking the fixed costs around a measurement: the timing sequence itself and a complete
//! measurement round between two workers, which consists mostly of handshake round trips.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use coherence_bench::{
    AccessPlan, CacheLevel, Kernel, NoopPrimitive, ParameterStore, PointerChase, Processor,
    ProcessorId, RunConfig, TimedPrimitive, Topology, Vendor, measure_once,
};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const REGION_BYTES: usize = 64 * 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("measure_once");

    let mut region = vec![0_u64; REGION_BYTES / size_of::<u64>()];

    // SAFETY: The region outlives the plan and is not accessed by anything else meanwhile.
    let plan = unsafe {
        AccessPlan::new(
            NonNull::from(region.as_mut_slice()).cast(),
            REGION_BYTES as u64,
            64,
            4096,
            None,
        )
    };

    group.bench_function("noop", |b| {
        b.iter(|| black_box(measure_once(&NoopPrimitive, &plan, 1)));
    });

    let chase = PointerChase::new(42);
    chase.prepare(&plan);

    group.bench_function("pointer_chase_1024", |b| {
        b.iter(|| black_box(measure_once(&chase, &plan, 1024)));
    });

    group.finish();

    let processors = allowed_processors();
    if processors.len() < 2 {
        return;
    }

    let mut group = c.benchmark_group("Kernel");

    let mut kernel = two_worker_kernel(&processors);

    // Each round issues a handful of commands to both workers and waits for every one of them.
    group.bench_function("measure_two_workers_noop", |b| {
        b.iter(|| black_box(kernel.measure(0).ok()));
    });

    group.finish();

    kernel.teardown();
}

fn two_worker_kernel(processors: &[ProcessorId]) -> Kernel {
    let topology = Topology::builder()
        .vendor(Vendor::Other)
        .clock_rate(1_000_000_000)
        .cache(CacheLevel::new(1, 32 * 1024, 64, 8))
        .processor(Processor::new(processors[0], 0, 0, 0))
        .processor(Processor::new(processors[1], 1, 0, 0))
        .build();

    let cpu_list = format!("{},{}", processors[0], processors[1]);

    let store = ParameterStore::from_pairs([
        ("PROBLEMLIST", "4096"),
        ("CPU_LIST", cpu_list.as_str()),
        ("ALLOC", "L"),
        ("HUGEPAGES", "0"),
        ("ALIGNMENT", "4096"),
        ("OFFSET", "0"),
        ("ACCESSES", "1"),
        ("TLB_MODE", "0"),
        ("FLUSH_L1", "0"),
        ("FLUSH_L2", "0"),
        ("FLUSH_L3", "0"),
        ("FLUSH_L4", "0"),
        ("USE_MODE", "M"),
    ]);

    let config = RunConfig::new(&store, topology).unwrap();
    Kernel::initialize(config, Arc::new(NoopPrimitive)).unwrap()
}

fn allowed_processors() -> Vec<ProcessorId> {
    // SAFETY: All zeroes is a valid cpu_set_t.
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };

    // SAFETY: The set is valid for writes of the size we pass.
    let result = unsafe { libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), &raw mut set) };
    if result != 0 {
        return Vec::new();
    }

    (0..libc::CPU_SETSIZE as usize)
        // SAFETY: The index is within the set.
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .filter_map(|cpu| ProcessorId::try_from(cpu).ok())
        .collect()
}
