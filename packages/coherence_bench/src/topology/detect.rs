//! Reads the hardware topology from Linux sysfs and procfs.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::pal::{Bindings, Filesystem};
use crate::{
    CacheLevel, Error, MemoryNodeId, Processor, ProcessorId, Result, TlbLevel, Topology, Vendor,
};

/// sysfs lists cache indexes densely from 0; we stop at the first missing one.
const MAX_CACHE_INDEXES: u32 = 16;

pub(super) fn detect(
    fs: &impl Filesystem,
    bindings: &impl Bindings,
    clock_rate: u64,
) -> Result<Topology> {
    let cpuinfo = fs.get_cpuinfo_contents().unwrap_or_default();

    let online = fs
        .get_online_cpus_contents()
        .and_then(|contents| cpulist::parse(contents.trim()).ok())
        .unwrap_or_default();

    let allowed = allowed_processors(bindings);

    // Without the online list we can still work with whatever the affinity mask allows.
    let processor_ids = if online.is_empty() {
        allowed.clone()
    } else {
        online
    };

    let Some(&first_processor) = processor_ids.first() else {
        return Err(Error::unsupported("no online processors found"));
    };

    let nodes = memory_nodes(fs);

    let mut builder = Topology::builder()
        .clock_rate(clock_rate)
        .vendor(parse_vendor(&cpuinfo))
        .page_size(bindings.page_size() as u64);

    for id in processor_ids {
        let core_id = read_number(fs.get_cpu_topology_contents(id, "core_id")).unwrap_or(id);
        let package_id =
            read_number(fs.get_cpu_topology_contents(id, "physical_package_id")).unwrap_or(0);
        let memory_node = nodes.get(&id).copied().unwrap_or(0);

        builder = builder.processor(
            Processor::new(id, core_id, package_id, memory_node)
                .with_allowed(allowed.contains(&id)),
        );
    }

    // We assume the hierarchy is symmetric and describe it as seen by the first processor.
    let caches = data_caches(fs, first_processor);

    if caches.is_empty() {
        return Err(Error::unsupported(
            "no data caches are described in /sys/devices/system/cpu/*/cache",
        ));
    }

    for cache in caches {
        builder = builder.cache(cache);
    }

    if let Some(tlb) = parse_tlb(&cpuinfo) {
        builder = builder.tlb(tlb);
    }

    if let Some(size) = smallest_huge_page_size(&fs.get_hugepage_directory_names()) {
        builder = builder.huge_page_size(size);
    }

    let topology = builder.build();
    debug!(?topology, "detected topology");

    Ok(topology)
}

fn allowed_processors(bindings: &impl Bindings) -> Vec<ProcessorId> {
    let cpuset = match bindings.sched_getaffinity_current() {
        Ok(cpuset) => cpuset,
        Err(e) => {
            warn!("cannot read the processor affinity mask: {e}");
            return Vec::new();
        }
    };

    let max_id = u32::try_from(libc::CPU_SETSIZE).unwrap_or(1024);

    (0..max_id)
        // SAFETY: The index is below CPU_SETSIZE and the set is a valid cpu_set_t.
        .filter(|&id| unsafe { libc::CPU_ISSET(id as usize, &cpuset) })
        .collect()
}

fn memory_nodes(fs: &impl Filesystem) -> HashMap<ProcessorId, MemoryNodeId> {
    let Some(possible) = fs
        .get_numa_node_possible_contents()
        .and_then(|contents| cpulist::parse(contents.trim()).ok())
    else {
        // Kernels without NUMA support have no node directory. Everything is node 0.
        return HashMap::new();
    };

    let mut result = HashMap::new();

    for node in possible {
        let Some(processors) = fs
            .get_numa_node_cpulist_contents(node)
            .and_then(|contents| cpulist::parse(contents.trim()).ok())
        else {
            continue;
        };

        for processor in processors {
            result.insert(processor, node);
        }
    }

    result
}

fn data_caches(fs: &impl Filesystem, processor: ProcessorId) -> Vec<CacheLevel> {
    let mut caches: Vec<CacheLevel> = Vec::new();

    for index in 0..MAX_CACHE_INDEXES {
        let Some(level) = read_number(fs.get_cpu_cache_contents(processor, index, "level")) else {
            break;
        };

        let cache_type = fs
            .get_cpu_cache_contents(processor, index, "type")
            .unwrap_or_default();

        if cache_type.trim() == "Instruction" {
            continue;
        }

        let Ok(level) = u8::try_from(level) else {
            continue;
        };

        if caches.iter().any(|c| c.level() == level) {
            continue;
        }

        let Some(size) = fs
            .get_cpu_cache_contents(processor, index, "size")
            .as_deref()
            .and_then(parse_size)
        else {
            continue;
        };

        let line_size =
            read_number(fs.get_cpu_cache_contents(processor, index, "coherency_line_size"))
                .unwrap_or(0);
        let associativity =
            read_number(fs.get_cpu_cache_contents(processor, index, "ways_of_associativity"))
                .unwrap_or(0);
        let shared_by = fs
            .get_cpu_cache_contents(processor, index, "shared_cpu_list")
            .and_then(|contents| cpulist::parse(contents.trim()).ok())
            .map_or(1, |list| u32::try_from(list.len()).unwrap_or(u32::MAX));

        caches.push(CacheLevel::new(level, size, line_size, associativity).with_shared_by(shared_by));
    }

    caches
}

fn read_number(contents: Option<String>) -> Option<u32> {
    contents?.trim().parse().ok()
}

/// Parses sysfs sizes such as "48K" or "32M".
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();

    let (digits, multiplier) = match text.chars().last()? {
        'K' => (&text[..text.len() - 1], 1024),
        'M' => (&text[..text.len() - 1], 1024 * 1024),
        'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };

    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

fn parse_vendor(cpuinfo: &str) -> Vendor {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match (key.trim(), value.trim()) {
            ("vendor_id", "GenuineIntel") => return Vendor::Intel,
            ("vendor_id", "AuthenticAMD" | "HygonGenuine") => return Vendor::Amd,
            ("CPU implementer", _) => return Vendor::Arm,
            _ => {}
        }
    }

    Vendor::Other
}

/// Some x86 processors (AMD in particular) report their data TLB size in cpuinfo as
/// "TLB size : 3072 4K pages". Nothing in sysfs describes TLB geometry, so anything beyond this
/// must come from configuration.
fn parse_tlb(cpuinfo: &str) -> Option<TlbLevel> {
    let value = cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "TLB size").then_some(value)
    })?;

    let entries = value.split_whitespace().next()?.parse().ok()?;

    Some(TlbLevel::new(1, entries, 0))
}

/// Entries in /sys/kernel/mm/hugepages are named "hugepages-2048kB".
fn smallest_huge_page_size(directory_names: &[String]) -> Option<u64> {
    directory_names
        .iter()
        .filter_map(|name| {
            name.strip_prefix("hugepages-")?
                .strip_suffix("kB")?
                .parse::<u64>()
                .ok()
        })
        .map(|kb| kb * 1024)
        .min()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::mem;

    use super::*;
    use crate::pal::{BindingsFacade, FilesystemFacade, MockBindings, MockFilesystem};

    const CPUINFO_AMD: &str = "processor\t: 0\nvendor_id\t: AuthenticAMD\nTLB size\t: 3072 4K pages\n\nprocessor\t: 1\nvendor_id\t: AuthenticAMD\n";

    fn bindings_allowing(processors: &'static [usize]) -> BindingsFacade {
        let mut bindings = MockBindings::new();

        bindings.expect_sched_getaffinity_current().returning(move || {
            // SAFETY: All zeroes is a valid cpu_set_t.
            let mut cpuset: libc::cpu_set_t = unsafe { mem::zeroed() };

            for &processor in processors {
                // SAFETY: Index is in bounds.
                unsafe { libc::CPU_SET(processor, &mut cpuset) };
            }

            Ok(cpuset)
        });

        bindings.expect_page_size().return_const(4096_usize);

        BindingsFacade::from_mock(bindings)
    }

    fn two_processor_filesystem() -> FilesystemFacade {
        let mut fs = MockFilesystem::new();

        fs.expect_get_cpuinfo_contents()
            .returning(|| Some(CPUINFO_AMD.to_string()));
        fs.expect_get_online_cpus_contents()
            .returning(|| Some("0-1\n".to_string()));

        fs.expect_get_cpu_topology_contents()
            .withf(|_, file| file == "core_id")
            .returning(|id, _| Some(format!("{}\n", id * 4)));
        fs.expect_get_cpu_topology_contents()
            .withf(|_, file| file == "physical_package_id")
            .returning(|id, _| Some(format!("{id}\n")));

        fs.expect_get_numa_node_possible_contents()
            .returning(|| Some("0-1\n".to_string()));
        fs.expect_get_numa_node_cpulist_contents()
            .returning(|node| Some(format!("{node}\n")));

        fs.expect_get_cpu_cache_contents()
            .withf(|cpu, _, _| *cpu == 0)
            .returning(|_, index, file| {
                let value = match (index, file) {
                    (0, "level") | (1, "level") => "1",
                    (0, "type") => "Data",
                    (1, "type") => "Instruction",
                    (0, "size") => "32K",
                    (0 | 2 | 3, "coherency_line_size") => "64",
                    (0, "ways_of_associativity") => "8",
                    (0 | 2, "shared_cpu_list") => "0",
                    (2, "level") => "2",
                    (2, "type") | (3, "type") => "Unified",
                    (2, "size") => "512K",
                    (2, "ways_of_associativity") => "8",
                    (3, "level") => "3",
                    (3, "size") => "32M",
                    (3, "ways_of_associativity") => "16",
                    (3, "shared_cpu_list") => "0-1",
                    _ => return None,
                };

                Some(format!("{value}\n"))
            });

        fs.expect_get_hugepage_directory_names().returning(|| {
            vec![
                "hugepages-1048576kB".to_string(),
                "hugepages-2048kB".to_string(),
            ]
        });

        FilesystemFacade::from_mock(fs)
    }

    #[test]
    fn detects_two_package_system() {
        let topology = detect(
            &two_processor_filesystem(),
            &bindings_allowing(&[1]),
            2_000_000_000,
        )
        .unwrap();

        assert_eq!(topology.clock_rate(), 2_000_000_000);
        assert_eq!(topology.vendor(), Vendor::Amd);
        assert_eq!(topology.page_size(), 4096);
        assert_eq!(topology.huge_page_size(), Some(2 * 1024 * 1024));

        assert_eq!(topology.processors().len(), 2);
        assert!(!topology.is_allowed(0));
        assert!(topology.is_allowed(1));
        assert_eq!(topology.processor(1).map(Processor::core_id), Some(4));
        assert_eq!(topology.processor(1).map(Processor::package_id), Some(1));
        assert_eq!(topology.processor(1).map(Processor::memory_node), Some(1));
        assert_eq!(topology.package_count(), 2);

        let levels: Vec<_> = topology
            .cache_levels()
            .iter()
            .map(|c| (c.level(), c.size(), c.line_size(), c.associativity(), c.shared_by()))
            .collect();
        assert_eq!(
            levels,
            vec![
                (1, 32 * 1024, 64, 8, 1),
                (2, 512 * 1024, 64, 8, 1),
                (3, 32 * 1024 * 1024, 64, 16, 2),
            ]
        );

        assert_eq!(topology.tlb_level(1).map(TlbLevel::entries), Some(3072));
    }

    #[test]
    fn no_caches_is_unsupported() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_cpuinfo_contents().returning(|| None);
        fs.expect_get_online_cpus_contents()
            .returning(|| Some("0".to_string()));
        fs.expect_get_cpu_topology_contents().returning(|_, _| None);
        fs.expect_get_numa_node_possible_contents()
            .returning(|| None);
        fs.expect_get_cpu_cache_contents().returning(|_, _, _| None);

        let error = detect(
            &FilesystemFacade::from_mock(fs),
            &bindings_allowing(&[0]),
            1_000_000_000,
        )
        .unwrap_err();

        assert!(matches!(error, Error::UnsupportedState(_)));
    }

    #[test]
    fn falls_back_to_affinity_without_online_list() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_cpuinfo_contents()
            .returning(|| Some("vendor_id : GenuineIntel\n".to_string()));
        fs.expect_get_online_cpus_contents().returning(|| None);
        fs.expect_get_cpu_topology_contents().returning(|_, _| None);
        fs.expect_get_numa_node_possible_contents()
            .returning(|| None);
        fs.expect_get_cpu_cache_contents()
            .returning(|_, index, file| match (index, file) {
                (0, "level") => Some("1".to_string()),
                (0, "type") => Some("Data".to_string()),
                (0, "size") => Some("48K".to_string()),
                _ => None,
            });
        fs.expect_get_hugepage_directory_names()
            .returning(Vec::new);

        let topology = detect(
            &FilesystemFacade::from_mock(fs),
            &bindings_allowing(&[2, 3]),
            1_000_000_000,
        )
        .unwrap();

        assert_eq!(topology.vendor(), Vendor::Intel);
        assert_eq!(topology.allowed_processors().count(), 2);
        assert_eq!(topology.processor(3).map(Processor::core_id), Some(3));
        assert_eq!(topology.cache_level(1).map(CacheLevel::line_size), Some(0));
        assert_eq!(topology.huge_page_size(), None);
        assert!(topology.tlb_levels().is_empty());
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("48K"), Some(48 * 1024));
        assert_eq!(parse_size("32M\n"), Some(32 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("K"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn vendor_parsing() {
        assert_eq!(parse_vendor("vendor_id\t: GenuineIntel"), Vendor::Intel);
        assert_eq!(parse_vendor("CPU implementer\t: 0x41"), Vendor::Arm);
        assert_eq!(parse_vendor("model name : something"), Vendor::Other);
    }
}
