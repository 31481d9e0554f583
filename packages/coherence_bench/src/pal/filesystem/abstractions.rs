#![cfg_attr(test, expect(
    clippy::struct_field_names,
    reason = "false positive from automock generated code"
))]

use std::fmt::Debug;

/// Linux has this funny notion of exposing various OS APIs as a virtual filesystem. This trait
/// abstracts the parts of that virtual filesystem we read, to allow it to be mocked.
///
/// Every getter returns `None` if the file does not exist, which is normal for many of them on
/// virtual machines and on kernels built without NUMA support.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Filesystem: Debug + Send + Sync + 'static {
    /// Get the contents of the /proc/cpuinfo file.
    ///
    /// This is a plaintext file with "key    : value" pairs, blocks separated by empty lines.
    fn get_cpuinfo_contents(&self) -> Option<String>;

    /// Get the contents of the /sys/devices/system/cpu/online file.
    ///
    /// This is a cpulist format file ("0,1,2-4,5-10:2" style list).
    fn get_online_cpus_contents(&self) -> Option<String>;

    /// Gets the contents of /sys/devices/system/cpu/cpu{cpu}/topology/{file}, where `file` is
    /// `core_id` or `physical_package_id`.
    fn get_cpu_topology_contents(&self, cpu_index: u32, file: &str) -> Option<String>;

    /// Gets the contents of /sys/devices/system/cpu/cpu{cpu}/cache/index{index}/{file}, where
    /// `file` is one of `level`, `type`, `size`, `coherency_line_size`,
    /// `ways_of_associativity` or `shared_cpu_list`.
    fn get_cpu_cache_contents(&self, cpu_index: u32, cache_index: u32, file: &str)
    -> Option<String>;

    /// Get the contents of the /sys/devices/system/node/possible file.
    ///
    /// This is a cpulist format file ("0,1,2-4,5-10:2" style list).
    fn get_numa_node_possible_contents(&self) -> Option<String>;

    /// Get the contents of the /sys/devices/system/node/node{}/cpulist file.
    ///
    /// This is a cpulist format file ("0,1,2-4,5-10:2" style list).
    fn get_numa_node_cpulist_contents(&self, node_index: u32) -> Option<String>;

    /// Names of the entries in /sys/kernel/mm/hugepages, e.g. "hugepages-2048kB".
    fn get_hugepage_directory_names(&self) -> Vec<String>;
}
