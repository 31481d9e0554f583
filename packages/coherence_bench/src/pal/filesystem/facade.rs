use std::fmt::Debug;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockFilesystem;
use crate::pal::{BuildTargetFilesystem, Filesystem};

/// Enum to hide the different filesystem implementations behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum FilesystemFacade {
    Target(&'static BuildTargetFilesystem),

    #[cfg(test)]
    Mock(Arc<MockFilesystem>),
}

impl FilesystemFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetFilesystem)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockFilesystem) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Filesystem for FilesystemFacade {
    fn get_cpuinfo_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_cpuinfo_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cpuinfo_contents(),
        }
    }

    fn get_online_cpus_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_online_cpus_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_online_cpus_contents(),
        }
    }

    fn get_cpu_topology_contents(&self, cpu_index: u32, file: &str) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_cpu_topology_contents(cpu_index, file),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cpu_topology_contents(cpu_index, file),
        }
    }

    fn get_cpu_cache_contents(
        &self,
        cpu_index: u32,
        cache_index: u32,
        file: &str,
    ) -> Option<String> {
        match self {
            Self::Target(filesystem) => {
                filesystem.get_cpu_cache_contents(cpu_index, cache_index, file)
            }
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cpu_cache_contents(cpu_index, cache_index, file),
        }
    }

    fn get_numa_node_possible_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_numa_node_possible_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_numa_node_possible_contents(),
        }
    }

    fn get_numa_node_cpulist_contents(&self, node_index: u32) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_numa_node_cpulist_contents(node_index),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_numa_node_cpulist_contents(node_index),
        }
    }

    fn get_hugepage_directory_names(&self) -> Vec<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_hugepage_directory_names(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_hugepage_directory_names(),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for FilesystemFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
