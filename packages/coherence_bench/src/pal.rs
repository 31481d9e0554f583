//! Platform Abstraction Layer (PAL). Every call into the operating system goes through the
//! traits defined here, so the logic above this layer can be exercised with mocks.

mod bindings;
pub(crate) use bindings::*;

mod filesystem;
pub(crate) use filesystem::*;
