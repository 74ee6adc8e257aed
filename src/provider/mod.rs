//! Provider adapters: the seam between the executor and the cloud.
//!
//! [`CliProvider`] drives the real services through generated scripts.
//! [`MemoryProvider`] keeps objects in memory and records every mutation.

pub mod cli;
pub mod memory;

pub use cli::CliProvider;
pub use memory::MemoryProvider;

use crate::core::error::ProviderError;
use crate::core::types::{Outputs, RecordedOutputs, ResourceLock, ResourceSpec};

/// Create, read, update and delete resources of every kind. Specs passed in
/// have their references resolved.
pub trait Provider {
    /// Current remote object, or `None` if it does not exist.
    fn read(&mut self, spec: &ResourceSpec) -> Result<Option<RecordedOutputs>, ProviderError>;

    fn create(&mut self, spec: &ResourceSpec) -> Result<Outputs, ProviderError>;

    /// Converge an existing object. `prior` holds its last known outputs.
    fn update(
        &mut self,
        spec: &ResourceSpec,
        prior: &RecordedOutputs,
    ) -> Result<Outputs, ProviderError>;

    /// Delete the object recorded under `id`. Kinds living inside another
    /// object are removed with it and return immediately.
    fn delete(&mut self, id: &str, lock: &ResourceLock) -> Result<(), ProviderError>;

    /// One reachability check. `Err` carries the connection error.
    fn probe(&mut self, spec: &ResourceSpec) -> Result<(), String>;
}
