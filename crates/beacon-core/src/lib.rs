// ABOUTME: Core library for beacon, containing the probe model, registry, and schema synthesis.
// ABOUTME: This crate is pure: it performs no I/O and owns no threads.

pub mod probe;
pub mod registry;
pub mod schema;

pub use probe::{ProbeError, ProbeValue, Sampler, SqlType};
pub use registry::{ProbeRegistry, ProbeSet, RegistryError, StaticProbe, UpdatableProbe, UpdatableSource};
pub use schema::{STATUS_TABLE, Schema};
