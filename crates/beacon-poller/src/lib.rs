// ABOUTME: Polling side of beacon: configuration, the background sampling loop, and its handle.
// ABOUTME: A Beacon collects probes, starts one polling thread, and joins it on shutdown.

pub mod beacon;
pub mod config;
pub mod poller;

pub use beacon::{Beacon, BeaconError};
pub use config::{BeaconConfig, ConfigError};
pub use poller::{LoopOutcome, PollingLoop};
