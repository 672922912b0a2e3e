// ABOUTME: Caller-facing handle: register probes, finalize and start the polling thread, shut it down.
// ABOUTME: Shutdown raises a cooperative stop signal and joins the thread; dropping the handle does the same.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use beacon_core::{ProbeRegistry, ProbeValue, RegistryError, Sampler, SqlType};
use beacon_store::{SqliteOpener, StoreOpener};
use chrono::Utc;
use thiserror::Error;

use crate::config::BeaconConfig;
use crate::poller::{LoopOutcome, PollingLoop};

const THREAD_NAME: &str = "beacon-poller";

/// Errors surfaced synchronously to the caller of a [`Beacon`].
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("the polling loop has already been started")]
    AlreadyStarted,

    #[error("the polling loop has not been started")]
    NotStarted,

    #[error("unable to spawn the polling thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("the polling thread panicked")]
    LoopPanicked,
}

/// A status beacon: a probe registry plus, once started, the polling thread
/// that records those probes.
///
/// Register probes, call [`Beacon::finalize_and_start`] right before the
/// work to observe, and [`Beacon::shutdown`] right after it, whether or not
/// that work succeeded.
pub struct Beacon<O: StoreOpener = SqliteOpener> {
    config: BeaconConfig,
    registry: ProbeRegistry,
    opener: Option<O>,
    started_at: Instant,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<LoopOutcome>>,
    outcome: Option<LoopOutcome>,
}

impl Beacon<SqliteOpener> {
    /// Create a beacon writing to the SQLite file at `config.path`.
    pub fn new(config: BeaconConfig) -> Self {
        let opener = SqliteOpener::new(config.path.clone());
        Self::with_opener(config, opener)
    }
}

impl<O: StoreOpener> Beacon<O> {
    /// Create a beacon writing through `opener`. The logical start time that
    /// `elapsed` counts from is now.
    pub fn with_opener(config: BeaconConfig, opener: O) -> Self {
        Self {
            registry: ProbeRegistry::with_builtins(Utc::now(), std::process::id()),
            opener: Some(opener),
            started_at: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            outcome: None,
            config,
        }
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    /// Read access to the probes registered so far (empty once started).
    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    pub fn add_static(
        &mut self,
        name: &str,
        value: impl Into<ProbeValue>,
    ) -> Result<(), BeaconError> {
        Ok(self.registry.add_static(name, value)?)
    }

    pub fn add_static_typed(
        &mut self,
        name: &str,
        sql_type: SqlType,
        value: impl Into<ProbeValue>,
    ) -> Result<(), BeaconError> {
        Ok(self.registry.add_static_typed(name, sql_type, value)?)
    }

    /// Register a probe sampled on every tick; its type is inferred from
    /// one immediate evaluation.
    pub fn add_updatable<S>(&mut self, name: &str, sampler: S) -> Result<(), BeaconError>
    where
        S: Sampler + 'static,
    {
        Ok(self.registry.add_updatable(name, sampler)?)
    }

    pub fn add_updatable_typed<S>(
        &mut self,
        name: &str,
        sql_type: SqlType,
        sampler: S,
    ) -> Result<(), BeaconError>
    where
        S: Sampler + 'static,
    {
        Ok(self.registry.add_updatable_typed(name, sql_type, sampler)?)
    }

    /// Whether the polling thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the polling loop and wait for its thread to exit. The loop
    /// performs at most one more tick. Later calls return the same outcome.
    pub fn shutdown(&mut self) -> Result<LoopOutcome, BeaconError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let handle = self.thread.take().ok_or(BeaconError::NotStarted)?;

        self.stop.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        let outcome = handle.join().map_err(|_| BeaconError::LoopPanicked)?;

        tracing::debug!(?outcome, "status beacon stopped");
        self.outcome = Some(outcome);
        Ok(outcome)
    }
}

impl<O> Beacon<O>
where
    O: StoreOpener + Send + 'static,
{
    /// Freeze the registry and start the polling thread. Must be called
    /// exactly once, after every probe has been registered.
    pub fn finalize_and_start(&mut self) -> Result<(), BeaconError> {
        let opener = self.opener.take().ok_or(BeaconError::AlreadyStarted)?;
        let probes = self.registry.freeze();

        tracing::info!(
            path = %self.config.path.display(),
            static_probes = probes.statics().len(),
            updatable_probes = probes.updatables().len(),
            "starting status beacon"
        );

        let poller = PollingLoop::new(
            opener,
            probes,
            self.config.interval,
            self.config.max_errors,
            self.started_at,
            Arc::clone(&self.stop),
        );
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || poller.run())
            .map_err(BeaconError::Spawn)?;

        self.thread = Some(handle);
        Ok(())
    }

    /// [`Beacon::shutdown`] for async callers: the join runs on tokio's
    /// blocking pool instead of the calling task.
    pub async fn shutdown_async(mut self) -> Result<LoopOutcome, BeaconError> {
        tokio::task::spawn_blocking(move || self.shutdown())
            .await
            .map_err(|_| BeaconError::LoopPanicked)?
    }
}

impl<O: StoreOpener> Drop for Beacon<O> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!(error = %e, "status beacon did not shut down cleanly");
            }
        }
    }
}
