// ABOUTME: Ordered registry of static and updatable probes, frozen into a ProbeSet at start.
// ABOUTME: Enforces unique, valid column names and rejects registration once frozen.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::probe::{ProbeError, ProbeValue, Sampler, SqlType};

/// Name of the built-in static probe holding the instance creation time.
pub const STARTED: &str = "started";
/// Name of the built-in static probe holding the OS process id.
pub const PID: &str = "pid";
/// Name of the built-in updatable probe holding seconds since start.
pub const ELAPSED: &str = "elapsed";
/// Name of the built-in updatable probe holding the last probe failure.
pub const ERROR: &str = "error";

/// Errors that can occur while registering probes.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot register probe {0:?}: the polling loop has already started")]
    RegistrationAfterStart(String),

    #[error("a probe named {0:?} is already registered")]
    DuplicateName(String),

    #[error("{0:?} is not a valid column name")]
    InvalidName(String),

    #[error("could not infer the type of probe {name:?}: {source}")]
    Inference {
        name: String,
        #[source]
        source: ProbeError,
    },
}

/// A probe evaluated once, when the status row is created.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticProbe {
    pub index: usize,
    pub name: String,
    pub sql_type: SqlType,
    pub value: ProbeValue,
}

/// Where an updatable probe gets its value on each tick.
pub enum UpdatableSource {
    /// Seconds since the logical start, supplied by the polling loop.
    Elapsed,
    /// The last probe failure; NULL on every successful tick.
    LastError,
    Sampler(Box<dyn Sampler>),
}

impl fmt::Debug for UpdatableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatableSource::Elapsed => f.write_str("Elapsed"),
            UpdatableSource::LastError => f.write_str("LastError"),
            UpdatableSource::Sampler(_) => f.write_str("Sampler(..)"),
        }
    }
}

/// A probe re-evaluated on every tick of the polling loop.
#[derive(Debug)]
pub struct UpdatableProbe {
    pub index: usize,
    pub name: String,
    pub sql_type: SqlType,
    pub source: UpdatableSource,
}

/// Builder for the probe set. Accepts registrations until frozen.
#[derive(Debug)]
pub struct ProbeRegistry {
    statics: Vec<StaticProbe>,
    updatables: Vec<UpdatableProbe>,
    frozen: bool,
}

impl ProbeRegistry {
    /// Create a registry holding the four built-in probes, stamped with the
    /// current time and process id.
    pub fn new() -> Self {
        Self::with_builtins(Utc::now(), std::process::id())
    }

    /// Create a registry holding the four built-in probes: `started` and
    /// `pid` (static), then `elapsed` and `error` (updatable).
    pub fn with_builtins(started: DateTime<Utc>, pid: u32) -> Self {
        let mut registry = Self {
            statics: Vec::new(),
            updatables: Vec::new(),
            frozen: false,
        };
        registry.push_static(STARTED, SqlType::Timestamp, started.into());
        registry.push_static(PID, SqlType::Integer, pid.into());
        registry.push_updatable(ELAPSED, SqlType::Float, UpdatableSource::Elapsed);
        registry.push_updatable(ERROR, SqlType::Varchar, UpdatableSource::LastError);
        registry
    }

    /// Register a static probe, inferring its column type from the value.
    pub fn add_static(
        &mut self,
        name: &str,
        value: impl Into<ProbeValue>,
    ) -> Result<(), RegistryError> {
        let value = value.into();
        let sql_type = SqlType::infer(&value);
        self.add_static_typed(name, sql_type, value)
    }

    /// Register a static probe with an explicit column type.
    pub fn add_static_typed(
        &mut self,
        name: &str,
        sql_type: SqlType,
        value: impl Into<ProbeValue>,
    ) -> Result<(), RegistryError> {
        self.check_registrable(name)?;
        self.push_static(name, sql_type, value.into());
        Ok(())
    }

    /// Register an updatable probe. The sampler is evaluated once right away
    /// to infer the column type; that value is discarded.
    pub fn add_updatable<S>(&mut self, name: &str, mut sampler: S) -> Result<(), RegistryError>
    where
        S: Sampler + 'static,
    {
        self.check_registrable(name)?;
        let probe = sampler.sample().map_err(|source| RegistryError::Inference {
            name: name.to_string(),
            source,
        })?;
        let sql_type = SqlType::infer(&probe);
        self.push_updatable(name, sql_type, UpdatableSource::Sampler(Box::new(sampler)));
        Ok(())
    }

    /// Register an updatable probe with an explicit column type.
    pub fn add_updatable_typed<S>(
        &mut self,
        name: &str,
        sql_type: SqlType,
        sampler: S,
    ) -> Result<(), RegistryError>
    where
        S: Sampler + 'static,
    {
        self.check_registrable(name)?;
        self.push_updatable(name, sql_type, UpdatableSource::Sampler(Box::new(sampler)));
        Ok(())
    }

    /// Whether the registry has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn statics(&self) -> &[StaticProbe] {
        &self.statics
    }

    pub fn updatables(&self) -> &[UpdatableProbe] {
        &self.updatables
    }

    /// Freeze the registry and move its probes into an immutable set.
    /// Every later registration fails with `RegistrationAfterStart`.
    pub fn freeze(&mut self) -> ProbeSet {
        self.frozen = true;
        ProbeSet {
            statics: std::mem::take(&mut self.statics),
            updatables: std::mem::take(&mut self.updatables),
        }
    }

    fn check_registrable(&self, name: &str) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::RegistrationAfterStart(name.to_string()));
        }
        if !is_valid_identifier(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        // SQLite column names compare case-insensitively.
        let taken = self
            .statics
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.updatables.iter().map(|p| p.name.as_str()))
            .any(|existing| existing.eq_ignore_ascii_case(name));
        if taken {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn push_static(&mut self, name: &str, sql_type: SqlType, value: ProbeValue) {
        tracing::debug!(probe = name, %sql_type, "registered static probe");
        self.statics.push(StaticProbe {
            index: self.statics.len() + 1,
            name: name.to_string(),
            sql_type,
            value,
        });
    }

    fn push_updatable(&mut self, name: &str, sql_type: SqlType, source: UpdatableSource) {
        tracing::debug!(probe = name, %sql_type, "registered updatable probe");
        self.updatables.push(UpdatableProbe {
            index: self.updatables.len() + 1,
            name: name.to_string(),
            sql_type,
            source,
        });
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable probe set handed to the polling loop.
#[derive(Debug)]
pub struct ProbeSet {
    statics: Vec<StaticProbe>,
    updatables: Vec<UpdatableProbe>,
}

impl ProbeSet {
    pub fn statics(&self) -> &[StaticProbe] {
        &self.statics
    }

    pub fn updatables(&self) -> &[UpdatableProbe] {
        &self.updatables
    }

    /// Values bound into the initial insert, in index order.
    pub fn static_values(&self) -> Vec<ProbeValue> {
        self.statics.iter().map(|p| p.value.clone()).collect()
    }

    /// Sample every updatable probe in index order. Stops at the first
    /// failing sampler.
    pub fn sample(&mut self, elapsed_secs: f64) -> Result<Vec<ProbeValue>, ProbeError> {
        let mut values = Vec::with_capacity(self.updatables.len());
        for probe in &mut self.updatables {
            let value = match &mut probe.source {
                UpdatableSource::Elapsed => ProbeValue::Float(elapsed_secs),
                UpdatableSource::LastError => ProbeValue::Null,
                UpdatableSource::Sampler(sampler) => sampler.sample()?,
            };
            values.push(value);
        }
        Ok(values)
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
