//! Error types for the orchestration pipeline.

use std::fmt;

use thiserror::Error;

use crate::providers::ProviderError;

// =============================================================================
// Configuration
// =============================================================================

/// Problems detected before any resource is touched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse cluster description: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required field '{field}' in {context}")]
    MissingField { context: String, field: String },

    #[error("Invalid value for {context}: {reason}")]
    Invalid { context: String, reason: String },

    #[error("Unknown unit type '{unit_type}' (unit '{unit}')")]
    UnknownUnitType { unit: String, unit_type: String },

    #[error("Unit '{unit}' depends on '{dependency}', which is neither a unit nor a group")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Duplicate unit id '{0}'")]
    DuplicateUnit(String),

    #[error("Units '{first}' and '{second}' would both publish '{key}'")]
    ConflictingKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("VM count mismatch: groups declare {expected} VMs but {actual} were created")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Group '{group}' needs {needed} addresses but only has {available}")]
    InsufficientAddresses {
        group: String,
        needed: usize,
        available: usize,
    },
}

// =============================================================================
// Resource creation
// =============================================================================

/// Failure to create one VM.
#[derive(Error, Debug)]
pub enum CreateError {
    #[error("VM {vm} cannot be created: {source}")]
    Fatal {
        vm: String,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to create VM {vm} after {attempts} attempts: {source}")]
    Exhausted {
        vm: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("VM {vm} must be created after {after}, which does not exist yet")]
    OrderingViolation { vm: String, after: String },
}

// =============================================================================
// Dependency map
// =============================================================================

/// Failed lookup or write in the dependency map.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepError {
    #[error("'{requester}' needs '{key}' but it is not available")]
    Missing { key: String, requester: String },

    #[error("'{key}' holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("'{key}' is already written and cannot be replaced")]
    AlreadyWritten { key: String },

    #[error("Group '{group}' uses dynamic addressing, no addresses are known")]
    DynamicAddresses { group: String },
}

// =============================================================================
// Remote execution
// =============================================================================

/// Failure running a script on a node.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to spawn remote session to {host}: {reason}")]
    Spawn { host: String, reason: String },

    #[error("Script on {host} exited with {code:?}: {stderr}")]
    Failed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },
}

// =============================================================================
// Unit handlers
// =============================================================================

/// Failure inside a unit handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Dependency(#[from] DepError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid unit config: {0}")]
    Config(String),

    #[error("No nodes to run on: {0}")]
    NoNodes(String),
}

// =============================================================================
// Scheduling
// =============================================================================

/// A unit left pending when the scheduler ran out of runnable work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckUnit {
    /// Unit id.
    pub unit: String,
    /// Dependencies that never completed.
    pub unmet: Vec<String>,
}

impl fmt::Display for StuckUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (waiting on {})", self.unit, self.unmet.join(", "))
    }
}

/// Failure of a whole execution run.
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Dependency deadlock, pending units: {}", display_stuck(.pending))]
    Deadlock { pending: Vec<StuckUnit> },

    #[error("Failed to execute {unit_type} '{unit}' for {role}: {source}")]
    Handler {
        unit: String,
        unit_type: String,
        role: String,
        #[source]
        source: HandlerError,
    },

    #[error("No handler registered for unit type '{0}'")]
    Unregistered(String),
}

fn display_stuck(pending: &[StuckUnit]) -> String {
    pending
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
