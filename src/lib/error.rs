//! # Runtime Error Types
//!
//! Allocation and compilation failures are unrecoverable at the runtime layer
//! and are returned as `RuntimeError` values so the task orchestrator can
//! decide what to do. Native failures on the enqueue hot paths never reach
//! this type: the queue adapter logs them and hands back a sentinel handle.

use thiserror::Error;

use crate::context::ContextState;
use crate::driver::DriverError;

/// Errors produced by the device runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(
        "out of device memory: requested {requested} bytes, {available} of {capacity} bytes available"
    )]
    OutOfMemory {
        requested: u64,
        available: u64,
        capacity: u64,
    },

    /// The device refused a heap or bump region, even after the request was
    /// capped to its largest single allocation. This is the out-of-memory
    /// condition of region reservation; the driver's reason is the source.
    #[error(
        "out of device memory: unable to allocate region of {requested} bytes on {device}: {source}"
    )]
    RegionAllocation {
        device: String,
        requested: u64,
        #[source]
        source: DriverError,
    },

    #[error("heap region already allocated")]
    RegionAlreadyAllocated,

    #[error("heap region has not been allocated")]
    RegionNotAllocated,

    #[error("range [{offset}, {end}) lies outside the heap region of {size} bytes")]
    InvalidRange { offset: u64, end: u64, size: u64 },

    #[error("unable to install kernel {entry_point} for task {task_id}: {reason}")]
    Compilation {
        task_id: String,
        entry_point: String,
        reason: String,
    },

    #[error("unable to read back the heap base address on {device}: {reason}")]
    HeapLookup { device: String, reason: String },

    #[error("device context is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: ContextState,
        found: ContextState,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// True for both a full heap and a region the device refused.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            RuntimeError::OutOfMemory { .. } | RuntimeError::RegionAllocation { .. }
        )
    }
}

/// Errors raised while building a [`crate::RuntimeConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias used across the runtime.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
