#![allow(missing_docs)]
//! # accelrt: Per-Device Accelerator Runtime
//!
//! Executes already-compiled kernels on a GPU or other accelerator. For each
//! opened device the runtime keeps one contiguous heap region, a cache of
//! loaded kernels keyed by task identity, and a bounded table of in-flight
//! events used for dependency tracking and profiling.
//!
//! Compiling kernels and enumerating devices happen elsewhere: the embedder
//! hands a [`DeviceContext`] an opened device as an `Arc<dyn Driver>` and
//! feeds it compiled code plus [`TaskMetaData`].
//!
//! ## Core Modules
//!
//! - `context`: the `DeviceContext` façade and its lifecycle.
//! - `memory`: bump allocator over the heap region.
//! - `cache`: compile-once kernel cache.
//! - `events`: the ring of in-flight events and their ids.
//! - `queue`: command queue adapter over the native driver.
//! - `driver`: the native seam and its handle types.
//! - `host`: in-process emulated device.
//! - `cuda`: CUDA driver-API backend (feature `cuda`).
//! - `device`, `metadata`, `config`, `error`, `util`: supporting pieces.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use accelrt::{DeviceContext, HostDeviceSpec, HostDriver, RuntimeConfig};
//!
//! # fn main() -> accelrt::Result<()> {
//! let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
//! let config = RuntimeConfig { heap_size: 1 << 20, ..RuntimeConfig::default() };
//! let mut ctx = DeviceContext::new(driver, &config)?;
//! ctx.init()?;
//!
//! let input = ctx.allocate_buffer(4 * 1024)?;
//! let data = vec![1.0f32; 1024];
//! let write = ctx.enqueue_write_buffer(input.buffer, input.offset, input.length, &data, 0, &[]);
//! ctx.resolve_event(write).wait();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod host;
pub mod memory;
pub mod metadata;
pub mod queue;
pub mod util;

pub use cache::{InstalledKernel, KernelCache, KernelKey};
pub use config::RuntimeConfig;
pub use context::{ContextState, DeviceContext};
#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use device::{CapabilityTable, DeviceCapabilities};
pub use driver::{
    DeviceInfo, DeviceKind, Driver, DriverError, EventProfile, EventStatus, KernelArgs,
    KernelCode, LaunchGeometry, NativeBuffer, NativeEvent, NativeKernel,
};
pub use error::{ConfigError, Result, RuntimeError};
pub use events::{
    Event, EventDescription, EventId, EventSnapshot, EventTable, HostPrimitive, PrimitiveKind,
    NO_EVENT,
};
pub use host::{HostDeviceSpec, HostDriver, HostFault, HostInvocation};
pub use memory::{MemoryManager, SubBuffer, HEAP_ALIGNMENT};
pub use metadata::{Access, TaskMetaData, TaskOverrides};
pub use queue::CommandQueue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
