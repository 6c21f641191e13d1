//! # Native Device Layer
//!
//! The platform layer (out of scope for this crate) opens a device and hands
//! the runtime an implementation of [`Driver`]: the raw, asynchronous command
//! submission primitive plus the few allocation and module-loading calls the
//! runtime needs. Everything above this seam speaks in opaque handles.
//!
//! Two implementations ship with the crate:
//!
//! - [`crate::host::HostDriver`]: an in-process emulated device.
//! - `crate::cuda::CudaDriver`: the CUDA driver API (feature `cuda`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! native_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// The "no handle" sentinel returned when a native call fails.
            pub const NONE: Self = Self(0);

            /// Returns `true` for the sentinel handle.
            pub fn is_none(self) -> bool {
                self.0 == 0
            }

            /// Raw driver value.
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

native_handle!(
    /// Handle to a device memory object (the heap region or the bump buffer).
    NativeBuffer
);
native_handle!(
    /// Handle to a loaded kernel entry point.
    NativeKernel
);
native_handle!(
    /// Handle to the completion event of one queued command.
    NativeEvent
);

/// Broad class of the opened device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    /// FPGAs and other fixed-function accelerators.
    Accelerator,
    Custom,
}

/// Static description of the opened device, reported once by the driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Short backend name used in device ids (`host`, `cuda`, ...).
    pub backend: String,
    pub name: String,
    pub kind: DeviceKind,
    pub platform_name: String,
    pub platform_index: usize,
    pub device_index: usize,
    /// Largest single allocation the device accepts.
    pub max_alloc_size: u64,
    pub global_mem_size: u64,
    pub max_work_group_size: u64,
    /// Queue capability level, encoded like OpenCL versions (`120` = 1.2).
    pub capability_version: u32,
    pub little_endian: bool,
}

/// Kernel payload produced by the external compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelCode {
    /// Source text the driver still has to build.
    Source(String),
    /// A pre-built binary image (PTX, cubin, FPGA bitstream, ...).
    Binary(Vec<u8>),
}

impl KernelCode {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KernelCode::Source(src) => src.as_bytes(),
            KernelCode::Binary(bin) => bin,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_source(&self) -> bool {
        matches!(self, KernelCode::Source(_))
    }
}

/// N-dimensional launch shape. Unused dimensions are 1 (offset 0).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub dims: u32,
    pub global_offset: [u64; 3],
    pub global_work: [u64; 3],
    pub local_work: Option<[u64; 3]>,
}

impl LaunchGeometry {
    /// Geometry of a serial task: one work item.
    pub fn serial() -> Self {
        Self {
            dims: 1,
            global_offset: [0; 3],
            global_work: [1, 1, 1],
            local_work: Some([1, 1, 1]),
        }
    }

    /// Builds an n-dimensional geometry; fails unless `1 <= dims <= 3` and
    /// every slice carries exactly `dims` entries.
    pub fn new(
        global_offset: &[u64],
        global_work: &[u64],
        local_work: Option<&[u64]>,
    ) -> Result<Self, String> {
        let dims = global_work.len();
        if !(1..=3).contains(&dims) {
            return Err(format!("unsupported work dimensionality {}", dims));
        }
        if !global_offset.is_empty() && global_offset.len() != dims {
            return Err(format!(
                "global offset has {} dims, global work has {}",
                global_offset.len(),
                dims
            ));
        }
        if global_work.contains(&0) {
            return Err("global work size contains a zero dimension".to_string());
        }

        let mut geometry = Self {
            dims: dims as u32,
            global_offset: [0; 3],
            global_work: [1; 3],
            local_work: None,
        };
        geometry.global_work[..dims].copy_from_slice(global_work);
        geometry.global_offset[..global_offset.len()].copy_from_slice(global_offset);

        if let Some(local) = local_work {
            if local.len() != dims {
                return Err(format!(
                    "local work has {} dims, global work has {}",
                    local.len(),
                    dims
                ));
            }
            let mut padded = [1u64; 3];
            padded[..dims].copy_from_slice(local);
            for d in 0..dims {
                if padded[d] == 0 || geometry.global_work[d] % padded[d] != 0 {
                    return Err(format!(
                        "local size {} does not divide global size {} in dim {}",
                        padded[d], geometry.global_work[d], d
                    ));
                }
            }
            geometry.local_work = Some(padded);
        }

        Ok(geometry)
    }

    /// Total number of work items.
    pub fn work_items(&self) -> u64 {
        self.global_work.iter().product()
    }
}

/// Arguments every compiled kernel receives: the heap and its call frame.
///
/// Kernels address all data through `heap + offset` (stack-relative), so one
/// buffer handle and one frame offset are enough for any task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelArgs {
    pub heap: NativeBuffer,
    pub frame_offset: u64,
    /// Leading dummy buffer on devices that must not place the heap at 0.
    pub bump: Option<NativeBuffer>,
    /// Whether pointers written into frames are heap-relative.
    pub relative_addresses: bool,
}

/// Execution status of a queued command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error(i32),
}

impl EventStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Error(_))
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Queued => write!(f, "QUEUED"),
            EventStatus::Submitted => write!(f, "SUBMITTED"),
            EventStatus::Running => write!(f, "RUNNING"),
            EventStatus::Complete => write!(f, "COMPLETE"),
            EventStatus::Error(code) => write!(f, "ERROR({})", code),
        }
    }
}

/// Device timestamps of one command, in nanoseconds on the device clock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventProfile {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

impl EventProfile {
    /// Execution time on the device.
    pub fn duration_ns(&self) -> u64 {
        self.ended.saturating_sub(self.started)
    }
}

/// A failed native call, carrying the device-specific error string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} failed (code {code}): {message}")]
pub struct DriverError {
    pub call: &'static str,
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            code,
            message: message.into(),
        }
    }
}

/// Raw command submission primitive for one opened device and its queue.
///
/// Transfer calls must be finished with the host slice before they return,
/// even when `blocking` is false; the returned event still tracks device-side
/// completion for dependency purposes.
pub trait Driver: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn allocate_region(&self, bytes: u64) -> Result<NativeBuffer, DriverError>;
    fn release_region(&self, buffer: NativeBuffer) -> Result<(), DriverError>;

    fn load_kernel(&self, entry_point: &str, code: &KernelCode)
        -> Result<NativeKernel, DriverError>;
    fn unload_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError>;

    /// Code of the kernel that writes the heap's absolute device address
    /// into the first 8 bytes of its frame.
    fn bootstrap_kernel(&self) -> KernelCode;

    fn enqueue_write(
        &self,
        buffer: NativeBuffer,
        blocking: bool,
        offset: u64,
        src: &[u8],
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn enqueue_read(
        &self,
        buffer: NativeBuffer,
        blocking: bool,
        offset: u64,
        dst: &mut [u8],
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn enqueue_kernel(
        &self,
        kernel: NativeKernel,
        geometry: &LaunchGeometry,
        args: &KernelArgs,
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn enqueue_barrier(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError>;
    fn enqueue_marker(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError>;

    fn flush(&self) -> Result<(), DriverError>;
    fn finish(&self) -> Result<(), DriverError>;

    fn wait_events(&self, events: &[NativeEvent]) -> Result<(), DriverError>;
    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError>;
    fn event_profile(&self, event: NativeEvent) -> Result<EventProfile, DriverError>;
    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_pads_unused_dims() {
        let g = LaunchGeometry::new(&[], &[64, 8], Some(&[16, 4])).unwrap();
        assert_eq!(g.dims, 2);
        assert_eq!(g.global_work, [64, 8, 1]);
        assert_eq!(g.local_work, Some([16, 4, 1]));
        assert_eq!(g.work_items(), 512);
    }

    #[test]
    fn test_geometry_rejects_bad_shapes() {
        assert!(LaunchGeometry::new(&[], &[], None).is_err());
        assert!(LaunchGeometry::new(&[], &[1, 1, 1, 1], None).is_err());
        assert!(LaunchGeometry::new(&[0], &[8, 8], None).is_err());
        assert!(LaunchGeometry::new(&[], &[10], Some(&[3])).is_err());
        assert!(LaunchGeometry::new(&[], &[0], None).is_err());
    }

    #[test]
    fn test_none_handles() {
        assert!(NativeEvent::NONE.is_none());
        assert!(!NativeEvent(7).is_none());
        assert_eq!(format!("{:x}", NativeKernel(255)), "ff");
    }
}
