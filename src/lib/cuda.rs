//! # CUDA Backend
//!
//! `CudaDriver` implements [`Driver`] on top of the CUDA driver API through
//! `cudarc`. One driver owns one device and a stream forked from its default
//! stream; every command is bracketed by a pair of CUDA events so it can be
//! waited on and profiled.
//!
//! - Regions are raw `cuMemAlloc` allocations; the handle is the device
//!   pointer itself.
//! - Kernels are PTX (compiled from source with NVRTC when needed) loaded as
//!   modules. A kernel receives `(heap pointer, frame offset)`.
//! - Timestamps are measured against an epoch event recorded at start-up.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::Arc;

use cudarc::driver::result::{self, event, stream};
use cudarc::driver::{sys, CudaDevice, CudaStream};
use parking_lot::Mutex;

use crate::driver::{
    DeviceInfo, DeviceKind, Driver, DriverError, EventProfile, EventStatus, KernelArgs,
    KernelCode, LaunchGeometry, NativeBuffer, NativeEvent, NativeKernel,
};

/// Bootstrap kernel: writes the heap's device address into its frame.
const LOOKUP_BUFFER_ADDRESS_SOURCE: &str = r#"
extern "C" __global__ void lookup_buffer_address(unsigned char *heap, unsigned long long frame)
{
    unsigned long long *slots = (unsigned long long *) (heap + frame);
    slots[0] = (unsigned long long) heap;
}
"#;

/// Block size used when a launch leaves the local size to the driver.
const DEFAULT_BLOCK: u64 = 256;

fn cuda_error(call: &'static str, e: cudarc::driver::DriverError) -> DriverError {
    DriverError::new(call, e.0 as i32, format!("{:?}", e.0))
}

struct LoadedModule {
    module: sys::CUmodule,
    function: sys::CUfunction,
}

struct CommandEvents {
    start: sys::CUevent,
    end: sys::CUevent,
}

struct CudaState {
    modules: HashMap<u64, LoadedModule>,
    events: HashMap<u64, CommandEvents>,
    next_handle: u64,
}

// CUDA handles are valid in every thread bound to the device's context, and
// all access goes through the driver's mutex.
unsafe impl Send for CudaState {}

pub struct CudaDriver {
    device: Arc<CudaDevice>,
    stream: CudaStream,
    info: DeviceInfo,
    epoch: sys::CUevent,
    state: Mutex<CudaState>,
}

// See `CudaState`.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Opens device `ordinal` and forks a stream for the runtime's queue.
    pub fn new(ordinal: usize) -> anyhow::Result<Self> {
        use anyhow::Context;

        let device = CudaDevice::new(ordinal).context("Failed to initialize CUDA device")?;
        let stream = device
            .fork_default_stream()
            .context("Failed to create CUDA stream")?;

        let name = device.name().context("Failed to query device name")?;
        let (_, total_mem) = result::mem_get_info().context("Failed to query device memory")?;
        let max_threads = device
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .context("Failed to query max threads per block")?;

        let epoch = event::create(sys::CUevent_flags_enum::CU_EVENT_DEFAULT)
            .context("Failed to create epoch event")?;
        unsafe {
            event::record(epoch, stream.stream).context("Failed to record epoch event")?;
        }

        let info = DeviceInfo {
            backend: "cuda".to_string(),
            name,
            kind: DeviceKind::Gpu,
            platform_name: "NVIDIA CUDA".to_string(),
            platform_index: 0,
            device_index: ordinal,
            max_alloc_size: total_mem as u64,
            global_mem_size: total_mem as u64,
            max_work_group_size: max_threads.max(1) as u64,
            capability_version: 120,
            little_endian: true,
        };

        tracing::info!("Initialized CUDA device {} ({})", ordinal, info.name);

        Ok(Self {
            device,
            stream,
            info,
            epoch,
            state: Mutex::new(CudaState {
                modules: HashMap::new(),
                events: HashMap::new(),
                next_handle: 0,
            }),
        })
    }

    fn bind(&self, call: &'static str) -> Result<(), DriverError> {
        self.device
            .bind_to_thread()
            .map_err(|e| cuda_error(call, e))
    }

    fn wait_on(&self, call: &'static str, state: &CudaState, waits: &[NativeEvent]) -> Result<(), DriverError> {
        for wait in waits {
            let Some(events) = state.events.get(&wait.raw()) else {
                return Err(DriverError::new(
                    call,
                    sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                    format!("unknown event {:#x}", wait),
                ));
            };
            unsafe {
                stream::wait_event(
                    self.stream.stream,
                    events.end,
                    sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
                )
                .map_err(|e| cuda_error(call, e))?;
            }
        }
        Ok(())
    }

    /// Records a start event, runs `submit` on the stream and records the end
    /// event, returning the handle of the pair.
    fn bracket<F>(
        &self,
        call: &'static str,
        waits: &[NativeEvent],
        synchronous: bool,
        submit: F,
    ) -> Result<NativeEvent, DriverError>
    where
        F: FnOnce(sys::CUstream) -> Result<(), cudarc::driver::DriverError>,
    {
        self.bind(call)?;
        let mut state = self.state.lock();
        self.wait_on(call, &state, waits)?;

        let flags = sys::CUevent_flags_enum::CU_EVENT_DEFAULT;
        let start = event::create(flags).map_err(|e| cuda_error(call, e))?;
        let end = match event::create(flags) {
            Ok(end) => end,
            Err(e) => {
                unsafe { event::destroy(start).ok() };
                return Err(cuda_error(call, e));
            }
        };

        let submitted = unsafe {
            event::record(start, self.stream.stream)
                .and_then(|_| submit(self.stream.stream))
                .and_then(|_| event::record(end, self.stream.stream))
                .and_then(|_| {
                    if synchronous {
                        stream::synchronize(self.stream.stream)
                    } else {
                        Ok(())
                    }
                })
        };
        if let Err(e) = submitted {
            unsafe {
                event::destroy(start).ok();
                event::destroy(end).ok();
            }
            return Err(cuda_error(call, e));
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        state.events.insert(handle, CommandEvents { start, end });
        Ok(NativeEvent(handle))
    }

    fn elapsed_ns(&self, from: sys::CUevent, to: sys::CUevent) -> Result<u64, cudarc::driver::DriverError> {
        let ms = unsafe { event::elapsed(from, to)? };
        Ok((ms as f64 * 1_000_000.0) as u64)
    }
}

/// Grid and block shape for `geometry`.
fn launch_dims(geometry: &LaunchGeometry) -> ((u32, u32, u32), (u32, u32, u32)) {
    let local = geometry.local_work.unwrap_or_else(|| {
        let mut local = [1u64; 3];
        for d in 0..geometry.dims as usize {
            let g = geometry.global_work[d];
            let mut block = DEFAULT_BLOCK.min(g);
            while block > 1 && g % block != 0 {
                block -= 1;
            }
            local[d] = block.max(1);
        }
        local
    });
    let grid = [0, 1, 2].map(|d| (geometry.global_work[d] / local[d]).max(1) as u32);
    (
        (grid[0], grid[1], grid[2]),
        (local[0] as u32, local[1] as u32, local[2] as u32),
    )
}

impl Driver for CudaDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate_region(&self, bytes: u64) -> Result<NativeBuffer, DriverError> {
        self.bind("allocate_region")?;
        let ptr = unsafe { result::malloc_sync(bytes as usize) }
            .map_err(|e| cuda_error("allocate_region", e))?;
        Ok(NativeBuffer(ptr))
    }

    fn release_region(&self, buffer: NativeBuffer) -> Result<(), DriverError> {
        self.bind("release_region")?;
        unsafe { result::free_sync(buffer.raw()) }.map_err(|e| cuda_error("release_region", e))
    }

    fn load_kernel(
        &self,
        entry_point: &str,
        code: &KernelCode,
    ) -> Result<NativeKernel, DriverError> {
        self.bind("load_kernel")?;

        let image = match code {
            KernelCode::Source(src) => {
                let ptx = cudarc::nvrtc::compile_ptx(src.as_str()).map_err(|e| {
                    DriverError::new("load_kernel", -1, format!("NVRTC compilation failed: {:?}", e))
                })?;
                ptx.to_src().into_bytes()
            }
            KernelCode::Binary(bin) => bin.clone(),
        };
        let image = CString::new(image).map_err(|_| {
            DriverError::new("load_kernel", -1, "kernel image contains interior NUL bytes")
        })?;
        let name = CString::new(entry_point).map_err(|_| {
            DriverError::new("load_kernel", -1, "entry point contains NUL bytes")
        })?;

        let module = unsafe { result::module::load_data(image.as_ptr() as *const c_void) }
            .map_err(|e| cuda_error("load_kernel", e))?;
        let function = match unsafe { result::module::get_function(module, name) } {
            Ok(f) => f,
            Err(e) => {
                unsafe { result::module::unload(module).ok() };
                return Err(cuda_error("load_kernel", e));
            }
        };

        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.modules.insert(handle, LoadedModule { module, function });
        Ok(NativeKernel(handle))
    }

    fn unload_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError> {
        self.bind("unload_kernel")?;
        let loaded = self.state.lock().modules.remove(&kernel.raw()).ok_or_else(|| {
            DriverError::new(
                "unload_kernel",
                sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                format!("unknown kernel {:#x}", kernel),
            )
        })?;
        unsafe { result::module::unload(loaded.module) }.map_err(|e| cuda_error("unload_kernel", e))
    }

    fn bootstrap_kernel(&self) -> KernelCode {
        KernelCode::Source(LOOKUP_BUFFER_ADDRESS_SOURCE.to_string())
    }

    fn enqueue_write(
        &self,
        buffer: NativeBuffer,
        _blocking: bool,
        offset: u64,
        src: &[u8],
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        // The stream is synchronised so `src` is free when this returns.
        self.bracket("enqueue_write", waits, true, |s| unsafe {
            result::memcpy_htod_async(buffer.raw() + offset, src, s)
        })
    }

    fn enqueue_read(
        &self,
        buffer: NativeBuffer,
        _blocking: bool,
        offset: u64,
        dst: &mut [u8],
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        self.bracket("enqueue_read", waits, true, |s| unsafe {
            result::memcpy_dtoh_async(dst, buffer.raw() + offset, s)
        })
    }

    fn enqueue_kernel(
        &self,
        kernel: NativeKernel,
        geometry: &LaunchGeometry,
        args: &KernelArgs,
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        if geometry.global_offset.iter().any(|&o| o != 0) {
            return Err(DriverError::new(
                "enqueue_kernel",
                sys::cudaError_enum::CUDA_ERROR_INVALID_VALUE as i32,
                "global work offsets are not supported by the CUDA backend",
            ));
        }
        let function = self
            .state
            .lock()
            .modules
            .get(&kernel.raw())
            .map(|m| m.function)
            .ok_or_else(|| {
                DriverError::new(
                    "enqueue_kernel",
                    sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                    format!("unknown kernel {:#x}", kernel),
                )
            })?;

        let (grid, block) = launch_dims(geometry);
        let mut heap = args.heap.raw();
        let mut frame = args.frame_offset;

        self.bracket("enqueue_kernel", waits, false, |s| unsafe {
            let mut params = [
                &mut heap as *mut u64 as *mut c_void,
                &mut frame as *mut u64 as *mut c_void,
            ];
            result::launch_kernel(function, grid, block, 0, s, &mut params)
        })
    }

    fn enqueue_barrier(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError> {
        self.bracket("enqueue_barrier", waits, false, |_| Ok(()))
    }

    fn enqueue_marker(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError> {
        self.bracket("enqueue_marker", waits, false, |_| Ok(()))
    }

    fn flush(&self) -> Result<(), DriverError> {
        // Work is submitted to the stream immediately.
        Ok(())
    }

    fn finish(&self) -> Result<(), DriverError> {
        self.bind("finish")?;
        unsafe { stream::synchronize(self.stream.stream) }.map_err(|e| cuda_error("finish", e))
    }

    fn wait_events(&self, _events: &[NativeEvent]) -> Result<(), DriverError> {
        // Single in-order stream: draining it covers every event.
        self.bind("wait_events")?;
        unsafe { stream::synchronize(self.stream.stream) }
            .map_err(|e| cuda_error("wait_events", e))
    }

    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError> {
        self.bind("event_status")?;
        let state = self.state.lock();
        let pair = state.events.get(&event.raw()).ok_or_else(|| {
            DriverError::new(
                "event_status",
                sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                format!("unknown event {:#x}", event),
            )
        })?;
        // Elapsed time is only defined once both events have completed.
        match self.elapsed_ns(pair.start, pair.end) {
            Ok(_) => Ok(EventStatus::Complete),
            Err(e) if e.0 == sys::cudaError_enum::CUDA_ERROR_NOT_READY => Ok(EventStatus::Running),
            Err(e) => Ok(EventStatus::Error(e.0 as i32)),
        }
    }

    fn event_profile(&self, event: NativeEvent) -> Result<EventProfile, DriverError> {
        self.bind("event_profile")?;
        let state = self.state.lock();
        let pair = state.events.get(&event.raw()).ok_or_else(|| {
            DriverError::new(
                "event_profile",
                sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                format!("unknown event {:#x}", event),
            )
        })?;
        let started = self
            .elapsed_ns(self.epoch, pair.start)
            .map_err(|e| cuda_error("event_profile", e))?;
        let ended = self
            .elapsed_ns(self.epoch, pair.end)
            .map_err(|e| cuda_error("event_profile", e))?;
        Ok(EventProfile {
            queued: started,
            submitted: started,
            started,
            ended,
        })
    }

    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError> {
        self.bind("release_event")?;
        let pair = self.state.lock().events.remove(&event.raw()).ok_or_else(|| {
            DriverError::new(
                "release_event",
                sys::cudaError_enum::CUDA_ERROR_INVALID_HANDLE as i32,
                format!("unknown event {:#x}", event),
            )
        })?;
        unsafe {
            event::destroy(pair.start).map_err(|e| cuda_error("release_event", e))?;
            event::destroy(pair.end).map_err(|e| cuda_error("release_event", e))
        }
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        // Clean up CUDA events and modules still owned by the driver
        let state = self.state.get_mut();
        for (_, pair) in state.events.drain() {
            unsafe {
                event::destroy(pair.start).ok();
                event::destroy(pair.end).ok();
            }
        }
        for (_, loaded) in state.modules.drain() {
            unsafe {
                result::module::unload(loaded.module).ok();
            }
        }
        unsafe {
            event::destroy(self.epoch).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims_from_local_size() {
        let g = LaunchGeometry::new(&[], &[1024, 8], Some(&[256, 2])).unwrap();
        assert_eq!(launch_dims(&g), ((4, 4, 1), (256, 2, 1)));
    }

    #[test]
    fn test_launch_dims_default_block() {
        let g = LaunchGeometry::new(&[], &[1000], None).unwrap();
        assert_eq!(launch_dims(&g), ((5, 1, 1), (200, 1, 1)));
        assert_eq!(launch_dims(&LaunchGeometry::serial()), ((1, 1, 1), (1, 1, 1)));
    }
}
