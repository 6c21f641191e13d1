//! # Host Emulated Device
//!
//! `HostDriver` implements [`Driver`] entirely in process memory. Regions are
//! plain byte vectors placed in a simulated device address space starting at
//! address 0, kernels are Rust closures registered by entry point, and every
//! command executes synchronously at enqueue time while still producing a
//! native event with monotonically increasing device timestamps.
//!
//! It backs the unit and integration tests and is the default backend of the
//! `probe` binary, so the runtime can be exercised without an accelerator.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::driver::{
    DeviceInfo, DeviceKind, Driver, DriverError, EventProfile, EventStatus, KernelArgs,
    KernelCode, LaunchGeometry, NativeBuffer, NativeEvent, NativeKernel,
};

/// Entry point of the built-in heap address lookup kernel.
pub const LOOKUP_BUFFER_ADDRESS: &str = "lookup_buffer_address";

// Error codes mirror the OpenCL values so logs read familiar.
const ERR_OUT_OF_RESOURCES: i32 = -5;
const ERR_ALLOCATION_FAILURE: i32 = -4;
const ERR_BUILD_FAILURE: i32 = -11;
const ERR_INVALID_VALUE: i32 = -30;
const ERR_INVALID_MEM_OBJECT: i32 = -38;
const ERR_INVALID_KERNEL_NAME: i32 = -46;
const ERR_INVALID_KERNEL: i32 = -48;
const ERR_INVALID_EVENT_WAIT_LIST: i32 = -57;
const ERR_INVALID_EVENT: i32 = -58;
const ERR_INVALID_BUFFER_SIZE: i32 = -61;
const ERR_INJECTED: i32 = -9999;

/// Placement granularity of regions in the simulated address space.
const REGION_ALIGNMENT: u64 = 256;

/// Describes the device a [`HostDriver`] pretends to be.
#[derive(Clone, Debug)]
pub struct HostDeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub platform_name: String,
    pub platform_index: usize,
    pub device_index: usize,
    pub max_alloc_size: u64,
    pub global_mem_size: u64,
    pub max_work_group_size: u64,
    pub capability_version: u32,
    /// Artificial latency of `load_kernel`, used to widen install races.
    pub load_delay: Duration,
}

impl Default for HostDeviceSpec {
    fn default() -> Self {
        Self {
            name: "Host Emulated Device".to_string(),
            kind: DeviceKind::Cpu,
            platform_name: "Host Platform".to_string(),
            platform_index: 0,
            device_index: 0,
            max_alloc_size: 256 << 20,
            global_mem_size: 1 << 30,
            max_work_group_size: 1024,
            capability_version: 120,
            load_delay: Duration::ZERO,
        }
    }
}

impl HostDeviceSpec {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_platform(mut self, platform_name: impl Into<String>) -> Self {
        self.platform_name = platform_name.into();
        self
    }

    pub fn with_indices(mut self, platform_index: usize, device_index: usize) -> Self {
        self.platform_index = platform_index;
        self.device_index = device_index;
        self
    }

    pub fn with_max_alloc_size(mut self, bytes: u64) -> Self {
        self.max_alloc_size = bytes;
        self
    }

    pub fn with_global_mem_size(mut self, bytes: u64) -> Self {
        self.global_mem_size = bytes;
        self
    }

    pub fn with_max_work_group_size(mut self, size: u64) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn with_capability_version(mut self, version: u32) -> Self {
        self.capability_version = version;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    fn into_info(self) -> (DeviceInfo, Duration) {
        let info = DeviceInfo {
            backend: "host".to_string(),
            name: self.name,
            kind: self.kind,
            platform_name: self.platform_name,
            platform_index: self.platform_index,
            device_index: self.device_index,
            max_alloc_size: self.max_alloc_size,
            global_mem_size: self.global_mem_size,
            max_work_group_size: self.max_work_group_size,
            capability_version: self.capability_version,
            little_endian: cfg!(target_endian = "little"),
        };
        (info, self.load_delay)
    }
}

/// A memory access made by a host kernel fell outside the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFault(pub String);

impl fmt::Display for HostFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of a host kernel.
pub type HostKernelFn =
    Arc<dyn Fn(&mut HostInvocation<'_>) -> Result<(), HostFault> + Send + Sync>;

/// What a host kernel sees while it runs: the heap bytes and its call frame.
pub struct HostInvocation<'a> {
    heap: &'a mut [u8],
    heap_address: u64,
    frame_offset: u64,
    geometry: LaunchGeometry,
    relative_addresses: bool,
}

impl<'a> HostInvocation<'a> {
    /// Absolute device address of the heap region.
    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    pub fn frame_offset(&self) -> u64 {
        self.frame_offset
    }

    pub fn geometry(&self) -> &LaunchGeometry {
        &self.geometry
    }

    pub fn relative_addresses(&self) -> bool {
        self.relative_addresses
    }

    /// Turns a pointer found in the frame into a heap offset.
    pub fn resolve(&self, address: u64) -> Result<u64, HostFault> {
        if self.relative_addresses {
            Ok(address)
        } else {
            address.checked_sub(self.heap_address).ok_or_else(|| {
                HostFault(format!(
                    "address {:#x} is below the heap base {:#x}",
                    address, self.heap_address
                ))
            })
        }
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, HostFault> {
        let start = usize::try_from(offset).map_err(|_| self.fault(offset, len))?;
        let end = start.checked_add(len).ok_or_else(|| self.fault(offset, len))?;
        if end > self.heap.len() {
            return Err(self.fault(offset, len));
        }
        Ok(start..end)
    }

    fn fault(&self, offset: u64, len: usize) -> HostFault {
        HostFault(format!(
            "access of {} bytes at heap offset {:#x} exceeds heap of {} bytes",
            len,
            offset,
            self.heap.len()
        ))
    }

    pub fn read<T: Pod>(&self, offset: u64) -> Result<T, HostFault> {
        let range = self.range(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.heap[range]))
    }

    pub fn write<T: Pod>(&mut self, offset: u64, value: T) -> Result<(), HostFault> {
        let range = self.range(offset, std::mem::size_of::<T>())?;
        self.heap[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Reads the `index`-th 8-byte slot of the call frame.
    pub fn frame_slot(&self, index: u64) -> Result<u64, HostFault> {
        self.read::<u64>(self.frame_offset + index * 8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Write,
    Read,
    Kernel,
    Barrier,
    Marker,
}

/// One entry of the submission log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub kind: CommandKind,
    pub waits: Vec<NativeEvent>,
    pub event: NativeEvent,
}

struct Region {
    address: u64,
    data: Vec<u8>,
}

struct LoadedKernel {
    entry_point: String,
    body: HostKernelFn,
}

struct HostEvent {
    status: EventStatus,
    profile: EventProfile,
}

struct HostState {
    regions: HashMap<u64, Region>,
    next_address: u64,
    allocated: u64,
    registered: HashMap<String, HostKernelFn>,
    kernels: HashMap<u64, LoadedKernel>,
    events: HashMap<u64, HostEvent>,
    next_handle: u64,
    clock: u64,
    clock_frozen: bool,
    log: Vec<Submission>,
    loads: u64,
    failing: HashSet<String>,
}

impl HostState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Device clock in nanoseconds; strictly increasing across calls unless
    /// frozen.
    fn tick(&mut self, epoch: Instant) -> u64 {
        if self.clock_frozen {
            return self.clock;
        }
        let now = epoch.elapsed().as_nanos() as u64;
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn check(&self, call: &'static str) -> Result<(), DriverError> {
        if self.failing.contains(call) {
            return Err(DriverError::new(call, ERR_INJECTED, "injected failure"));
        }
        Ok(())
    }

    fn check_waits(&self, call: &'static str, waits: &[NativeEvent]) -> Result<(), DriverError> {
        match waits.iter().find(|e| !self.events.contains_key(&e.raw())) {
            Some(e) => Err(DriverError::new(
                call,
                ERR_INVALID_EVENT_WAIT_LIST,
                format!("wait list references unknown event {:#x}", e),
            )),
            None => Ok(()),
        }
    }

    fn region_range(
        &self,
        call: &'static str,
        buffer: NativeBuffer,
        offset: u64,
        len: usize,
    ) -> Result<std::ops::Range<usize>, DriverError> {
        let region = self.regions.get(&buffer.raw()).ok_or_else(|| {
            DriverError::new(call, ERR_INVALID_MEM_OBJECT, format!("unknown buffer {:#x}", buffer))
        })?;
        let start = offset as usize;
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if offset > region.data.len() as u64 || end > region.data.len() {
            return Err(DriverError::new(
                call,
                ERR_INVALID_VALUE,
                format!(
                    "range [{:#x}, {:#x}) outside buffer of {} bytes",
                    offset,
                    offset + len as u64,
                    region.data.len()
                ),
            ));
        }
        Ok(start..end)
    }

    /// Records a finished command and returns its native event.
    fn complete(
        &mut self,
        kind: CommandKind,
        waits: &[NativeEvent],
        queued: u64,
        ended: u64,
        status: EventStatus,
    ) -> NativeEvent {
        let handle = self.next_handle();
        let event = NativeEvent(handle);
        self.events.insert(
            handle,
            HostEvent {
                status,
                profile: EventProfile {
                    queued,
                    submitted: queued,
                    started: queued,
                    ended,
                },
            },
        );
        self.log.push(Submission {
            kind,
            waits: waits.to_vec(),
            event,
        });
        event
    }
}

/// In-process emulated device.
pub struct HostDriver {
    info: DeviceInfo,
    load_delay: Duration,
    epoch: Instant,
    state: Mutex<HostState>,
}

impl HostDriver {
    pub fn new(spec: HostDeviceSpec) -> Self {
        let (info, load_delay) = spec.into_info();
        let mut registered: HashMap<String, HostKernelFn> = HashMap::new();
        registered.insert(LOOKUP_BUFFER_ADDRESS.to_string(), Arc::new(lookup_buffer_address));

        Self {
            info,
            load_delay,
            epoch: Instant::now(),
            state: Mutex::new(HostState {
                regions: HashMap::new(),
                next_address: 0,
                allocated: 0,
                registered,
                kernels: HashMap::new(),
                events: HashMap::new(),
                next_handle: 0,
                clock: 0,
                clock_frozen: false,
                log: Vec::new(),
                loads: 0,
                failing: HashSet::new(),
            }),
        }
    }

    /// Makes `body` loadable under `entry_point`.
    pub fn register_kernel<F>(&self, entry_point: &str, body: F)
    where
        F: Fn(&mut HostInvocation<'_>) -> Result<(), HostFault> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .registered
            .insert(entry_point.to_string(), Arc::new(body));
    }

    /// Makes every subsequent call named `call` fail.
    pub fn fail_call(&self, call: &str) {
        self.state.lock().failing.insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Stops the device clock, so every later command gets the same
    /// timestamps.
    pub fn freeze_clock(&self) {
        self.state.lock().clock_frozen = true;
    }

    /// Commands submitted so far, oldest first.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().log.clone()
    }

    /// Number of successful `load_kernel` calls.
    pub fn kernel_loads(&self) -> u64 {
        self.state.lock().loads
    }

    pub fn loaded_kernels(&self) -> usize {
        self.state.lock().kernels.len()
    }

    /// Native events not yet released.
    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn is_event_live(&self, event: NativeEvent) -> bool {
        self.state.lock().events.contains_key(&event.raw())
    }

    /// Simulated device address of `buffer`.
    pub fn region_address(&self, buffer: NativeBuffer) -> Option<u64> {
        self.state.lock().regions.get(&buffer.raw()).map(|r| r.address)
    }
}

fn lookup_buffer_address(inv: &mut HostInvocation<'_>) -> Result<(), HostFault> {
    let address = inv.heap_address();
    let frame = inv.frame_offset();
    inv.write::<u64>(frame, address)
}

const LOOKUP_BUFFER_ADDRESS_SOURCE: &str = "\
__kernel void lookup_buffer_address(__global uchar *heap, ulong frame)
{
    __global ulong *slots = (__global ulong *) &heap[frame];
    slots[0] = (ulong) heap;
}
";

impl Driver for HostDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate_region(&self, bytes: u64) -> Result<NativeBuffer, DriverError> {
        let mut state = self.state.lock();
        state.check("allocate_region")?;

        if bytes == 0 || bytes > self.info.max_alloc_size {
            return Err(DriverError::new(
                "allocate_region",
                ERR_INVALID_BUFFER_SIZE,
                format!(
                    "requested {} bytes, device max allocation is {}",
                    bytes, self.info.max_alloc_size
                ),
            ));
        }
        if state.allocated + bytes > self.info.global_mem_size {
            return Err(DriverError::new(
                "allocate_region",
                ERR_ALLOCATION_FAILURE,
                format!(
                    "requested {} bytes with {} of {} bytes in use",
                    bytes, state.allocated, self.info.global_mem_size
                ),
            ));
        }
        let len = usize::try_from(bytes).map_err(|_| {
            DriverError::new("allocate_region", ERR_OUT_OF_RESOURCES, "size exceeds host address space")
        })?;

        let address = state.next_address;
        let span = bytes.div_ceil(REGION_ALIGNMENT) * REGION_ALIGNMENT;
        state.next_address = address + span;
        state.allocated += bytes;

        let handle = state.next_handle();
        state.regions.insert(
            handle,
            Region {
                address,
                data: vec![0u8; len],
            },
        );
        Ok(NativeBuffer(handle))
    }

    fn release_region(&self, buffer: NativeBuffer) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.check("release_region")?;
        match state.regions.remove(&buffer.raw()) {
            Some(region) => {
                state.allocated -= region.data.len() as u64;
                Ok(())
            }
            None => Err(DriverError::new(
                "release_region",
                ERR_INVALID_MEM_OBJECT,
                format!("unknown buffer {:#x}", buffer),
            )),
        }
    }

    fn load_kernel(
        &self,
        entry_point: &str,
        code: &KernelCode,
    ) -> Result<NativeKernel, DriverError> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }

        let mut state = self.state.lock();
        state.check("load_kernel")?;
        if code.is_empty() {
            return Err(DriverError::new(
                "load_kernel",
                ERR_BUILD_FAILURE,
                format!("empty program for {}", entry_point),
            ));
        }
        let body = state.registered.get(entry_point).cloned().ok_or_else(|| {
            DriverError::new(
                "load_kernel",
                ERR_INVALID_KERNEL_NAME,
                format!("no kernel named {} in program", entry_point),
            )
        })?;

        let handle = state.next_handle();
        state.kernels.insert(
            handle,
            LoadedKernel {
                entry_point: entry_point.to_string(),
                body,
            },
        );
        state.loads += 1;
        Ok(NativeKernel(handle))
    }

    fn unload_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.check("unload_kernel")?;
        state.kernels.remove(&kernel.raw()).map(|_| ()).ok_or_else(|| {
            DriverError::new(
                "unload_kernel",
                ERR_INVALID_KERNEL,
                format!("unknown kernel {:#x}", kernel),
            )
        })
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
        let mut state = self.state.lock();
        state.check("enqueue_write")?;
        state.check_waits("enqueue_write", waits)?;
        let range = state.region_range("enqueue_write", buffer, offset, src.len())?;

        let queued = state.tick(self.epoch);
        if let Some(region) = state.regions.get_mut(&buffer.raw()) {
            region.data[range].copy_from_slice(src);
        }
        let ended = state.tick(self.epoch);
        Ok(state.complete(CommandKind::Write, waits, queued, ended, EventStatus::Complete))
    }

    fn enqueue_read(
        &self,
        buffer: NativeBuffer,
        _blocking: bool,
        offset: u64,
        dst: &mut [u8],
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let mut state = self.state.lock();
        state.check("enqueue_read")?;
        state.check_waits("enqueue_read", waits)?;
        let range = state.region_range("enqueue_read", buffer, offset, dst.len())?;

        let queued = state.tick(self.epoch);
        if let Some(region) = state.regions.get(&buffer.raw()) {
            dst.copy_from_slice(&region.data[range]);
        }
        let ended = state.tick(self.epoch);
        Ok(state.complete(CommandKind::Read, waits, queued, ended, EventStatus::Complete))
    }

    fn enqueue_kernel(
        &self,
        kernel: NativeKernel,
        geometry: &LaunchGeometry,
        args: &KernelArgs,
        waits: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let mut state = self.state.lock();
        state.check("enqueue_kernel")?;
        state.check_waits("enqueue_kernel", waits)?;

        let (entry_point, body) = match state.kernels.get(&kernel.raw()) {
            Some(k) => (k.entry_point.clone(), k.body.clone()),
            None => {
                return Err(DriverError::new(
                    "enqueue_kernel",
                    ERR_INVALID_KERNEL,
                    format!("unknown kernel {:#x}", kernel),
                ))
            }
        };

        let queued = state.tick(self.epoch);
        let region = state.regions.get_mut(&args.heap.raw()).ok_or_else(|| {
            DriverError::new(
                "enqueue_kernel",
                ERR_INVALID_MEM_OBJECT,
                format!("unknown heap buffer {:#x}", args.heap),
            )
        })?;
        let mut invocation = HostInvocation {
            heap_address: region.address,
            heap: &mut region.data,
            frame_offset: args.frame_offset,
            geometry: *geometry,
            relative_addresses: args.relative_addresses,
        };
        let status = match body(&mut invocation) {
            Ok(()) => EventStatus::Complete,
            Err(fault) => {
                tracing::warn!("host kernel {} faulted: {}", entry_point, fault);
                EventStatus::Error(ERR_OUT_OF_RESOURCES)
            }
        };
        let ended = state.tick(self.epoch);
        Ok(state.complete(CommandKind::Kernel, waits, queued, ended, status))
    }

    fn enqueue_barrier(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError> {
        let mut state = self.state.lock();
        state.check("enqueue_barrier")?;
        state.check_waits("enqueue_barrier", waits)?;
        let queued = state.tick(self.epoch);
        Ok(state.complete(CommandKind::Barrier, waits, queued, queued, EventStatus::Complete))
    }

    fn enqueue_marker(&self, waits: &[NativeEvent]) -> Result<NativeEvent, DriverError> {
        let mut state = self.state.lock();
        state.check("enqueue_marker")?;
        state.check_waits("enqueue_marker", waits)?;
        let queued = state.tick(self.epoch);
        Ok(state.complete(CommandKind::Marker, waits, queued, queued, EventStatus::Complete))
    }

    fn flush(&self) -> Result<(), DriverError> {
        self.state.lock().check("flush")
    }

    fn finish(&self) -> Result<(), DriverError> {
        self.state.lock().check("finish")
    }

    fn wait_events(&self, events: &[NativeEvent]) -> Result<(), DriverError> {
        let state = self.state.lock();
        state.check("wait_events")?;
        state.check_waits("wait_events", events)?;
        let failed = events
            .iter()
            .filter_map(|e| state.events.get(&e.raw()))
            .any(|e| matches!(e.status, EventStatus::Error(_)));
        if failed {
            return Err(DriverError::new(
                "wait_events",
                -14,
                "execution status error for events in wait list",
            ));
        }
        Ok(())
    }

    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError> {
        let state = self.state.lock();
        state.check("event_status")?;
        state.events.get(&event.raw()).map(|e| e.status).ok_or_else(|| {
            DriverError::new("event_status", ERR_INVALID_EVENT, format!("unknown event {:#x}", event))
        })
    }

    fn event_profile(&self, event: NativeEvent) -> Result<EventProfile, DriverError> {
        let state = self.state.lock();
        state.check("event_profile")?;
        state.events.get(&event.raw()).map(|e| e.profile).ok_or_else(|| {
            DriverError::new("event_profile", ERR_INVALID_EVENT, format!("unknown event {:#x}", event))
        })
    }

    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.check("release_event")?;
        state.events.remove(&event.raw()).map(|_| ()).ok_or_else(|| {
            DriverError::new("release_event", ERR_INVALID_EVENT, format!("unknown event {:#x}", event))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(heap: NativeBuffer, frame_offset: u64) -> KernelArgs {
        KernelArgs {
            heap,
            frame_offset,
            bump: None,
            relative_addresses: false,
        }
    }

    #[test]
    fn test_first_region_sits_at_address_zero() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        let a = driver.allocate_region(100).unwrap();
        let b = driver.allocate_region(64).unwrap();
        assert_eq!(driver.region_address(a), Some(0));
        assert_eq!(driver.region_address(b), Some(REGION_ALIGNMENT));
    }

    #[test]
    fn test_allocation_limits() {
        let driver = HostDriver::new(
            HostDeviceSpec::default()
                .with_max_alloc_size(1024)
                .with_global_mem_size(1536),
        );
        assert!(driver.allocate_region(2048).is_err());
        let a = driver.allocate_region(1024).unwrap();
        assert_eq!(
            driver.allocate_region(1024).unwrap_err().code,
            ERR_ALLOCATION_FAILURE
        );
        driver.release_region(a).unwrap();
        assert!(driver.allocate_region(1024).is_ok());
    }

    #[test]
    fn test_write_then_read_back() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        let heap = driver.allocate_region(64).unwrap();
        let w = driver.enqueue_write(heap, false, 8, &[1, 2, 3], &[]).unwrap();
        let mut out = [0u8; 3];
        let r = driver.enqueue_read(heap, true, 8, &mut out, &[w]).unwrap();
        assert_eq!(out, [1, 2, 3]);

        let pw = driver.event_profile(w).unwrap();
        let pr = driver.event_profile(r).unwrap();
        assert!(pw.ended < pr.started);
        assert_eq!(driver.submissions()[1].waits, vec![w]);
    }

    #[test]
    fn test_lookup_kernel_reports_heap_address() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        let _bump = driver.allocate_region(0x1000).unwrap();
        let heap = driver.allocate_region(64).unwrap();
        let code = driver.bootstrap_kernel();
        let kernel = driver.load_kernel(LOOKUP_BUFFER_ADDRESS, &code).unwrap();
        driver
            .enqueue_kernel(kernel, &LaunchGeometry::serial(), &args(heap, 0), &[])
            .unwrap();

        let mut out = [0u8; 8];
        driver.enqueue_read(heap, true, 0, &mut out, &[]).unwrap();
        assert_eq!(u64::from_le_bytes(out), 0x1000);
    }

    #[test]
    fn test_unknown_entry_point_fails_to_load() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        let err = driver
            .load_kernel("missing", &KernelCode::Source("x".into()))
            .unwrap_err();
        assert_eq!(err.code, ERR_INVALID_KERNEL_NAME);
        let err = driver
            .load_kernel(LOOKUP_BUFFER_ADDRESS, &KernelCode::Binary(Vec::new()))
            .unwrap_err();
        assert_eq!(err.code, ERR_BUILD_FAILURE);
    }

    #[test]
    fn test_faulting_kernel_marks_event_failed() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        driver.register_kernel("oob", |inv| inv.write::<u64>(1 << 20, 1));
        let heap = driver.allocate_region(64).unwrap();
        let kernel = driver
            .load_kernel("oob", &KernelCode::Source("oob".into()))
            .unwrap();
        let event = driver
            .enqueue_kernel(kernel, &LaunchGeometry::serial(), &args(heap, 0), &[])
            .unwrap();
        assert!(matches!(driver.event_status(event), Ok(EventStatus::Error(_))));
        assert!(driver.wait_events(&[event]).is_err());
    }

    #[test]
    fn test_released_event_cannot_be_waited_on() {
        let driver = HostDriver::new(HostDeviceSpec::default());
        let marker = driver.enqueue_marker(&[]).unwrap();
        driver.release_event(marker).unwrap();
        assert!(driver.enqueue_barrier(&[marker]).is_err());
        assert_eq!(driver.live_events(), 0);
    }
}
