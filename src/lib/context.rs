//! # Device Context
//!
//! The per-device entry point. A `DeviceContext` owns the heap, the event
//! table and the command queue of one device and shares its kernel cache;
//! callers allocate, transfer, launch and synchronise through it.
//!
//! ## Lifecycle
//!
//! 1. [`DeviceContext::new`] detects device quirks and reserves the bump
//!    buffer when the device needs one.
//! 2. [`DeviceContext::init`] reserves the heap, runs the bootstrap kernel to
//!    learn the heap's device address and arms the memory manager.
//! 3. Work is submitted; every enqueue returns an [`EventId`].
//! 4. [`DeviceContext::teardown`] (or `Drop`) drains the queue and returns
//!    every device resource.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use crate::cache::{InstalledKernel, KernelCache};
use crate::config::RuntimeConfig;
use crate::device::{CapabilityTable, DeviceCapabilities};
use crate::driver::{
    DeviceInfo, Driver, EventStatus, KernelArgs, KernelCode, LaunchGeometry, NativeBuffer,
    NativeEvent,
};
use crate::error::{Result, RuntimeError};
use crate::events::{
    Event, EventDescription, EventId, EventSnapshot, EventTable, HostPrimitive, NO_EVENT,
};
use crate::memory::{MemoryManager, SubBuffer};
use crate::metadata::TaskMetaData;
use crate::queue::CommandQueue;
use crate::util::human_readable_bytes;

/// Task id under which the bootstrap kernel is cached.
pub const BOOTSTRAP_TASK_ID: &str = "internal";
/// Entry point of the bootstrap kernel.
pub const BOOTSTRAP_ENTRY_POINT: &str = "lookup_buffer_address";
/// Queues below this capability level have no barrier or marker support.
pub const MIN_SYNC_CAPABILITY: u32 = 120;
/// Heap bytes the bootstrap kernel uses as its frame.
const BOOTSTRAP_SCRATCH_BYTES: usize = 16;

const DUMP_HEADER: &str = "event: device,type,info,queued,submitted,start,end,status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialised,
    Initialised,
    TornDown,
}

/// Picks the native wait list for `ids`, empty when none of them is live.
fn wait_list<'a>(events: &'a mut EventTable, ids: &[EventId]) -> &'a [NativeEvent] {
    if events.serialise_events(ids) {
        events.wait_events()
    } else {
        &[]
    }
}

pub struct DeviceContext {
    info: DeviceInfo,
    queue: CommandQueue,
    memory: MemoryManager,
    code_cache: Arc<KernelCache>,
    events: EventTable,
    capabilities: DeviceCapabilities,
    bump_buffer: Option<NativeBuffer>,
    config: RuntimeConfig,
    state: ContextState,
    was_reset: bool,
}

impl DeviceContext {
    /// Wraps an opened device. Device quirks are decided here, once.
    pub fn new(driver: Arc<dyn Driver>, config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let queue = CommandQueue::new(driver);
        let info = queue.device_info().clone();
        let table = CapabilityTable::from_config(config);
        let capabilities = DeviceCapabilities::detect(&info, &table, config);

        if capabilities.relative_addresses_forced(config) {
            tracing::warn!(
                "{} on platform {} is an FPGA: switching to relative addressing",
                info.name,
                info.platform_name
            );
        }

        let bump_buffer = if capabilities.needs_bump {
            let buffer = queue
                .allocate_region(config.bump_buffer_size)
                .map_err(|source| RuntimeError::RegionAllocation {
                    device: info.name.clone(),
                    requested: config.bump_buffer_size,
                    source,
                })?;
            tracing::info!(
                "device {} needs a bump buffer: allocated {}",
                info.name,
                human_readable_bytes(config.bump_buffer_size)
            );
            Some(buffer)
        } else {
            None
        };

        Ok(Self {
            code_cache: Arc::new(KernelCache::new(queue.clone(), config.print_kernel_source)),
            events: EventTable::new(config.event_window),
            memory: MemoryManager::new(),
            info,
            queue,
            capabilities,
            bump_buffer,
            config: config.clone(),
            state: ContextState::Uninitialised,
            was_reset: false,
        })
    }

    /// Reserves the heap and reads back its device address.
    ///
    /// A failed bootstrap leaves the context uninitialised; calling `init`
    /// again reuses the reserved heap and any cached bootstrap kernel.
    pub fn init(&mut self) -> Result<()> {
        if self.state != ContextState::Uninitialised {
            return Err(RuntimeError::InvalidState {
                expected: ContextState::Uninitialised,
                found: self.state,
            });
        }

        if self.memory.heap_buffer().is_none() {
            let requested = self.config.heap_size;
            let max_alloc = self.info.max_alloc_size;
            if requested > max_alloc {
                tracing::info!(
                    "Unable to allocate {} of heap space - resized to {}",
                    human_readable_bytes(requested),
                    human_readable_bytes(max_alloc)
                );
            }
            let size = self.memory.allocate_region(&self.queue, requested)?;
            tracing::info!(
                "allocated {} of heap space on {}",
                human_readable_bytes(size),
                self.info.name
            );
        }

        let kernel = match self
            .code_cache
            .installed_code(BOOTSTRAP_TASK_ID, BOOTSTRAP_ENTRY_POINT)
        {
            Some(kernel) => kernel,
            None => {
                let meta = TaskMetaData::new(BOOTSTRAP_TASK_ID, BOOTSTRAP_ENTRY_POINT, 2)
                    .with_parallelization(false);
                let code = self.queue.bootstrap_kernel();
                self.code_cache.install_source(
                    &meta,
                    BOOTSTRAP_TASK_ID,
                    BOOTSTRAP_ENTRY_POINT,
                    &code,
                )?
            }
        };

        let address = self.read_heap_base_address(&kernel)?;
        self.memory
            .init(address, self.capabilities.use_relative_addresses);
        tracing::info!(
            "heap base address on {}: {:#x} (relative addressing: {})",
            self.info.name,
            address,
            self.capabilities.use_relative_addresses
        );

        self.state = ContextState::Initialised;
        Ok(())
    }

    /// Zeroes the scratch frame at heap offset 0, runs the bootstrap kernel on
    /// it and reads the 8-byte address it leaves there.
    fn read_heap_base_address(&self, kernel: &InstalledKernel) -> Result<u64> {
        let lookup_error = |reason: &str| RuntimeError::HeapLookup {
            device: self.info.name.clone(),
            reason: reason.to_string(),
        };

        let scratch = self.memory.sub_buffer(0, BOOTSTRAP_SCRATCH_BYTES as u64)?;
        let args = self.kernel_args(scratch.buffer, scratch.offset);

        let write = self.queue.enqueue_write(
            scratch.buffer,
            true,
            scratch.offset,
            &[0u8; BOOTSTRAP_SCRATCH_BYTES],
            &[],
        );
        if write.is_none() {
            return Err(lookup_error("scratch write failed"));
        }

        let launch =
            self.queue
                .enqueue_kernel(kernel.kernel, &LaunchGeometry::serial(), &args, &[write]);
        if launch.is_none() {
            self.queue.release_event(write);
            return Err(lookup_error("bootstrap launch failed"));
        }

        let mut bytes = [0u8; 8];
        let read = self
            .queue
            .enqueue_read(scratch.buffer, true, scratch.offset, &mut bytes, &[launch]);
        let status = self.queue.event_status(launch);
        for event in [write, launch, read] {
            self.queue.release_event(event);
        }

        if read.is_none() {
            return Err(lookup_error("address read-back failed"));
        }
        if let EventStatus::Error(code) = status {
            return Err(lookup_error(&format!("bootstrap kernel failed with {}", code)));
        }

        Ok(if self.info.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    fn kernel_args(&self, heap: NativeBuffer, frame_offset: u64) -> KernelArgs {
        KernelArgs {
            heap,
            frame_offset,
            bump: self.bump_buffer,
            relative_addresses: self.capabilities.use_relative_addresses,
        }
    }

    fn check_live(&self, operation: &str) -> bool {
        if self.state == ContextState::TornDown {
            tracing::error!("{}: {} on a torn down context", self.id(), operation);
            return false;
        }
        true
    }

    fn check_state(&self) -> Result<()> {
        if self.state == ContextState::TornDown {
            return Err(RuntimeError::InvalidState {
                expected: ContextState::Initialised,
                found: self.state,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transfers
    // ---------------------------------------------------------------------

    fn write_impl<T: HostPrimitive>(
        &mut self,
        blocking: bool,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &[T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        if !self.check_live("write") {
            return NO_EVENT;
        }
        let src: &[u8] = bytemuck::cast_slice(host);
        let Some(src) = host_range(src.len(), host_offset, bytes).map(|r| &src[r]) else {
            tracing::error!(
                "{}: write of {} bytes at host offset {} exceeds host buffer of {} bytes",
                self.id(),
                bytes,
                host_offset,
                src.len()
            );
            return NO_EVENT;
        };

        let native = {
            let waits = wait_list(&mut self.events, waits);
            self.queue.enqueue_write(buffer, blocking, offset, src, waits)
        };
        self.events.register_event(
            native,
            EventDescription::Write(T::KIND),
            offset,
            &self.queue,
        )
    }

    fn read_impl<T: HostPrimitive>(
        &mut self,
        blocking: bool,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &mut [T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        if !self.check_live("read") {
            return NO_EVENT;
        }
        let dst: &mut [u8] = bytemuck::cast_slice_mut(host);
        let host_len = dst.len();
        let Some(range) = host_range(host_len, host_offset, bytes) else {
            tracing::error!(
                "{}: read of {} bytes at host offset {} exceeds host buffer of {} bytes",
                self.id(),
                bytes,
                host_offset,
                host_len
            );
            return NO_EVENT;
        };

        let native = {
            let waits = wait_list(&mut self.events, waits);
            self.queue
                .enqueue_read(buffer, blocking, offset, &mut dst[range], waits)
        };
        self.events.register_event(
            native,
            EventDescription::Read(T::KIND),
            offset,
            &self.queue,
        )
    }

    /// Copies `bytes` bytes of `host`, starting at byte `host_offset`, to
    /// `offset` in `buffer`. Returns once the host data has been consumed.
    pub fn enqueue_write_buffer<T: HostPrimitive>(
        &mut self,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &[T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        self.write_impl(false, buffer, offset, bytes, host, host_offset, waits)
    }

    /// Blocking variant of [`enqueue_write_buffer`](Self::enqueue_write_buffer).
    pub fn write_buffer<T: HostPrimitive>(
        &mut self,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &[T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        self.write_impl(true, buffer, offset, bytes, host, host_offset, waits)
    }

    pub fn enqueue_read_buffer<T: HostPrimitive>(
        &mut self,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &mut [T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        self.read_impl(false, buffer, offset, bytes, host, host_offset, waits)
    }

    pub fn read_buffer<T: HostPrimitive>(
        &mut self,
        buffer: NativeBuffer,
        offset: u64,
        bytes: u64,
        host: &mut [T],
        host_offset: usize,
        waits: &[EventId],
    ) -> EventId {
        self.read_impl(true, buffer, offset, bytes, host, host_offset, waits)
    }

    // ---------------------------------------------------------------------
    // Kernel launches
    // ---------------------------------------------------------------------

    fn launch_impl(
        &mut self,
        kernel: &InstalledKernel,
        geometry: &LaunchGeometry,
        frame_offset: u64,
        waits: &[EventId],
        description: EventDescription,
    ) -> EventId {
        if !self.check_live("kernel launch") {
            return NO_EVENT;
        }
        let Some(heap) = self.memory.heap_buffer() else {
            tracing::error!("{}: kernel {} launched without a heap", self.id(), kernel.key);
            return NO_EVENT;
        };
        let args = self.kernel_args(heap, frame_offset);

        let native = {
            let waits = wait_list(&mut self.events, waits);
            self.queue.enqueue_kernel(kernel.kernel, geometry, &args, waits)
        };
        self.events
            .register_event(native, description, kernel.kernel.raw(), &self.queue)
    }

    /// Launches `kernel` over an n-dimensional range with its frame at heap
    /// offset `frame_offset`.
    pub fn enqueue_nd_range_kernel(
        &mut self,
        kernel: &InstalledKernel,
        geometry: &LaunchGeometry,
        frame_offset: u64,
        waits: &[EventId],
    ) -> EventId {
        self.launch_impl(
            kernel,
            geometry,
            frame_offset,
            waits,
            EventDescription::ParallelKernel,
        )
    }

    /// Launches `kernel` as a single work item.
    pub fn enqueue_task(
        &mut self,
        kernel: &InstalledKernel,
        frame_offset: u64,
        waits: &[EventId],
    ) -> EventId {
        self.launch_impl(
            kernel,
            &LaunchGeometry::serial(),
            frame_offset,
            waits,
            EventDescription::SerialKernel,
        )
    }

    /// Launches `kernel` the way `meta` describes: applies configured
    /// overrides, back-fills work sizes if the task still needs scheduling and
    /// picks an nd-range or serial launch.
    pub fn launch(
        &mut self,
        kernel: &InstalledKernel,
        meta: &mut TaskMetaData,
        frame_offset: u64,
        waits: &[EventId],
    ) -> EventId {
        if let Some(overrides) = self.config.overrides_for(meta.id()) {
            if let Err(reason) = meta.apply_overrides(overrides) {
                tracing::warn!("ignoring overrides for {}: {}", meta.id(), reason);
            }
        }
        if meta.should_schedule() {
            meta.resolve_work_sizes(self.info.max_work_group_size);
        }
        if meta.is_debug() {
            tracing::debug!("{}", meta.thread_dims_summary(&self.info));
        }

        let event = if meta.is_parallel() {
            match meta.launch_geometry() {
                Ok(geometry) => self.enqueue_nd_range_kernel(kernel, &geometry, frame_offset, waits),
                Err(reason) => {
                    tracing::error!("{}: cannot launch {}: {}", self.id(), kernel.key, reason);
                    NO_EVENT
                }
            }
        } else {
            self.enqueue_task(kernel, frame_offset, waits)
        };

        if event == NO_EVENT {
            return event;
        }
        if self.config.profiling || meta.profiling() {
            meta.add_profile(event);
            let events = &self.events;
            meta.retain_profiles(|id| events.record(id).is_some());
        }
        if self.config.print_kernel_time {
            let handle = self.resolve_event(event);
            handle.wait();
            tracing::info!(
                "kernel {} on {}: {} ns",
                kernel.key,
                self.info.name,
                handle.elapsed_ns()
            );
        }
        event
    }

    // ---------------------------------------------------------------------
    // Synchronisation
    // ---------------------------------------------------------------------

    fn sync_point(&mut self, waits: &[EventId], description: EventDescription) -> EventId {
        if !self.check_live("sync point") {
            return NO_EVENT;
        }
        if self.queue.capability_version() < MIN_SYNC_CAPABILITY {
            tracing::debug!(
                "{}: queue level {} has no {}",
                self.id(),
                self.queue.capability_version(),
                description
            );
            return NO_EVENT;
        }
        let native = {
            let waits = wait_list(&mut self.events, waits);
            match description {
                EventDescription::SyncMarker => self.queue.enqueue_marker(waits),
                _ => self.queue.enqueue_barrier(waits),
            }
        };
        self.events
            .register_event(native, description, 0, &self.queue)
    }

    /// Blocks later commands until `waits` (or everything, if empty) finish.
    pub fn enqueue_barrier(&mut self, waits: &[EventId]) -> EventId {
        self.sync_point(waits, EventDescription::SyncBarrier)
    }

    /// Completion signpost over `waits` (or all prior work, if empty).
    pub fn enqueue_marker(&mut self, waits: &[EventId]) -> EventId {
        self.sync_point(waits, EventDescription::SyncMarker)
    }

    /// Drains the queue.
    pub fn sync(&self) {
        if self.config.sync_flush {
            self.queue.flush();
        }
        self.queue.finish();
    }

    pub fn flush(&self) {
        self.queue.flush();
    }

    pub fn finish(&self) {
        self.queue.finish();
    }

    /// Resets events, then memory, then the code cache.
    pub fn reset(&mut self) {
        self.events.reset(&self.queue);
        self.memory.reset();
        self.code_cache.reset();
        self.was_reset = true;
    }

    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    pub fn clear_reset_flag(&mut self) {
        self.was_reset = false;
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn retain_event(&mut self, id: EventId) -> bool {
        self.events.retain_event(id)
    }

    pub fn release_event(&mut self, id: EventId) {
        self.events.release_event(id, &self.queue);
    }

    pub fn resolve_event(&self, id: EventId) -> Event {
        self.events.resolve(id, &self.queue)
    }

    pub fn event_table(&self) -> &EventTable {
        &self.events
    }

    /// Live events sorted by submit then start time.
    pub fn events(&self) -> Vec<EventSnapshot> {
        self.events.events(&self.queue)
    }

    /// Event dump lines, header first, timestamps relative to the earliest
    /// submit time. Empty when there are no events.
    pub fn event_timeline(&self) -> Vec<String> {
        let events = self.events();
        let Some(first) = events.first() else {
            return Vec::new();
        };
        let base = first.profile.submitted;
        let device = self.id();

        let mut lines = Vec::with_capacity(events.len() + 1);
        lines.push(DUMP_HEADER.to_string());
        for e in &events {
            lines.push(timeline_line(&device, e, base));
        }
        lines
    }

    pub fn dump_events<W: Write>(&self, mut out: W) -> io::Result<()> {
        let lines = self.event_timeline();
        writeln!(
            out,
            "Found {} events on device {}:",
            lines.len().saturating_sub(1),
            self.id()
        )?;
        for line in lines {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    /// Bump-allocates `bytes` from the heap, returning the heap offset.
    pub fn allocate(&mut self, bytes: u64) -> Result<u64> {
        self.check_state()?;
        self.memory.allocate(bytes)
    }

    pub fn allocate_buffer(&mut self, bytes: u64) -> Result<SubBuffer> {
        self.check_state()?;
        self.memory.allocate_buffer(bytes)
    }

    pub fn sub_buffer(&self, offset: u64, length: u64) -> Result<SubBuffer> {
        self.memory.sub_buffer(offset, length)
    }

    pub fn heap_buffer(&self) -> Option<NativeBuffer> {
        self.memory.heap_buffer()
    }

    pub fn to_kernel_address(&self, offset: u64) -> u64 {
        self.memory.to_kernel_address(offset)
    }

    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory
    }

    // ---------------------------------------------------------------------
    // Code cache
    // ---------------------------------------------------------------------

    pub fn install_code(
        &self,
        meta: &TaskMetaData,
        task_id: &str,
        entry_point: &str,
        code: &KernelCode,
    ) -> Result<Arc<InstalledKernel>> {
        self.check_state()?;
        self.code_cache
            .install_source(meta, task_id, entry_point, code)
    }

    pub fn is_cached(&self, task_id: &str, entry_point: &str) -> bool {
        self.code_cache.is_cached(task_id, entry_point)
    }

    pub fn installed_code(&self, task_id: &str, entry_point: &str) -> Option<Arc<InstalledKernel>> {
        self.code_cache.installed_code(task_id, entry_point)
    }

    /// Shared handle to the cache, for installing from other threads.
    pub fn code_cache(&self) -> Arc<KernelCache> {
        self.code_cache.clone()
    }

    // ---------------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------------

    /// `"<backend>-<platform index>-<device index>"`.
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.info.backend, self.info.platform_index, self.info.device_index
        )
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn needs_bump(&self) -> bool {
        self.capabilities.needs_bump
    }

    pub fn bump_buffer(&self) -> Option<NativeBuffer> {
        self.bump_buffer
    }

    pub fn is_platform_fpga(&self) -> bool {
        self.capabilities.is_fpga
    }

    pub fn uses_relative_addresses(&self) -> bool {
        self.capabilities.use_relative_addresses
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Drains the queue and returns every device resource. Later calls are
    /// no-ops.
    pub fn teardown(&mut self) {
        if self.state == ContextState::TornDown {
            return;
        }
        if self.config.dump_events {
            for line in self.event_timeline() {
                tracing::info!("{}", line);
            }
        }

        self.queue.finish();
        self.events.reset(&self.queue);
        self.code_cache.release_all();
        self.memory.release(&self.queue);
        if let Some(bump) = self.bump_buffer.take() {
            if let Err(e) = self.queue.release_region(bump) {
                tracing::error!("{}: failed to release bump buffer: {}", self.id(), e);
            }
        }

        self.state = ContextState::TornDown;
        tracing::debug!("{} torn down", self.id());
    }
}

/// One dump row. Offsets are signed so that an event queued before the
/// earliest submit shows up negative.
fn timeline_line(device: &str, e: &EventSnapshot, base: u64) -> String {
    let rel = |t: u64| i128::from(t) - i128::from(base);
    format!(
        "event: {},{},0x{:x},{},{},{},{},{}",
        device,
        e.name,
        e.native,
        rel(e.profile.queued),
        rel(e.profile.submitted),
        rel(e.profile.started),
        rel(e.profile.ended),
        e.status
    )
}

/// Byte range `[offset, offset + bytes)` of a host buffer of `len` bytes.
fn host_range(len: usize, offset: usize, bytes: u64) -> Option<std::ops::Range<usize>> {
    let bytes = usize::try_from(bytes).ok()?;
    let end = offset.checked_add(bytes)?;
    (end <= len).then_some(offset..end)
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.info.device_index, self.info.name)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id())
            .field("device", &self.info.name)
            .field("state", &self.state)
            .field("heap_used", &self.memory.used())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EventProfile;
    use crate::host::{HostDeviceSpec, HostDriver};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            heap_size: 4096,
            ..RuntimeConfig::default()
        }
    }

    fn context(spec: HostDeviceSpec) -> (Arc<HostDriver>, DeviceContext) {
        let driver = Arc::new(HostDriver::new(spec));
        let ctx = DeviceContext::new(driver.clone(), &config()).unwrap();
        (driver, ctx)
    }

    #[test]
    fn test_init_reads_heap_address() {
        let (_, mut ctx) = context(HostDeviceSpec::default());
        assert_eq!(ctx.state(), ContextState::Uninitialised);
        ctx.init().unwrap();
        assert_eq!(ctx.state(), ContextState::Initialised);
        assert!(ctx.memory_manager().is_initialised());
        assert_eq!(ctx.memory_manager().heap_base_address(), 0);
        assert_eq!(ctx.memory_manager().capacity(), 4096);
        assert_eq!(ctx.memory_manager().used(), 0);
        assert!(ctx.is_cached(BOOTSTRAP_TASK_ID, BOOTSTRAP_ENTRY_POINT));
    }

    #[test]
    fn test_double_init_is_rejected() {
        let (_, mut ctx) = context(HostDeviceSpec::default());
        ctx.init().unwrap();
        assert!(matches!(
            ctx.init(),
            Err(RuntimeError::InvalidState {
                expected: ContextState::Uninitialised,
                found: ContextState::Initialised
            })
        ));
    }

    #[test]
    fn test_heap_is_resized_to_max_alloc() {
        let (_, mut ctx) = context(HostDeviceSpec::default().with_max_alloc_size(1024));
        ctx.init().unwrap();
        assert_eq!(ctx.memory_manager().capacity(), 1024);
    }

    #[test]
    fn test_failed_bootstrap_can_be_retried() {
        let (driver, mut ctx) = context(HostDeviceSpec::default());
        driver.fail_call("enqueue_kernel");
        assert!(matches!(ctx.init(), Err(RuntimeError::HeapLookup { .. })));
        assert_eq!(ctx.state(), ContextState::Uninitialised);

        driver.clear_failures();
        ctx.init().unwrap();
        assert_eq!(driver.kernel_loads(), 1);
        assert_eq!(driver.live_regions(), 1);
    }

    #[test]
    fn test_identity() {
        let (_, ctx) = context(
            HostDeviceSpec::default()
                .with_name("Emu")
                .with_indices(1, 2),
        );
        assert_eq!(ctx.id(), "host-1-2");
        assert_eq!(ctx.to_string(), "[2] Emu");
    }

    #[test]
    fn test_sync_points_need_capability() {
        let (_, mut ctx) = context(HostDeviceSpec::default().with_capability_version(110));
        ctx.init().unwrap();
        assert_eq!(ctx.enqueue_barrier(&[]), NO_EVENT);
        assert_eq!(ctx.enqueue_marker(&[]), NO_EVENT);
    }

    #[test]
    fn test_host_range_checks() {
        assert_eq!(host_range(16, 4, 8), Some(4..12));
        assert_eq!(host_range(16, 12, 8), None);
        assert_eq!(host_range(16, usize::MAX, 1), None);
    }

    #[test]
    fn test_timeline_offsets_are_signed() {
        let snapshot = EventSnapshot {
            id: 4,
            native: NativeEvent(0x2a),
            name: "kernel - parallel".to_string(),
            description: EventDescription::ParallelKernel,
            tag: 0,
            profile: EventProfile {
                queued: 95,
                submitted: 100,
                started: 110,
                ended: 150,
            },
            status: EventStatus::Complete,
        };
        assert_eq!(
            timeline_line("dev", &snapshot, 100),
            "event: dev,kernel - parallel,0x2a,-5,0,10,50,COMPLETE"
        );
        assert_eq!(
            timeline_line("dev", &snapshot, u64::MAX),
            format!(
                "event: dev,kernel - parallel,0x2a,{},{},{},{},COMPLETE",
                95 - i128::from(u64::MAX),
                100 - i128::from(u64::MAX),
                110 - i128::from(u64::MAX),
                150 - i128::from(u64::MAX)
            )
        );
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (driver, mut ctx) = context(HostDeviceSpec::default());
        ctx.init().unwrap();
        let buf = ctx.allocate_buffer(64).unwrap();
        ctx.write_buffer(buf.buffer, buf.offset, 64, &[1u8; 64], 0, &[]);
        ctx.teardown();

        assert_eq!(ctx.state(), ContextState::TornDown);
        assert_eq!(driver.live_regions(), 0);
        assert_eq!(driver.loaded_kernels(), 0);
        assert_eq!(driver.live_events(), 0);
        assert_eq!(ctx.enqueue_marker(&[]), NO_EVENT);
        assert!(matches!(ctx.allocate(8), Err(RuntimeError::InvalidState { .. })));
    }

    #[test]
    fn test_drop_tears_down() {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        {
            let mut ctx = DeviceContext::new(driver.clone(), &config()).unwrap();
            ctx.init().unwrap();
        }
        assert_eq!(driver.live_regions(), 0);
    }
}
