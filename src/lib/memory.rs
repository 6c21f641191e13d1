//! # Heap Memory Manager
//!
//! Every device allocation of a context comes out of one pre-reserved region,
//! the heap. Compiled kernels address data as `heap + offset`, so buffers are
//! nothing more than byte ranges handed out by a bump pointer:
//!
//! ```text
//!   0                 offset                                size
//!   |-- allocated --->|----------- available --------------|
//! ```
//!
//! There is no per-buffer free. [`MemoryManager::reset`] rewinds the pointer
//! to zero between independent executions; the region itself is only given
//! back to the device at context teardown.

use crate::driver::NativeBuffer;
use crate::error::{Result, RuntimeError};
use crate::queue::CommandQueue;
use crate::util::{align_up, human_readable_bytes};

/// Every allocation starts on a 64-bit boundary.
pub const HEAP_ALIGNMENT: u64 = 8;

/// The device region backing the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapRegion {
    pub buffer: NativeBuffer,
    pub size: u64,
}

/// A view over `[offset, offset + length)` of the heap. Creating one does no
/// device work and it is never freed on its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubBuffer {
    pub buffer: NativeBuffer,
    pub offset: u64,
    pub length: u64,
}

impl SubBuffer {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Bump allocator over the heap region of one device.
#[derive(Debug, Default)]
pub struct MemoryManager {
    region: Option<HeapRegion>,
    offset: u64,
    heap_base_address: u64,
    use_relative_addresses: bool,
    initialised: bool,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the heap, clamped to the device's largest single allocation.
    /// Returns the size actually reserved.
    pub fn allocate_region(&mut self, queue: &CommandQueue, size: u64) -> Result<u64> {
        if self.region.is_some() {
            return Err(RuntimeError::RegionAlreadyAllocated);
        }

        let info = queue.device_info();
        let size = size.min(info.max_alloc_size);
        let buffer = queue
            .allocate_region(size)
            .map_err(|source| RuntimeError::RegionAllocation {
                device: info.name.clone(),
                requested: size,
                source,
            })?;

        tracing::debug!(
            "allocated heap region of {} on {}",
            human_readable_bytes(size),
            info.name
        );
        self.region = Some(HeapRegion { buffer, size });
        self.offset = 0;
        Ok(size)
    }

    fn region(&self) -> Result<&HeapRegion> {
        self.region.as_ref().ok_or(RuntimeError::RegionNotAllocated)
    }

    /// View over part of the region, checked against its bounds.
    pub fn sub_buffer(&self, offset: u64, length: u64) -> Result<SubBuffer> {
        let region = self.region()?;
        let end = offset.checked_add(length).unwrap_or(u64::MAX);
        if end > region.size {
            return Err(RuntimeError::InvalidRange {
                offset,
                end,
                size: region.size,
            });
        }
        Ok(SubBuffer {
            buffer: region.buffer,
            offset,
            length,
        })
    }

    /// Bump-allocates `bytes` and returns the heap offset of the new buffer.
    /// The offset is left untouched when the request does not fit.
    pub fn allocate(&mut self, bytes: u64) -> Result<u64> {
        let capacity = self.region()?.size;
        let available = capacity - self.offset;
        let aligned = align_up(bytes, HEAP_ALIGNMENT)
            .filter(|&aligned| aligned <= available)
            .ok_or(RuntimeError::OutOfMemory {
                requested: bytes,
                available,
                capacity,
            })?;

        let start = self.offset;
        self.offset += aligned;
        Ok(start)
    }

    /// [`allocate`](Self::allocate) plus a view of exactly `bytes` bytes.
    pub fn allocate_buffer(&mut self, bytes: u64) -> Result<SubBuffer> {
        let offset = self.allocate(bytes)?;
        self.sub_buffer(offset, bytes)
    }

    /// Records the heap's absolute device address as reported by the
    /// bootstrap kernel.
    pub fn init(&mut self, heap_base_address: u64, use_relative_addresses: bool) {
        self.heap_base_address = heap_base_address;
        self.use_relative_addresses = use_relative_addresses;
        self.initialised = true;
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn heap_base_address(&self) -> u64 {
        self.heap_base_address
    }

    pub fn uses_relative_addresses(&self) -> bool {
        self.use_relative_addresses
    }

    /// Address of heap `offset` in the form kernels expect in their frames.
    pub fn to_kernel_address(&self, offset: u64) -> u64 {
        if self.use_relative_addresses {
            offset
        } else {
            self.to_absolute_address(offset)
        }
    }

    pub fn to_absolute_address(&self, offset: u64) -> u64 {
        self.heap_base_address + offset
    }

    pub fn to_relative_address(&self, address: u64) -> u64 {
        address.saturating_sub(self.heap_base_address)
    }

    /// Rewinds the bump pointer; the region stays allocated.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Hands the region back to the device.
    pub fn release(&mut self, queue: &CommandQueue) {
        if let Some(region) = self.region.take() {
            if let Err(e) = queue.release_region(region.buffer) {
                tracing::error!("failed to release heap region: {}", e);
            }
        }
        self.offset = 0;
        self.initialised = false;
    }

    pub fn heap_buffer(&self) -> Option<NativeBuffer> {
        self.region.map(|r| r.buffer)
    }

    pub fn heap_region(&self) -> Option<HeapRegion> {
        self.region
    }

    pub fn capacity(&self) -> u64 {
        self.region.map_or(0, |r| r.size)
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn available(&self) -> u64 {
        self.capacity() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDeviceSpec, HostDriver};
    use std::sync::Arc;

    fn manager(spec: HostDeviceSpec, size: u64) -> (Arc<HostDriver>, CommandQueue, MemoryManager) {
        let driver = Arc::new(HostDriver::new(spec));
        let queue = CommandQueue::new(driver.clone());
        let mut memory = MemoryManager::new();
        memory.allocate_region(&queue, size).unwrap();
        (driver, queue, memory)
    }

    #[test]
    fn test_second_allocation_overflows() {
        let (_, _, mut memory) = manager(HostDeviceSpec::default(), 1024);
        assert_eq!(memory.allocate(600).unwrap(), 0);
        let err = memory.allocate(600).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::OutOfMemory { requested: 600, available: 424, capacity: 1024 }
        ));
        assert_eq!(memory.used(), 600);
    }

    #[test]
    fn test_allocations_are_aligned() {
        let (_, _, mut memory) = manager(HostDeviceSpec::default(), 64);
        assert_eq!(memory.allocate(3).unwrap(), 0);
        assert_eq!(memory.allocate(9).unwrap(), 8);
        assert_eq!(memory.allocate(8).unwrap(), 24);
        assert_eq!(memory.available(), 32);
    }

    #[test]
    fn test_region_is_clamped_to_max_alloc() {
        let spec = HostDeviceSpec::default().with_max_alloc_size(4096);
        let (_, _, memory) = manager(spec, 1 << 20);
        assert_eq!(memory.capacity(), 4096);
    }

    #[test]
    fn test_region_allocated_once() {
        let (_, queue, mut memory) = manager(HostDeviceSpec::default(), 64);
        assert!(matches!(
            memory.allocate_region(&queue, 64),
            Err(RuntimeError::RegionAlreadyAllocated)
        ));
    }

    #[test]
    fn test_device_refusal_is_region_allocation_error() {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        driver.fail_call("allocate_region");
        let queue = CommandQueue::new(driver);
        let mut memory = MemoryManager::new();
        let err = memory.allocate_region(&queue, 64).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(matches!(err, RuntimeError::RegionAllocation { requested: 64, .. }));
        assert!(matches!(memory.allocate(8), Err(RuntimeError::RegionNotAllocated)));
    }

    #[test]
    fn test_sub_buffer_bounds() {
        let (_, _, memory) = manager(HostDeviceSpec::default(), 128);
        let view = memory.sub_buffer(64, 64).unwrap();
        assert_eq!(view.end(), 128);
        assert!(matches!(
            memory.sub_buffer(100, 64),
            Err(RuntimeError::InvalidRange { offset: 100, end: 164, size: 128 })
        ));
        assert!(memory.sub_buffer(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_reset_replays_offsets() {
        let (_, _, mut memory) = manager(HostDeviceSpec::default(), 256);
        let sizes = [5u64, 17, 64, 1];
        let first: Vec<u64> = sizes.iter().map(|&s| memory.allocate(s).unwrap()).collect();
        memory.reset();
        let second: Vec<u64> = sizes.iter().map(|&s| memory.allocate(s).unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(memory.capacity(), 256);
    }

    #[test]
    fn test_kernel_addresses() {
        let (_, _, mut memory) = manager(HostDeviceSpec::default(), 256);
        memory.init(0x1000, false);
        assert_eq!(memory.to_kernel_address(16), 0x1010);
        assert_eq!(memory.to_relative_address(0x1010), 16);
        memory.init(0x1000, true);
        assert_eq!(memory.to_kernel_address(16), 16);
    }

    #[test]
    fn test_release_returns_region() {
        let (driver, queue, mut memory) = manager(HostDeviceSpec::default(), 256);
        assert_eq!(driver.live_regions(), 1);
        memory.release(&queue);
        assert_eq!(driver.live_regions(), 0);
        assert!(memory.heap_buffer().is_none());
    }
}
