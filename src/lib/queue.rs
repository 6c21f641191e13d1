//! # Command Queue Adapter
//!
//! Thin wrapper over the raw [`Driver`] primitive. Every enqueue returns a
//! native event handle; a failing native call is logged and surfaces as
//! [`NativeEvent::NONE`] instead of an error, so the hot submission paths
//! never unwind. Region and kernel loading are the exceptions and propagate
//! the [`DriverError`] to the caller.

use std::fmt;
use std::sync::Arc;

use crate::driver::{
    DeviceInfo, Driver, DriverError, EventProfile, EventStatus, KernelArgs, KernelCode,
    LaunchGeometry, NativeBuffer, NativeEvent, NativeKernel,
};

/// Cloneable handle to the device's in-order command queue.
#[derive(Clone)]
pub struct CommandQueue {
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("device", &self.driver.info().name)
            .finish()
    }
}

impl CommandQueue {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.driver.info()
    }

    pub fn capability_version(&self) -> u32 {
        self.driver.info().capability_version
    }

    /// Logs a failed native call and maps it to the sentinel event.
    fn soft_fail(&self, result: Result<NativeEvent, DriverError>) -> NativeEvent {
        match result {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    device = %self.driver.info().name,
                    call = e.call,
                    code = e.code,
                    "{}",
                    e.message
                );
                NativeEvent::NONE
            }
        }
    }

    fn soft_fail_unit(&self, result: Result<(), DriverError>) {
        if let Err(e) = result {
            tracing::error!(
                device = %self.driver.info().name,
                call = e.call,
                code = e.code,
                "{}",
                e.message
            );
        }
    }

    pub fn allocate_region(&self, bytes: u64) -> Result<NativeBuffer, DriverError> {
        self.driver.allocate_region(bytes)
    }

    pub fn release_region(&self, buffer: NativeBuffer) -> Result<(), DriverError> {
        self.driver.release_region(buffer)
    }

    pub fn load_kernel(
        &self,
        entry_point: &str,
        code: &KernelCode,
    ) -> Result<NativeKernel, DriverError> {
        self.driver.load_kernel(entry_point, code)
    }

    pub fn unload_kernel(&self, kernel: NativeKernel) {
        self.soft_fail_unit(self.driver.unload_kernel(kernel));
    }

    pub fn bootstrap_kernel(&self) -> KernelCode {
        self.driver.bootstrap_kernel()
    }

    /// Copies `src` into `buffer` at `offset`. The host slice is no longer
    /// referenced once this returns.
    pub fn enqueue_write(
        &self,
        buffer: NativeBuffer,
        blocking: bool,
        offset: u64,
        src: &[u8],
        waits: &[NativeEvent],
    ) -> NativeEvent {
        self.soft_fail(self.driver.enqueue_write(buffer, blocking, offset, src, waits))
    }

    pub fn enqueue_read(
        &self,
        buffer: NativeBuffer,
        blocking: bool,
        offset: u64,
        dst: &mut [u8],
        waits: &[NativeEvent],
    ) -> NativeEvent {
        self.soft_fail(self.driver.enqueue_read(buffer, blocking, offset, dst, waits))
    }

    pub fn enqueue_kernel(
        &self,
        kernel: NativeKernel,
        geometry: &LaunchGeometry,
        args: &KernelArgs,
        waits: &[NativeEvent],
    ) -> NativeEvent {
        self.soft_fail(self.driver.enqueue_kernel(kernel, geometry, args, waits))
    }

    pub fn enqueue_barrier(&self, waits: &[NativeEvent]) -> NativeEvent {
        self.soft_fail(self.driver.enqueue_barrier(waits))
    }

    pub fn enqueue_marker(&self, waits: &[NativeEvent]) -> NativeEvent {
        self.soft_fail(self.driver.enqueue_marker(waits))
    }

    pub fn flush(&self) {
        self.soft_fail_unit(self.driver.flush());
    }

    pub fn finish(&self) {
        self.soft_fail_unit(self.driver.finish());
    }

    pub fn wait_events(&self, events: &[NativeEvent]) {
        if events.is_empty() {
            return;
        }
        self.soft_fail_unit(self.driver.wait_events(events));
    }

    /// Status of `event`; a failed query reports the driver error code.
    pub fn event_status(&self, event: NativeEvent) -> EventStatus {
        match self.driver.event_status(event) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(
                    device = %self.driver.info().name,
                    call = e.call,
                    "{}",
                    e.message
                );
                EventStatus::Error(e.code)
            }
        }
    }

    /// Profiling timestamps of `event`; zeros when the driver cannot tell.
    pub fn event_profile(&self, event: NativeEvent) -> EventProfile {
        match self.driver.event_profile(event) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    device = %self.driver.info().name,
                    call = e.call,
                    "{}",
                    e.message
                );
                EventProfile::default()
            }
        }
    }

    pub fn release_event(&self, event: NativeEvent) {
        if event.is_none() {
            return;
        }
        self.soft_fail_unit(self.driver.release_event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDeviceSpec, HostDriver};

    #[test]
    fn test_failed_enqueue_returns_none_handle() {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        let queue = CommandQueue::new(driver.clone());
        let heap = queue.allocate_region(64).unwrap();

        driver.fail_call("enqueue_write");
        let event = queue.enqueue_write(heap, true, 0, &[1, 2, 3, 4], &[]);
        assert!(event.is_none());

        driver.clear_failures();
        let event = queue.enqueue_write(heap, true, 0, &[1, 2, 3, 4], &[]);
        assert!(!event.is_none());
    }

    #[test]
    fn test_out_of_range_write_is_soft_failure() {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        let queue = CommandQueue::new(driver);
        let heap = queue.allocate_region(16).unwrap();
        assert!(queue.enqueue_write(heap, true, 12, &[0u8; 8], &[]).is_none());
    }

    #[test]
    fn test_releasing_none_event_is_noop() {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        let queue = CommandQueue::new(driver.clone());
        queue.release_event(NativeEvent::NONE);
        assert_eq!(driver.live_events(), 0);
    }
}
