//! # Kernel Code Cache
//!
//! Maps a `(task id, entry point)` key to a kernel loaded on the device.
//! A key is compiled and loaded at most once: later installs of the same key
//! return the stored handle even when they carry different code.
//!
//! # Concurrency
//!
//! - Lookups take a shared read lock and never wait on a compile.
//! - Installs of one key are serialised by a per-key lock, so a second caller
//!   blocks until the first finishes and then receives its result.
//! - Installs of different keys run in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::driver::{KernelCode, NativeKernel};
use crate::error::{Result, RuntimeError};
use crate::metadata::TaskMetaData;
use crate::queue::CommandQueue;

/// Cache key of an installed kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub task_id: String,
    pub entry_point: String,
}

impl KernelKey {
    pub fn new(task_id: &str, entry_point: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            entry_point: entry_point.to_string(),
        }
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.task_id, self.entry_point)
    }
}

/// A kernel ready to launch.
#[derive(Debug)]
pub struct InstalledKernel {
    pub key: KernelKey,
    pub kernel: NativeKernel,
    pub meta: TaskMetaData,
    /// Size of the code it was loaded from.
    pub code_len: usize,
}

pub struct KernelCache {
    queue: CommandQueue,
    print_source: bool,
    installed: RwLock<HashMap<KernelKey, Arc<InstalledKernel>>>,
    install_locks: Mutex<HashMap<KernelKey, Arc<Mutex<()>>>>,
    // Evicted by reset but possibly still referenced by queued launches.
    retired: Mutex<Vec<NativeKernel>>,
}

impl KernelCache {
    pub fn new(queue: CommandQueue, print_source: bool) -> Self {
        Self {
            queue,
            print_source,
            installed: RwLock::new(HashMap::new()),
            install_locks: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn lookup(&self, key: &KernelKey) -> Option<Arc<InstalledKernel>> {
        self.installed.read().get(key).cloned()
    }

    /// Returns the kernel for `(task_id, entry_point)`, loading `code` on a
    /// miss. A failed load caches nothing.
    pub fn install_source(
        &self,
        meta: &TaskMetaData,
        task_id: &str,
        entry_point: &str,
        code: &KernelCode,
    ) -> Result<Arc<InstalledKernel>> {
        let key = KernelKey::new(task_id, entry_point);

        // Fast path
        if let Some(kernel) = self.lookup(&key) {
            return Ok(kernel);
        }

        let key_lock = self
            .install_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let _guard = key_lock.lock();

        // Another caller may have installed it while we waited
        if let Some(kernel) = self.lookup(&key) {
            return Ok(kernel);
        }

        if self.print_source {
            if let KernelCode::Source(source) = code {
                tracing::info!("kernel source for {}:\n{}", key, source);
            }
        }

        let kernel = self
            .queue
            .load_kernel(entry_point, code)
            .map_err(|e| RuntimeError::Compilation {
                task_id: task_id.to_string(),
                entry_point: entry_point.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("installed kernel {} ({} bytes)", key, code.len());
        let installed = Arc::new(InstalledKernel {
            key: key.clone(),
            kernel,
            meta: meta.clone(),
            code_len: code.len(),
        });
        if let Some(displaced) = self.installed.write().insert(key, installed.clone()) {
            self.retired.lock().push(displaced.kernel);
        }
        Ok(installed)
    }

    pub fn is_cached(&self, task_id: &str, entry_point: &str) -> bool {
        self.installed
            .read()
            .contains_key(&KernelKey::new(task_id, entry_point))
    }

    pub fn installed_code(&self, task_id: &str, entry_point: &str) -> Option<Arc<InstalledKernel>> {
        self.lookup(&KernelKey::new(task_id, entry_point))
    }

    pub fn len(&self) -> usize {
        self.installed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.read().is_empty()
    }

    /// Forgets every installed kernel. Loaded modules are kept until
    /// [`release_all`](Self::release_all), since a launch may still use them.
    ///
    /// Per-key install locks survive, so an install already in flight still
    /// serialises later installs of its key.
    pub fn reset(&self) {
        let evicted: Vec<NativeKernel> = self
            .installed
            .write()
            .drain()
            .map(|(_, kernel)| kernel.kernel)
            .collect();
        self.retired.lock().extend(evicted);
    }

    /// Unloads every module, cached or retired. Teardown only.
    pub fn release_all(&self) {
        let mut kernels: Vec<NativeKernel> = self.retired.lock().drain(..).collect();
        kernels.extend(self.installed.write().drain().map(|(_, k)| k.kernel));
        for kernel in kernels {
            self.queue.unload_kernel(kernel);
        }
        self.install_locks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDeviceSpec, HostDriver};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<HostDriver>, KernelCache) {
        let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
        driver.register_kernel("add", |_| Ok(()));
        driver.register_kernel("mul", |_| Ok(()));
        let cache = KernelCache::new(CommandQueue::new(driver.clone()), false);
        (driver, cache)
    }

    fn source(text: &str) -> KernelCode {
        KernelCode::Source(text.to_string())
    }

    #[test]
    fn test_key_display() {
        assert_eq!(KernelKey::new("s0.t0", "add").to_string(), "s0.t0-add");
    }

    #[test]
    fn test_first_install_wins() {
        let (driver, cache) = setup();
        let meta = TaskMetaData::new("s0", "t0", 0);
        let first = cache.install_source(&meta, "s0.t0", "add", &source("v1")).unwrap();
        let second = cache
            .install_source(&meta, "s0.t0", "add", &source("v2 is longer"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.code_len, 2);
        assert_eq!(driver.kernel_loads(), 1);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let (driver, cache) = setup();
        let meta = TaskMetaData::new("s0", "t0", 0);
        let err = cache
            .install_source(&meta, "s0.t0", "missing", &source("x"))
            .unwrap_err();
        match err {
            RuntimeError::Compilation { task_id, entry_point, .. } => {
                assert_eq!(task_id, "s0.t0");
                assert_eq!(entry_point, "missing");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!cache.is_cached("s0.t0", "missing"));
        assert_eq!(driver.kernel_loads(), 0);
    }

    #[test]
    fn test_reset_retires_without_unloading() {
        let (driver, cache) = setup();
        let meta = TaskMetaData::new("s0", "t0", 0);
        cache.install_source(&meta, "s0.t0", "add", &source("a")).unwrap();
        assert!(cache.is_cached("s0.t0", "add"));

        cache.reset();
        assert!(!cache.is_cached("s0.t0", "add"));
        assert!(cache.is_empty());
        assert_eq!(driver.loaded_kernels(), 1);

        cache.install_source(&meta, "s0.t0", "add", &source("a")).unwrap();
        assert_eq!(driver.kernel_loads(), 2);

        cache.release_all();
        assert_eq!(driver.loaded_kernels(), 0);
    }

    #[test]
    fn test_reset_during_install_loads_once() {
        let driver = Arc::new(HostDriver::new(
            HostDeviceSpec::default().with_load_delay(Duration::from_millis(200)),
        ));
        driver.register_kernel("add", |_| Ok(()));
        let cache = KernelCache::new(CommandQueue::new(driver.clone()), false);
        let meta = TaskMetaData::new("s0", "t0", 0);

        let (first, second) = thread::scope(|scope| {
            let slow = scope.spawn(|| cache.install_source(&meta, "s0.t0", "add", &source("a")));
            thread::sleep(Duration::from_millis(50));
            cache.reset();
            let late = scope.spawn(|| cache.install_source(&meta, "s0.t0", "add", &source("a")));
            (slow.join().unwrap().unwrap(), late.join().unwrap().unwrap())
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.kernel_loads(), 1);
        assert_eq!(cache.len(), 1);

        cache.release_all();
        assert_eq!(driver.loaded_kernels(), 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_, cache) = setup();
        let meta = TaskMetaData::new("s0", "t0", 0);
        let a = cache.install_source(&meta, "s0.t0", "add", &source("a")).unwrap();
        let b = cache.install_source(&meta, "s0.t1", "add", &source("a")).unwrap();
        let c = cache.install_source(&meta, "s0.t0", "mul", &source("m")).unwrap();
        assert_ne!(a.kernel, b.kernel);
        assert_ne!(a.kernel, c.kernel);
        assert_eq!(cache.len(), 3);
    }
}
