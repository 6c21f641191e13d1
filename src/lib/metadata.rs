//! # Task Metadata
//!
//! The descriptor the external compiler attaches to every kernel: the task
//! identity, the iteration domain, user-supplied or auto-scheduled work sizes,
//! argument access modes and per-dimension coarsening. The runtime treats it
//! as read-only except for the work sizes it back-fills when it schedules a
//! task itself.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::driver::{DeviceInfo, LaunchGeometry};
use crate::events::EventId;

/// How a kernel argument is touched.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

/// Per-task overrides, usually supplied through the JSON config.
///
/// Values are comma separated per dimension, e.g. `"64,64"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOverrides {
    pub global_dims: Option<String>,
    pub local_dims: Option<String>,
    pub coarseness: Option<String>,
}

impl TaskOverrides {
    pub fn validate(&self) -> Result<(), String> {
        for value in [&self.global_dims, &self.local_dims, &self.coarseness]
            .into_iter()
            .flatten()
        {
            let dims = parse_dims(value)?;
            if dims.len() > 3 {
                return Err(format!("{:?} has more than 3 dimensions", value));
            }
            if dims.contains(&0) {
                return Err(format!("{:?} contains a zero dimension", value));
            }
        }
        Ok(())
    }
}

/// Parses `"64, 8"` into `[64, 8]`.
pub fn parse_dims(value: &str) -> Result<Vec<u64>, String> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid dimension {:?} in {:?}", part.trim(), value))
        })
        .collect()
}

fn format_dims(values: &[u64]) -> String {
    let inner: Vec<String> = values.iter().map(u64::to_string).collect();
    format!("[{}]", inner.join(", "))
}

/// Compiler-produced description of one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskMetaData {
    id: String,
    schedule_id: String,
    args_access: Vec<Access>,
    domain: Vec<u64>,
    coarseness: Vec<u64>,
    global_offset: Vec<u64>,
    global_work: Option<Vec<u64>>,
    local_work: Option<Vec<u64>>,
    global_work_defined: bool,
    schedule: bool,
    parallel: bool,
    profiling: bool,
    debug: bool,
    profiles: BTreeSet<EventId>,
}

impl TaskMetaData {
    /// Metadata for task `task_id` of schedule `schedule_id`; the full id is
    /// `"<schedule_id>.<task_id>"`.
    pub fn new(schedule_id: &str, task_id: &str, num_params: usize) -> Self {
        Self {
            id: format!("{}.{}", schedule_id, task_id),
            schedule_id: schedule_id.to_string(),
            args_access: vec![Access::None; num_params],
            domain: Vec::new(),
            coarseness: Vec::new(),
            global_offset: Vec::new(),
            global_work: None,
            local_work: None,
            global_work_defined: false,
            schedule: true,
            parallel: true,
            profiling: false,
            debug: false,
            profiles: BTreeSet::new(),
        }
    }

    pub fn with_domain(mut self, domain: &[u64]) -> Self {
        self.domain = domain.to_vec();
        self.coarseness = vec![1; domain.len()];
        self.global_offset = vec![0; domain.len()];
        self
    }

    pub fn with_global_work(mut self, values: &[u64]) -> Self {
        self.set_global_work(values);
        self
    }

    pub fn with_local_work(mut self, values: &[u64]) -> Self {
        self.set_local_work(values);
        self
    }

    pub fn with_access(mut self, index: usize, access: Access) -> Self {
        if index >= self.args_access.len() {
            self.args_access.resize(index + 1, Access::None);
        }
        self.args_access[index] = access;
        self
    }

    pub fn with_parallelization(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn dims(&self) -> usize {
        self.domain.len()
    }

    pub fn domain(&self) -> &[u64] {
        &self.domain
    }

    pub fn args_access(&self) -> &[Access] {
        &self.args_access
    }

    pub fn global_offset(&self) -> &[u64] {
        &self.global_offset
    }

    pub fn global_work(&self) -> Option<&[u64]> {
        self.global_work.as_deref()
    }

    pub fn local_work(&self) -> Option<&[u64]> {
        self.local_work.as_deref()
    }

    pub fn coarseness(&self, dim: usize) -> u64 {
        self.coarseness.get(dim).copied().unwrap_or(1)
    }

    pub fn set_coarseness(&mut self, dim: usize, value: u64) {
        if dim < self.coarseness.len() {
            self.coarseness[dim] = value.max(1);
        }
    }

    pub fn is_global_work_defined(&self) -> bool {
        self.global_work_defined
    }

    pub fn is_local_work_defined(&self) -> bool {
        self.local_work.is_some()
    }

    /// Sets the global work size unless one is already defined.
    pub fn set_global_work(&mut self, values: &[u64]) {
        if self.global_work_defined {
            tracing::debug!("task {}: global work already defined, ignoring {:?}", self.id, values);
            return;
        }
        self.global_work = Some(values.to_vec());
        self.global_work_defined = true;
        self.schedule = !(self.global_work_defined && self.is_local_work_defined());
    }

    pub fn set_local_work(&mut self, values: &[u64]) {
        self.local_work = Some(values.to_vec());
        self.schedule = !(self.global_work_defined && self.is_local_work_defined());
    }

    /// Leaves the local size to the driver.
    pub fn clear_local_work(&mut self) {
        self.local_work = None;
    }

    /// True while the runtime still has to pick a global or local size.
    pub fn should_schedule(&self) -> bool {
        self.schedule
    }

    pub fn set_schedule(&mut self, value: bool) {
        self.schedule = value;
    }

    /// Parallel tasks launch as nd-ranges, the rest as serial tasks.
    pub fn is_parallel(&self) -> bool {
        self.parallel && !self.domain.is_empty()
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn add_profile(&mut self, event: EventId) {
        self.profiles.insert(event);
    }

    /// Profiled launch events, lowest id first.
    pub fn profiles(&self) -> &BTreeSet<EventId> {
        &self.profiles
    }

    /// Drops every profiled event for which `live` returns false.
    pub fn retain_profiles<F: FnMut(EventId) -> bool>(&mut self, mut live: F) {
        self.profiles.retain(|&id| live(id));
    }

    /// Applies configured overrides. Override values win over anything the
    /// compiler defined.
    pub fn apply_overrides(&mut self, overrides: &TaskOverrides) -> Result<(), String> {
        if let Some(value) = &overrides.coarseness {
            for (dim, c) in parse_dims(value)?.into_iter().enumerate() {
                self.set_coarseness(dim, c);
            }
        }
        if let Some(value) = &overrides.global_dims {
            self.global_work_defined = false;
            self.set_global_work(&parse_dims(value)?);
        }
        if let Some(value) = &overrides.local_dims {
            self.set_local_work(&parse_dims(value)?);
        }
        Ok(())
    }

    /// Back-fills undefined work sizes for a device whose work groups hold at
    /// most `max_work_group_size` items, then clears the scheduling flag.
    pub fn resolve_work_sizes(&mut self, max_work_group_size: u64) {
        let dims = self.dims();
        if dims == 0 {
            self.schedule = false;
            return;
        }

        if !self.global_work_defined {
            let global: Vec<u64> = (0..dims)
                .map(|d| self.domain[d].div_ceil(self.coarseness(d)).max(1))
                .collect();
            self.global_work = Some(global);
            self.global_work_defined = true;
        }

        if self.local_work.is_none() {
            if let Some(global) = &self.global_work {
                self.local_work = Some(local_work_for(global, max_work_group_size));
            }
        }

        self.schedule = false;
    }

    /// Launch shape of this task; serial tasks get a single work item.
    pub fn launch_geometry(&self) -> Result<LaunchGeometry, String> {
        if !self.is_parallel() {
            return Ok(LaunchGeometry::serial());
        }
        let global = self
            .global_work
            .as_deref()
            .ok_or_else(|| format!("task {} has no global work size", self.id))?;
        LaunchGeometry::new(&self.global_offset, global, self.local_work.as_deref())
    }

    /// Multi-line thread layout report used in debug logs.
    pub fn thread_dims_summary(&self, device: &DeviceInfo) -> String {
        format!(
            "task info: {}\n\
             \tplatform          : {}\n\
             \tdevice            : {}\n\
             \tdims              : {}\n\
             \tglobal work offset: {}\n\
             \tglobal work size  : {}\n\
             \tlocal  work size  : {}",
            self.id,
            device.platform_name,
            device.name,
            self.dims(),
            format_dims(&self.global_offset),
            self.global_work
                .as_deref()
                .map_or_else(|| "null".to_string(), format_dims),
            self.local_work
                .as_deref()
                .map_or_else(|| "null".to_string(), format_dims),
        )
    }
}

impl fmt::Display for TaskMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task meta data: domain={}, global dims={}",
            format_dims(&self.domain),
            self.global_work
                .as_deref()
                .map_or_else(|| "null".to_string(), format_dims)
        )
    }
}

/// Largest `n`-th root of `value` that is still an integer floor.
fn integer_root(value: u64, n: u32) -> u64 {
    if n <= 1 {
        return value;
    }
    let mut root = (value as f64).powf(1.0 / n as f64).round() as u64;
    while root > 1 && root.checked_pow(n).map_or(true, |p| p > value) {
        root -= 1;
    }
    while (root + 1).checked_pow(n).is_some_and(|p| p <= value) {
        root += 1;
    }
    root.max(1)
}

/// Picks a local size for each dimension: the largest divisor of the global
/// size not above `max_work_group_size^(1/dims)`. A global size equal to the
/// limit is quartered so a single group does not cover the whole dimension.
fn local_work_for(global: &[u64], max_work_group_size: u64) -> Vec<u64> {
    let limit = integer_root(max_work_group_size.max(1), global.len() as u32);
    global
        .iter()
        .map(|&g| {
            let mut value = limit.min(g);
            if g == limit {
                value = (limit / 4).max(1);
            }
            while value > 1 && g % value != 0 {
                value -= 1;
            }
            value.max(1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_joins_schedule_and_task() {
        let meta = TaskMetaData::new("s0", "t1", 3);
        assert_eq!(meta.id(), "s0.t1");
        assert_eq!(meta.args_access(), &[Access::None; 3]);
    }

    #[test]
    fn test_profiles_dedupe_and_prune() {
        let mut meta = TaskMetaData::new("s0", "t0", 0);
        for id in [7, 3, 7, 11] {
            meta.add_profile(id);
        }
        assert_eq!(meta.profiles().iter().copied().collect::<Vec<_>>(), vec![3, 7, 11]);

        meta.retain_profiles(|id| id > 5);
        assert_eq!(meta.profiles().iter().copied().collect::<Vec<_>>(), vec![7, 11]);
    }

    #[test]
    fn test_global_work_is_sticky() {
        let mut meta = TaskMetaData::new("s0", "t0", 0)
            .with_domain(&[128])
            .with_global_work(&[128]);
        meta.set_global_work(&[256]);
        assert_eq!(meta.global_work(), Some(&[128][..]));
        assert!(meta.should_schedule());

        meta.set_local_work(&[32]);
        assert!(!meta.should_schedule());
    }

    #[test]
    fn test_resolve_back_fills_sizes() {
        let mut meta = TaskMetaData::new("s0", "t0", 2).with_domain(&[1024]);
        meta.resolve_work_sizes(1024);
        assert_eq!(meta.global_work(), Some(&[1024][..]));
        assert_eq!(meta.local_work(), Some(&[256][..]));
        assert!(!meta.should_schedule());

        let mut meta = TaskMetaData::new("s0", "t0", 2).with_domain(&[100, 30]);
        meta.resolve_work_sizes(1024);
        assert_eq!(meta.local_work(), Some(&[25, 30][..]));
    }

    #[test]
    fn test_coarseness_shrinks_global_work() {
        let mut meta = TaskMetaData::new("s0", "t0", 0).with_domain(&[1000]);
        meta.apply_overrides(&TaskOverrides {
            coarseness: Some("4".into()),
            ..Default::default()
        })
        .unwrap();
        meta.resolve_work_sizes(256);
        assert_eq!(meta.global_work(), Some(&[250][..]));
        assert_eq!(meta.local_work(), Some(&[250][..]));
    }

    #[test]
    fn test_overrides_replace_compiler_sizes() {
        let mut meta = TaskMetaData::new("s0", "t0", 0)
            .with_domain(&[64, 64])
            .with_global_work(&[64, 64]);
        meta.apply_overrides(&TaskOverrides {
            global_dims: Some("128,32".into()),
            local_dims: Some("16, 8".into()),
            coarseness: None,
        })
        .unwrap();
        assert_eq!(meta.global_work(), Some(&[128, 32][..]));
        assert_eq!(meta.local_work(), Some(&[16, 8][..]));
        assert!(!meta.should_schedule());

        let geometry = meta.launch_geometry().unwrap();
        assert_eq!(geometry.dims, 2);
        assert_eq!(geometry.local_work, Some([16, 8, 1]));
    }

    #[test]
    fn test_serial_task_geometry() {
        let meta = TaskMetaData::new("s0", "t0", 0)
            .with_domain(&[16])
            .with_parallelization(false);
        assert!(!meta.is_parallel());
        assert_eq!(meta.launch_geometry().unwrap(), LaunchGeometry::serial());
    }

    #[test]
    fn test_integer_root() {
        assert_eq!(integer_root(1024, 1), 1024);
        assert_eq!(integer_root(1024, 2), 32);
        assert_eq!(integer_root(1024, 3), 10);
        assert_eq!(integer_root(1, 3), 1);
    }

    #[test]
    fn test_override_validation() {
        let bad = TaskOverrides {
            local_dims: Some("8,x".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let zero = TaskOverrides {
            global_dims: Some("0".into()),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
