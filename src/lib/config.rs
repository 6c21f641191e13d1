//! # Runtime Configuration
//!
//! `RuntimeConfig` is built once by the embedder and passed by reference to
//! [`crate::DeviceContext::new`]. It can be assembled from defaults, from
//! `ACCELRT_*` environment variables, or from a JSON file; all three paths
//! end in [`RuntimeConfig::validate`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metadata::TaskOverrides;
use crate::util::parse_byte_size;

/// Default heap request: 1 GiB, clamped to the device's max allocation.
pub const DEFAULT_HEAP_SIZE: u64 = 1 << 30;
/// Size of the dummy buffer placed ahead of the heap on bump devices.
pub const DEFAULT_BUMP_BUFFER_SIZE: u64 = 0x100000;
/// Default capacity of the in-flight event window.
pub const DEFAULT_EVENT_WINDOW: usize = 1024;
/// Largest accepted event window; keeps event ids well inside `i32`.
pub const MAX_EVENT_WINDOW: usize = 1 << 20;

/// Knobs of one device runtime instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Requested heap region size in bytes.
    pub heap_size: u64,
    /// Log kernel source text when it is installed.
    pub print_kernel_source: bool,
    pub bump_buffer_size: u64,
    /// Device names (exact, case-insensitive) that must not place the heap at
    /// device address 0.
    pub bump_devices: Vec<String>,
    /// Platform name fragments identifying FPGA platforms.
    pub fpga_platforms: Vec<String>,
    /// Write heap-relative offsets into kernel frames instead of absolute
    /// device addresses.
    pub use_relative_addresses: bool,
    pub profiling: bool,
    /// Log the device time of every launch made through `launch`.
    pub print_kernel_time: bool,
    /// Dump the event timeline on teardown.
    pub dump_events: bool,
    /// Flush before finishing in `sync`.
    pub sync_flush: bool,
    pub event_window: usize,
    /// Per-task work-size overrides keyed by task id (`schedule.task`).
    pub task_overrides: HashMap<String, TaskOverrides>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            print_kernel_source: false,
            bump_buffer_size: DEFAULT_BUMP_BUFFER_SIZE,
            bump_devices: vec!["Iris Pro".to_string()],
            fpga_platforms: vec!["fpga".to_string(), "xilinx".to_string()],
            use_relative_addresses: false,
            profiling: true,
            print_kernel_time: false,
            dump_events: false,
            sync_flush: false,
            event_window: DEFAULT_EVENT_WINDOW,
            task_overrides: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with the `ACCELRT_*` process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `ACCELRT_*` key. Lets tests avoid touching the real environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("ACCELRT_HEAP_SIZE") {
            cfg.heap_size = parse_size("ACCELRT_HEAP_SIZE", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_PRINT_KERNEL") {
            cfg.print_kernel_source = parse_bool("ACCELRT_PRINT_KERNEL", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_BUMP_SIZE") {
            cfg.bump_buffer_size = parse_size("ACCELRT_BUMP_SIZE", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_BUMP_DEVICES") {
            cfg.bump_devices = parse_list(&v);
        }
        if let Some(v) = lookup("ACCELRT_FPGA_PLATFORMS") {
            cfg.fpga_platforms = parse_list(&v);
        }
        if let Some(v) = lookup("ACCELRT_RELATIVE_ADDRESSES") {
            cfg.use_relative_addresses = parse_bool("ACCELRT_RELATIVE_ADDRESSES", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_PROFILING") {
            cfg.profiling = parse_bool("ACCELRT_PROFILING", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_KERNEL_TIMER") {
            cfg.print_kernel_time = parse_bool("ACCELRT_KERNEL_TIMER", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_DUMP_EVENTS") {
            cfg.dump_events = parse_bool("ACCELRT_DUMP_EVENTS", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_SYNC_FLUSH") {
            cfg.sync_flush = parse_bool("ACCELRT_SYNC_FLUSH", &v)?;
        }
        if let Some(v) = lookup("ACCELRT_EVENT_WINDOW") {
            cfg.event_window = v.trim().parse().map_err(|_| invalid(
                "ACCELRT_EVENT_WINDOW",
                &v,
                "expected an integer",
            ))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads a JSON document; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size == 0 {
            return Err(invalid("heap_size", "0", "heap size must be non-zero"));
        }
        if self.bump_buffer_size == 0 {
            return Err(invalid(
                "bump_buffer_size",
                "0",
                "bump buffer size must be non-zero",
            ));
        }
        if self.event_window == 0 || self.event_window > MAX_EVENT_WINDOW {
            return Err(invalid(
                "event_window",
                &self.event_window.to_string(),
                &format!("must be between 1 and {}", MAX_EVENT_WINDOW),
            ));
        }
        for (task, overrides) in &self.task_overrides {
            overrides.validate().map_err(|reason| invalid(
                &format!("task_overrides.{}", task),
                &format!("{:?}", overrides),
                &reason,
            ))?;
        }
        Ok(())
    }

    pub fn overrides_for(&self, task_id: &str) -> Option<&TaskOverrides> {
        self.task_overrides.get(task_id)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_byte_size(value).ok_or_else(|| invalid(key, value, "expected a byte size such as 512MB"))
}

/// Splits a `;` separated list, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.heap_size, 1 << 30);
        assert_eq!(cfg.bump_buffer_size, 0x100000);
        assert_eq!(cfg.bump_devices, vec!["Iris Pro"]);
        assert_eq!(cfg.event_window, 1024);
        assert!(cfg.profiling);
        assert!(!cfg.use_relative_addresses);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_env_overlay() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("ACCELRT_HEAP_SIZE", "512MB"),
            ("ACCELRT_BUMP_DEVICES", "Iris Pro; Custom GPU ;"),
            ("ACCELRT_RELATIVE_ADDRESSES", "true"),
            ("ACCELRT_EVENT_WINDOW", "16"),
            ("ACCELRT_BUMP_SIZE", "0x2000"),
        ]))
        .unwrap();
        assert_eq!(cfg.heap_size, 512 << 20);
        assert_eq!(cfg.bump_devices, vec!["Iris Pro", "Custom GPU"]);
        assert!(cfg.use_relative_addresses);
        assert_eq!(cfg.event_window, 16);
        assert_eq!(cfg.bump_buffer_size, 0x2000);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = RuntimeConfig::from_lookup(lookup(&[("ACCELRT_PROFILING", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ACCELRT_PROFILING"));

        assert!(RuntimeConfig::from_lookup(lookup(&[("ACCELRT_EVENT_WINDOW", "0")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("ACCELRT_HEAP_SIZE", "huge")])).is_err());
    }

    #[test]
    fn test_json_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "heap_size": 4096,
                "dump_events": true,
                "task_overrides": {{
                    "s0.t0": {{ "global_dims": "64,64", "local_dims": "8,8" }}
                }}
            }}"#
        )
        .unwrap();

        let cfg = RuntimeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.heap_size, 4096);
        assert!(cfg.dump_events);
        assert_eq!(cfg.event_window, DEFAULT_EVENT_WINDOW);
        let o = cfg.overrides_for("s0.t0").unwrap();
        assert_eq!(o.global_dims.as_deref(), Some("64,64"));
    }

    #[test]
    fn test_json_file_errors() {
        let missing = RuntimeConfig::from_json_file("/nonexistent/accelrt.json").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let bad = RuntimeConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(bad, ConfigError::Json { .. }));
    }
}
