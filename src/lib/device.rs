//! # Device Capabilities
//!
//! Device quirks are data, not types: a [`CapabilityTable`] of name patterns
//! decides once, at context construction, which flags apply to the opened
//! device. Nothing re-derives them per call.

use crate::config::RuntimeConfig;
use crate::driver::{DeviceInfo, DeviceKind};

/// Which name of the device a rule is matched against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchTarget {
    DeviceName,
    PlatformName,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Matching {
    /// Whole name, case-insensitive.
    Exact,
    /// Substring, case-insensitive.
    Contains,
}

/// Flags a rule contributes when it matches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub needs_bump: bool,
    pub fpga: bool,
}

impl CapabilityFlags {
    fn merge(self, other: CapabilityFlags) -> CapabilityFlags {
        CapabilityFlags {
            needs_bump: self.needs_bump || other.needs_bump,
            fpga: self.fpga || other.fpga,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityRule {
    pub target: MatchTarget,
    pub pattern: String,
    pub matching: Matching,
    /// Rule only applies to devices of this kind.
    pub kind: Option<DeviceKind>,
    pub flags: CapabilityFlags,
}

impl CapabilityRule {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        if self.kind.is_some_and(|kind| kind != info.kind) {
            return false;
        }
        let name = match self.target {
            MatchTarget::DeviceName => &info.name,
            MatchTarget::PlatformName => &info.platform_name,
        };
        match self.matching {
            Matching::Exact => name.eq_ignore_ascii_case(&self.pattern),
            Matching::Contains => name
                .to_ascii_lowercase()
                .contains(&self.pattern.to_ascii_lowercase()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    rules: Vec<CapabilityRule>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table derived from the bump device list and FPGA platform patterns.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut table = Self::new();
        for device in &config.bump_devices {
            table.push(CapabilityRule {
                target: MatchTarget::DeviceName,
                pattern: device.clone(),
                matching: Matching::Exact,
                kind: None,
                flags: CapabilityFlags {
                    needs_bump: true,
                    fpga: false,
                },
            });
        }
        for platform in &config.fpga_platforms {
            table.push(CapabilityRule {
                target: MatchTarget::PlatformName,
                pattern: platform.clone(),
                matching: Matching::Contains,
                kind: Some(DeviceKind::Accelerator),
                flags: CapabilityFlags {
                    needs_bump: false,
                    fpga: true,
                },
            });
        }
        table
    }

    pub fn push(&mut self, rule: CapabilityRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[CapabilityRule] {
        &self.rules
    }

    /// Union of the flags of every matching rule.
    pub fn lookup(&self, info: &DeviceInfo) -> CapabilityFlags {
        self.rules
            .iter()
            .filter(|rule| rule.matches(info))
            .fold(CapabilityFlags::default(), |acc, rule| acc.merge(rule.flags))
    }
}

/// Quirks of the opened device, fixed for the life of its context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub needs_bump: bool,
    pub is_fpga: bool,
    pub use_relative_addresses: bool,
}

impl DeviceCapabilities {
    /// FPGA targets always use relative addressing, whatever the config says.
    pub fn detect(info: &DeviceInfo, table: &CapabilityTable, config: &RuntimeConfig) -> Self {
        let flags = table.lookup(info);
        Self {
            needs_bump: flags.needs_bump,
            is_fpga: flags.fpga,
            use_relative_addresses: config.use_relative_addresses || flags.fpga,
        }
    }

    /// Relative addressing was switched on by the device, not the config.
    pub fn relative_addresses_forced(&self, config: &RuntimeConfig) -> bool {
        self.is_fpga && !config.use_relative_addresses
    }
}
