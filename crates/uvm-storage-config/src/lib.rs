// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the storage resources of a utility VM.
//!
//! The SCSI and VPMEM topology of a UVM is fixed when it is created.  This
//! crate describes that topology as TOML so it can be supplied alongside the
//! rest of the UVM creation options, and validates it against the limits the
//! hypervisor imposes.

use std::path::Path;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Hard limit on SCSI controllers a UVM may be created with.
pub const MAX_SCSI_CONTROLLERS: u32 = 4;
/// Hard limit on LUNs per SCSI controller.
pub const MAX_LUNS_PER_CONTROLLER: u32 = 64;
/// Hard limit on VPMEM devices a UVM may be created with.
pub const MAX_VPMEM_DEVICES: u32 = 128;
/// Default number of VPMEM devices.
pub const DEFAULT_VPMEM_DEVICES: u32 = 64;
/// Default size of each VPMEM device (4 GiB).
pub const DEFAULT_VPMEM_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;
/// Default cap on VHDs mapped onto a single multi-mapped VPMEM device.
pub const DEFAULT_MAX_MAPPINGS_PER_DEVICE: u32 = 1024;

const VPMEM_SIZE_ALIGN: u64 = 4096;

/// Operating system running inside the utility VM.
///
/// The guest OS determines the shape of guest requests and which storage
/// features are usable at all.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    #[default]
    Linux,
    Windows,
}

/// Storage configuration of a utility VM.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub guest_os: GuestOs,

    #[serde(default)]
    pub scsi: ScsiConfig,

    #[serde(default)]
    pub vpmem: VpmemConfig,
}

/// A single controller/LUN coordinate.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SlotRef {
    pub controller: u32,
    pub lun: u32,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ScsiConfig {
    /// Number of SCSI controllers attached to the UVM.
    #[serde(default = "default_controllers")]
    pub controllers: u32,

    #[serde(default = "default_luns")]
    pub luns_per_controller: u32,

    /// The guest agent only understands LUNs on controller 0 unless this is
    /// set; attachments which would land on a later controller are refused.
    #[serde(default)]
    pub multi_controller: bool,

    /// Permit several guest mounts of one read-only layer attachment.
    #[serde(default = "default_true")]
    pub multi_mount: bool,

    /// Slots which are in use before the manager is constructed (such as the
    /// scratch disk attached at boot) and must never be handed out.
    #[serde(default)]
    pub reserved: Vec<SlotRef>,
}
impl Default for ScsiConfig {
    fn default() -> Self {
        Self {
            controllers: default_controllers(),
            luns_per_controller: default_luns(),
            multi_controller: false,
            multi_mount: true,
            reserved: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct VpmemConfig {
    #[serde(default = "default_vpmem_devices")]
    pub devices: u32,

    /// Capacity of each VPMEM device.  In single-mapping mode this bounds the
    /// size of each layer; in multi-mapping mode it bounds the sum of all
    /// layers mapped onto one device.
    #[serde(default = "default_vpmem_size")]
    pub max_size_bytes: u64,

    #[serde(default = "default_true")]
    pub multi_mapping: bool,

    #[serde(default = "default_max_mappings")]
    pub max_mappings_per_device: u32,
}
impl Default for VpmemConfig {
    fn default() -> Self {
        Self {
            devices: default_vpmem_devices(),
            max_size_bytes: default_vpmem_size(),
            multi_mapping: true,
            max_mappings_per_device: default_max_mappings(),
        }
    }
}

fn default_controllers() -> u32 {
    MAX_SCSI_CONTROLLERS
}
fn default_luns() -> u32 {
    MAX_LUNS_PER_CONTROLLER
}
fn default_vpmem_devices() -> u32 {
    DEFAULT_VPMEM_DEVICES
}
fn default_vpmem_size() -> u64 {
    DEFAULT_VPMEM_SIZE_BYTES
}
fn default_max_mappings() -> u32 {
    DEFAULT_MAX_MAPPINGS_PER_DEVICE
}
fn default_true() -> bool {
    true
}

/// Errors which may be returned when parsing or validating the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SCSI controller count can't be more than 4, got {0}")]
    TooManyControllers(u32),

    #[error("LUNs per controller must be within 1..=64, got {0}")]
    InvalidLunCount(u32),

    #[error("reserved slot {0}:{1} is outside the configured SCSI topology")]
    ReservedOutOfRange(u32, u32),

    #[error("VPMEM device count cannot be greater than 128, got {0}")]
    TooManyVpmemDevices(u32),

    #[error(
        "VPMEM max_size_bytes must be a non-zero multiple of 4096, got {0}"
    )]
    InvalidVpmemSize(u64),

    #[error("{0} is not supported for a Windows guest")]
    UnsupportedForWindows(&'static str),
}

impl Config {
    /// Check the configuration against hypervisor and guest limits.
    pub fn validate(&self) -> Result<(), ParseError> {
        let scsi = &self.scsi;
        if scsi.controllers > MAX_SCSI_CONTROLLERS {
            return Err(ParseError::TooManyControllers(scsi.controllers));
        }
        if scsi.luns_per_controller == 0
            || scsi.luns_per_controller > MAX_LUNS_PER_CONTROLLER
        {
            return Err(ParseError::InvalidLunCount(scsi.luns_per_controller));
        }
        if let Some(bad) = scsi.reserved.iter().find(|s| {
            s.controller >= scsi.controllers
                || s.lun >= scsi.luns_per_controller
        }) {
            return Err(ParseError::ReservedOutOfRange(bad.controller, bad.lun));
        }

        let vpmem = &self.vpmem;
        if vpmem.devices > MAX_VPMEM_DEVICES {
            return Err(ParseError::TooManyVpmemDevices(vpmem.devices));
        }
        if vpmem.devices > 0
            && (vpmem.max_size_bytes == 0
                || vpmem.max_size_bytes % VPMEM_SIZE_ALIGN != 0)
        {
            return Err(ParseError::InvalidVpmemSize(vpmem.max_size_bytes));
        }

        if self.guest_os == GuestOs::Windows {
            if scsi.multi_controller {
                return Err(ParseError::UnsupportedForWindows(
                    "multi_controller",
                ));
            }
            if vpmem.devices > 0 {
                return Err(ParseError::UnsupportedForWindows("vpmem"));
            }
        }
        Ok(())
    }

    /// Whether guest mounts of one attachment may be multiplexed.
    pub fn multi_mount(&self) -> bool {
        self.guest_os == GuestOs::Linux && self.scsi.multi_mount
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parses and validates a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
