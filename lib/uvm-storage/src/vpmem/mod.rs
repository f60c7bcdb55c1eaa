// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only layers exposed to a Linux guest as virtual persistent memory.
//!
//! VPMEM devices are a fixed array sized when the UVM is created.  In the
//! default mode each device holds one VHD.  With multi-mapping, a device is
//! carved into page-aligned regions and several VHDs are mapped onto it, the
//! first as the device itself and the rest as additional mappings.  The mode
//! is fixed for the life of the UVM.
//!
//! Unlike SCSI, the device table lock is held across each modify request.

pub mod pool;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use slog::{debug, info, o};
use thiserror::Error;
use tokio::sync::Mutex;
use uvm_storage_config::{Config, GuestOs, VpmemConfig};

use crate::files::HostFiles;
use crate::modify::{
    self, vpmem_device_resource_path, vpmem_mapping_resource_path,
    DeviceVerityInfo, GuestRequest, GuestResourceType, GuestSettings,
    HostSettings, LcowMappedVPMemDevice, ModifyError, ModifyRequest, Modifier,
    RequestType, VPMemMappingInfo, VerityReader, VirtualPMemDevice,
    VirtualPMemMapping, VPMEM_IMAGE_FORMAT,
};
use pool::{page_align, Region, RegionPool, PAGE_SIZE};

/// Guest path of the root filesystem when it is booted from VPMEM device 0.
pub const ROOT_FS_GUEST_PATH: &str = "/";

#[derive(Debug, Error)]
pub enum VpmemError {
    #[error("VPMEM is not supported for Windows guests")]
    Unsupported,

    #[error("no VPMEM devices are configured for this UVM")]
    NoDevices,

    #[error("no available VPMEM location")]
    NoAvailableLocation,

    #[error("{path} is {size} bytes, exceeding the VPMEM device size of {max}")]
    LayerTooLarge { path: String, size: u64, max: u64 },

    #[error("{0} is not attached")]
    NotAttached(String),

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Modify(#[from] ModifyError),
}

/// One VHD on a VPMEM device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpmemMapping {
    pub host_path: String,
    pub guest_path: String,
    pub offset: u64,
    pub size: u64,
    pub ref_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpmemDeviceInfo {
    pub number: u32,
    pub mappings: Vec<VpmemMapping>,
}

#[derive(Debug)]
struct SingleDevice {
    host_path: String,
    guest_path: String,
    size: u64,
    ref_count: u32,
}

#[derive(Debug)]
struct MultiDevice {
    pool: RegionPool,
    mappings: BTreeMap<String, VpmemMapping>,
}

impl MultiDevice {
    fn new(capacity: u64) -> Self {
        Self { pool: RegionPool::new(capacity), mappings: BTreeMap::new() }
    }
}

#[derive(Debug)]
enum Devices {
    Single(Vec<Option<SingleDevice>>),
    Multi(Vec<Option<MultiDevice>>),
}

/// VPMEM device allocator of one UVM.
pub struct VpmemManager {
    log: slog::Logger,
    guest_os: GuestOs,
    config: VpmemConfig,
    modifier: Arc<dyn Modifier>,
    files: Arc<dyn HostFiles>,
    verity: Option<Arc<dyn VerityReader>>,
    devices: Mutex<Devices>,
}

impl VpmemManager {
    pub fn new(
        log: &slog::Logger,
        config: &Config,
        modifier: Arc<dyn Modifier>,
        files: Arc<dyn HostFiles>,
    ) -> Self {
        let log = log.new(o!("component" => "vpmem"));
        let vpmem = config.vpmem.clone();
        let count = vpmem.devices as usize;
        let devices = if vpmem.multi_mapping {
            Devices::Multi((0..count).map(|_| None).collect())
        } else {
            Devices::Single((0..count).map(|_| None).collect())
        };
        info!(log, "VPMEM manager created";
            "devices" => vpmem.devices,
            "max_size_bytes" => vpmem.max_size_bytes,
            "multi_mapping" => vpmem.multi_mapping);
        Self {
            log,
            guest_os: config.guest_os,
            config: vpmem,
            modifier,
            files,
            verity: None,
            devices: Mutex::new(devices),
        }
    }

    pub fn with_verity_reader(mut self, reader: Arc<dyn VerityReader>) -> Self {
        self.verity = Some(reader);
        self
    }

    /// Record `host_path` as the root filesystem, which the UVM boots from
    /// VPMEM device 0.  The device is part of the UVM's initial configuration
    /// so no modify request is issued, and it is never shared.
    pub fn with_root_fs(
        mut self,
        host_path: impl Into<String>,
    ) -> Result<Self, VpmemError> {
        self.check_usable()?;
        let host_path = host_path.into();
        let capacity = self.config.max_size_bytes;
        match self.devices.get_mut() {
            Devices::Single(devices) => {
                devices[0] = Some(SingleDevice {
                    host_path: host_path.clone(),
                    guest_path: ROOT_FS_GUEST_PATH.to_string(),
                    size: capacity,
                    ref_count: 1,
                });
            }
            Devices::Multi(devices) => {
                // The root filesystem spans its whole device.
                let mut dev = MultiDevice::new(capacity);
                dev.pool
                    .allocate(dev.pool.capacity())
                    .map_err(|_| VpmemError::NoAvailableLocation)?;
                dev.mappings.insert(
                    host_path.clone(),
                    VpmemMapping {
                        host_path: host_path.clone(),
                        guest_path: ROOT_FS_GUEST_PATH.to_string(),
                        offset: 0,
                        size: capacity,
                        ref_count: 1,
                    },
                );
                devices[0] = Some(dev);
            }
        }
        debug!(self.log, "root filesystem on VPMEM device 0";
            "host_path" => host_path);
        Ok(self)
    }

    fn check_usable(&self) -> Result<(), VpmemError> {
        if self.guest_os == GuestOs::Windows {
            return Err(VpmemError::Unsupported);
        }
        if self.config.devices == 0 {
            return Err(VpmemError::NoDevices);
        }
        Ok(())
    }

    /// Expose `host_path` to the guest, returning where it is mounted.
    pub async fn add(&self, host_path: &str) -> Result<String, VpmemError> {
        self.check_usable()?;
        let mut devices = self.devices.lock().await;
        match &mut *devices {
            Devices::Single(devices) => {
                self.add_single(devices, host_path).await
            }
            Devices::Multi(devices) => {
                self.add_multi(devices, host_path).await
            }
        }
    }

    /// Drop a reference on `host_path`, removing it from the UVM when the
    /// last one goes away.
    pub async fn remove(&self, host_path: &str) -> Result<(), VpmemError> {
        self.check_usable()?;
        let mut devices = self.devices.lock().await;
        match &mut *devices {
            Devices::Single(devices) => {
                self.remove_single(devices, host_path).await
            }
            Devices::Multi(devices) => {
                self.remove_multi(devices, host_path).await
            }
        }
    }

    pub async fn guest_path(
        &self,
        host_path: &str,
    ) -> Result<String, VpmemError> {
        let devices = self.devices.lock().await;
        let found = match &*devices {
            Devices::Single(devices) => devices
                .iter()
                .flatten()
                .find(|d| d.host_path == host_path)
                .map(|d| d.guest_path.clone()),
            Devices::Multi(devices) => devices
                .iter()
                .flatten()
                .find_map(|d| d.mappings.get(host_path))
                .map(|m| m.guest_path.clone()),
        };
        found.ok_or_else(|| VpmemError::NotAttached(host_path.to_string()))
    }

    /// Contents of device `number`, if it is in use.
    pub async fn device(&self, number: u32) -> Option<VpmemDeviceInfo> {
        let devices = self.devices.lock().await;
        let mappings = match &*devices {
            Devices::Single(devices) => {
                let d = devices.get(number as usize)?.as_ref()?;
                vec![VpmemMapping {
                    host_path: d.host_path.clone(),
                    guest_path: d.guest_path.clone(),
                    offset: 0,
                    size: d.size,
                    ref_count: d.ref_count,
                }]
            }
            Devices::Multi(devices) => {
                let d = devices.get(number as usize)?.as_ref()?;
                let mut mappings: Vec<_> =
                    d.mappings.values().cloned().collect();
                mappings.sort_by_key(|m| m.offset);
                mappings
            }
        };
        Some(VpmemDeviceInfo { number, mappings })
    }

    async fn file_size(&self, host_path: &str) -> Result<u64, VpmemError> {
        self.files.size(Path::new(host_path)).await.map_err(|source| {
            VpmemError::Stat { path: host_path.to_string(), source }
        })
    }

    fn read_verity(&self, host_path: &str) -> Option<DeviceVerityInfo> {
        let reader = self.verity.as_ref()?;
        match reader.read_verity(Path::new(host_path)) {
            Ok(info) => info,
            Err(err) => {
                debug!(self.log, "unable to read dm-verity information";
                    "host_path" => host_path,
                    "error" => %err);
                None
            }
        }
    }

    fn guest_request(
        request_type: RequestType,
        device_number: u32,
        mount_path: &str,
        mapping_info: Option<VPMemMappingInfo>,
        verity_info: Option<DeviceVerityInfo>,
    ) -> GuestRequest {
        GuestRequest {
            resource_type: GuestResourceType::VPMemDevice,
            request_type,
            settings: GuestSettings::LcowMappedVPMemDevice(
                LcowMappedVPMemDevice {
                    device_number,
                    mount_path: mount_path.to_string(),
                    mapping_info,
                    verity_info,
                },
            ),
        }
    }

    async fn add_single(
        &self,
        devices: &mut [Option<SingleDevice>],
        host_path: &str,
    ) -> Result<String, VpmemError> {
        if let Some(dev) =
            devices.iter_mut().flatten().find(|d| d.host_path == host_path)
        {
            dev.ref_count += 1;
            return Ok(dev.guest_path.clone());
        }

        let size = self.file_size(host_path).await?;
        let max = self.config.max_size_bytes;
        if size > max {
            return Err(VpmemError::LayerTooLarge {
                path: host_path.to_string(),
                size,
                max,
            });
        }
        let n = devices
            .iter()
            .position(Option::is_none)
            .ok_or(VpmemError::NoAvailableLocation)?;
        let number = n as u32;
        let guest_path = format!("/run/layers/p{number}");

        let request = ModifyRequest {
            request_type: RequestType::Add,
            resource_path: Some(vpmem_device_resource_path(number)),
            settings: Some(HostSettings::VirtualPMemDevice(VirtualPMemDevice {
                host_path: host_path.to_string(),
                read_only: true,
                image_format: VPMEM_IMAGE_FORMAT,
            })),
            guest_request: Some(Self::guest_request(
                RequestType::Add,
                number,
                &guest_path,
                None,
                self.read_verity(host_path),
            )),
        };
        modify::submit(self.modifier.as_ref(), &self.log, request).await?;

        devices[n] = Some(SingleDevice {
            host_path: host_path.to_string(),
            guest_path: guest_path.clone(),
            size,
            ref_count: 1,
        });
        debug!(self.log, "added VPMEM device";
            "host_path" => host_path,
            "device" => number,
            "guest_path" => &guest_path);
        Ok(guest_path)
    }

    async fn remove_single(
        &self,
        devices: &mut [Option<SingleDevice>],
        host_path: &str,
    ) -> Result<(), VpmemError> {
        let n = devices
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.host_path == host_path))
            .ok_or_else(|| VpmemError::NotAttached(host_path.to_string()))?;
        let Some(dev) = devices[n].as_mut() else {
            return Err(VpmemError::NotAttached(host_path.to_string()));
        };
        if dev.ref_count > 1 {
            dev.ref_count -= 1;
            return Ok(());
        }

        let number = n as u32;
        let request = ModifyRequest {
            request_type: RequestType::Remove,
            resource_path: Some(vpmem_device_resource_path(number)),
            settings: None,
            guest_request: Some(Self::guest_request(
                RequestType::Remove,
                number,
                &dev.guest_path,
                None,
                None,
            )),
        };
        modify::submit(self.modifier.as_ref(), &self.log, request).await?;

        devices[n] = None;
        debug!(self.log, "removed VPMEM device";
            "host_path" => host_path,
            "device" => number);
        Ok(())
    }

    /// Find a device with room for `len` more bytes, preferring devices
    /// already in use.  Returns the device index, the region reserved on it
    /// and whether the device was empty.
    fn place(
        &self,
        devices: &mut [Option<MultiDevice>],
        len: u64,
    ) -> Option<(usize, Region, bool)> {
        let max_mappings = self.config.max_mappings_per_device as usize;
        for (n, slot) in devices.iter_mut().enumerate() {
            match slot {
                Some(dev) if dev.mappings.len() < max_mappings => {
                    if let Ok(region) = dev.pool.allocate(len) {
                        return Some((n, region, false));
                    }
                }
                Some(_) => {}
                None => {
                    let mut dev = MultiDevice::new(self.config.max_size_bytes);
                    let region = dev.pool.allocate(len).ok()?;
                    *slot = Some(dev);
                    return Some((n, region, true));
                }
            }
        }
        None
    }

    async fn add_multi(
        &self,
        devices: &mut [Option<MultiDevice>],
        host_path: &str,
    ) -> Result<String, VpmemError> {
        if let Some(m) = devices
            .iter_mut()
            .flatten()
            .find_map(|d| d.mappings.get_mut(host_path))
        {
            m.ref_count += 1;
            return Ok(m.guest_path.clone());
        }

        let size = self.file_size(host_path).await?;
        let max = self.config.max_size_bytes;
        let len = page_align(size)
            .map(|len| len.max(PAGE_SIZE))
            .filter(|len| *len <= max)
            .ok_or_else(|| VpmemError::LayerTooLarge {
                path: host_path.to_string(),
                size,
                max,
            })?;
        let (n, region, fresh) =
            self.place(devices, len).ok_or(VpmemError::NoAvailableLocation)?;
        let number = n as u32;
        let guest_path =
            format!("/run/layers/p{number}-{}-{}", region.offset, region.len);

        // The first VHD on a device is added as the device itself.
        let (resource_path, settings) = if fresh {
            (
                vpmem_device_resource_path(number),
                HostSettings::VirtualPMemDevice(VirtualPMemDevice {
                    host_path: host_path.to_string(),
                    read_only: true,
                    image_format: VPMEM_IMAGE_FORMAT,
                }),
            )
        } else {
            (
                vpmem_mapping_resource_path(number, region.offset),
                HostSettings::VirtualPMemMapping(VirtualPMemMapping {
                    host_path: host_path.to_string(),
                    image_format: VPMEM_IMAGE_FORMAT,
                }),
            )
        };
        let request = ModifyRequest {
            request_type: RequestType::Add,
            resource_path: Some(resource_path),
            settings: Some(settings),
            guest_request: Some(Self::guest_request(
                RequestType::Add,
                number,
                &guest_path,
                Some(VPMemMappingInfo {
                    device_offset_in_bytes: region.offset,
                    device_size_in_bytes: region.len,
                }),
                self.read_verity(host_path),
            )),
        };

        if let Err(err) =
            modify::submit(self.modifier.as_ref(), &self.log, request).await
        {
            if fresh {
                devices[n] = None;
            } else if let Some(dev) = devices[n].as_mut() {
                if let Err(e) = dev.pool.release(region.offset) {
                    debug!(self.log, "failed to release VPMEM region";
                        "device" => number,
                        "offset" => region.offset,
                        "error" => %e);
                }
            }
            return Err(err.into());
        }

        if let Some(dev) = devices[n].as_mut() {
            dev.mappings.insert(
                host_path.to_string(),
                VpmemMapping {
                    host_path: host_path.to_string(),
                    guest_path: guest_path.clone(),
                    offset: region.offset,
                    size: region.len,
                    ref_count: 1,
                },
            );
        }
        debug!(self.log, "mapped VHD onto VPMEM device";
            "host_path" => host_path,
            "device" => number,
            "offset" => region.offset,
            "size" => region.len,
            "guest_path" => &guest_path);
        Ok(guest_path)
    }

    async fn remove_multi(
        &self,
        devices: &mut [Option<MultiDevice>],
        host_path: &str,
    ) -> Result<(), VpmemError> {
        let not_attached = || VpmemError::NotAttached(host_path.to_string());
        let n = devices
            .iter()
            .position(|d| {
                d.as_ref().is_some_and(|d| d.mappings.contains_key(host_path))
            })
            .ok_or_else(not_attached)?;
        let dev = devices[n].as_mut().ok_or_else(not_attached)?;
        let mapping = dev.mappings.get_mut(host_path).ok_or_else(not_attached)?;
        if mapping.ref_count > 1 {
            mapping.ref_count -= 1;
            return Ok(());
        }

        let number = n as u32;
        let request = ModifyRequest {
            request_type: RequestType::Remove,
            resource_path: Some(vpmem_mapping_resource_path(
                number,
                mapping.offset,
            )),
            settings: None,
            guest_request: Some(Self::guest_request(
                RequestType::Remove,
                number,
                &mapping.guest_path,
                Some(VPMemMappingInfo {
                    device_offset_in_bytes: mapping.offset,
                    device_size_in_bytes: mapping.size,
                }),
                None,
            )),
        };
        modify::submit(self.modifier.as_ref(), &self.log, request).await?;

        if let Some(mapping) = dev.mappings.remove(host_path) {
            if let Err(e) = dev.pool.release(mapping.offset) {
                debug!(self.log, "failed to release VPMEM region";
                    "device" => number,
                    "offset" => mapping.offset,
                    "error" => %e);
            }
        }
        debug!(self.log, "unmapped VHD from VPMEM device";
            "host_path" => host_path,
            "device" => number,
            "remaining" => dev.mappings.len());
        if dev.mappings.is_empty() {
            devices[n] = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFiles;
    use crate::test_util::{test_logger, RecordingModifier};

    struct Fixture {
        dir: tempfile::TempDir,
        modifier: Arc<RecordingModifier>,
        mgr: VpmemManager,
    }

    fn fixture(devices: u32, multi_mapping: bool) -> Fixture {
        let config = Config {
            vpmem: VpmemConfig {
                devices,
                max_size_bytes: 0x4000,
                multi_mapping,
                max_mappings_per_device: 3,
            },
            ..Default::default()
        };
        let modifier = Arc::new(RecordingModifier::default());
        let mgr = VpmemManager::new(
            &test_logger(),
            &config,
            modifier.clone(),
            Arc::new(LocalFiles),
        );
        Fixture { dir: tempfile::tempdir().unwrap(), modifier, mgr }
    }

    impl Fixture {
        /// Create a sparse file of `len` bytes, returning its path.
        fn vhd(&self, name: &str, len: u64) -> String {
            let path = self.dir.path().join(name);
            std::fs::File::create(&path).unwrap().set_len(len).unwrap();
            path.to_str().unwrap().to_string()
        }
    }

    fn mount_path(req: &ModifyRequest) -> &LcowMappedVPMemDevice {
        match &req.guest_request.as_ref().unwrap().settings {
            GuestSettings::LcowMappedVPMemDevice(s) => s,
            other => panic!("unexpected guest settings {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_add_is_refcounted() {
        let fx = fixture(2, false);
        let a = fx.vhd("a.vhd", 0x1000);

        assert_eq!(fx.mgr.add(&a).await.unwrap(), "/run/layers/p0");
        assert_eq!(fx.mgr.add(&a).await.unwrap(), "/run/layers/p0");
        assert_eq!(fx.modifier.count(), 1);
        assert_eq!(fx.mgr.device(0).await.unwrap().mappings[0].ref_count, 2);

        fx.mgr.remove(&a).await.unwrap();
        assert_eq!(fx.modifier.count(), 1);
        fx.mgr.remove(&a).await.unwrap();
        assert!(fx.mgr.device(0).await.is_none());
        assert!(matches!(
            fx.mgr.remove(&a).await,
            Err(VpmemError::NotAttached(_))
        ));

        let reqs = fx.modifier.requests();
        assert_eq!(reqs[0].resource_path, Some(vpmem_device_resource_path(0)));
        assert_eq!(
            reqs[0].settings,
            Some(HostSettings::VirtualPMemDevice(VirtualPMemDevice {
                host_path: a.clone(),
                read_only: true,
                image_format: "Vhd1",
            }))
        );
        assert_eq!(mount_path(&reqs[0]).mount_path, "/run/layers/p0");
        assert_eq!(reqs[1].request_type, RequestType::Remove);
        assert_eq!(mount_path(&reqs[1]).device_number, 0);
    }

    #[tokio::test]
    async fn single_slots_exhaust() {
        let fx = fixture(2, false);
        for (i, name) in ["a", "b"].iter().enumerate() {
            let path = fx.vhd(name, 0x1000);
            let guest_path = fx.mgr.add(&path).await.unwrap();
            assert_eq!(guest_path, format!("/run/layers/p{i}"));
        }
        let c = fx.vhd("c", 0x1000);
        assert!(matches!(
            fx.mgr.add(&c).await,
            Err(VpmemError::NoAvailableLocation)
        ));
        assert!(matches!(
            fx.mgr.guest_path(&c).await,
            Err(VpmemError::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn oversized_layer_consumes_nothing() {
        for multi in [false, true] {
            let fx = fixture(2, multi);
            let big = fx.vhd("big.vhd", 0x4001);
            match fx.mgr.add(&big).await {
                Err(VpmemError::LayerTooLarge { size, max, .. }) => {
                    assert_eq!((size, max), (0x4001, 0x4000));
                }
                other => panic!("unexpected result {other:?}"),
            }
            assert!(fx.mgr.device(0).await.is_none());
            assert!(fx.mgr.device(1).await.is_none());
            assert_eq!(fx.modifier.count(), 0);
        }
    }

    #[tokio::test]
    async fn missing_file() {
        let fx = fixture(1, true);
        let missing = fx.dir.path().join("nope.vhd");
        assert!(matches!(
            fx.mgr.add(missing.to_str().unwrap()).await,
            Err(VpmemError::Stat { .. })
        ));
    }

    #[tokio::test]
    async fn multi_mapping_packs_devices() {
        let fx = fixture(2, true);
        let a = fx.vhd("a.vhd", 0x1800);
        let b = fx.vhd("b.vhd", 0x1000);
        let c = fx.vhd("c.vhd", 0x2000);

        assert_eq!(fx.mgr.add(&a).await.unwrap(), "/run/layers/p0-0-8192");
        assert_eq!(fx.mgr.add(&b).await.unwrap(), "/run/layers/p0-8192-4096");
        // Only one page left on device 0.
        assert_eq!(fx.mgr.add(&c).await.unwrap(), "/run/layers/p1-0-8192");

        let reqs = fx.modifier.requests();
        assert_eq!(reqs[0].resource_path, Some(vpmem_device_resource_path(0)));
        assert!(matches!(
            reqs[0].settings,
            Some(HostSettings::VirtualPMemDevice(_))
        ));
        assert_eq!(
            reqs[1].resource_path,
            Some(vpmem_mapping_resource_path(0, 0x2000))
        );
        assert!(matches!(
            reqs[1].settings,
            Some(HostSettings::VirtualPMemMapping(_))
        ));
        assert_eq!(
            mount_path(&reqs[1]).mapping_info,
            Some(VPMemMappingInfo {
                device_offset_in_bytes: 0x2000,
                device_size_in_bytes: 0x1000
            })
        );
        assert_eq!(reqs[2].resource_path, Some(vpmem_device_resource_path(1)));

        // The hole left by `a` is reused.
        fx.mgr.remove(&a).await.unwrap();
        let reqs = fx.modifier.requests();
        assert_eq!(
            reqs[3].resource_path,
            Some(vpmem_mapping_resource_path(0, 0))
        );
        let d = fx.vhd("d.vhd", 0x100);
        assert_eq!(fx.mgr.add(&d).await.unwrap(), "/run/layers/p0-0-4096");

        // A device is released with its last mapping.
        fx.mgr.remove(&c).await.unwrap();
        assert!(fx.mgr.device(1).await.is_none());
        let dev0 = fx.mgr.device(0).await.unwrap();
        let hosts: Vec<_> =
            dev0.mappings.iter().map(|m| m.host_path.as_str()).collect();
        assert_eq!(hosts, vec![d.as_str(), b.as_str()]);
    }

    #[tokio::test]
    async fn mapping_count_limit() {
        let fx = fixture(2, true);
        for name in ["a", "b", "c"] {
            let path = fx.vhd(name, 0x1000);
            let guest_path = fx.mgr.add(&path).await.unwrap();
            assert!(guest_path.starts_with("/run/layers/p0-"));
        }
        let d = fx.vhd("d", 0x1000);
        assert_eq!(fx.mgr.add(&d).await.unwrap(), "/run/layers/p1-0-4096");
    }

    #[tokio::test]
    async fn failed_modify_releases_region() {
        let fx = fixture(1, true);
        let a = fx.vhd("a.vhd", 0x1000);
        let b = fx.vhd("b.vhd", 0x1000);
        fx.mgr.add(&a).await.unwrap();

        fx.modifier.set_failing(true);
        assert!(matches!(fx.mgr.add(&b).await, Err(VpmemError::Modify(_))));
        assert_eq!(fx.mgr.device(0).await.unwrap().mappings.len(), 1);

        // A failed removal keeps the mapping.
        assert!(matches!(fx.mgr.remove(&a).await, Err(VpmemError::Modify(_))));
        assert_eq!(
            fx.mgr.guest_path(&a).await.unwrap(),
            "/run/layers/p0-0-4096"
        );

        fx.modifier.set_failing(false);
        assert_eq!(fx.mgr.add(&b).await.unwrap(), "/run/layers/p0-4096-4096");
    }

    #[tokio::test]
    async fn failed_first_mapping_frees_device() {
        let fx = fixture(1, true);
        let a = fx.vhd("a.vhd", 0x1000);
        fx.modifier.set_failing(true);
        assert!(fx.mgr.add(&a).await.is_err());
        assert!(fx.mgr.device(0).await.is_none());
    }

    #[tokio::test]
    async fn root_fs_occupies_device_zero() {
        for multi in [false, true] {
            let fx = fixture(2, multi);
            let mgr = fx.mgr.with_root_fs("/boot/rootfs.vhd").unwrap();
            assert_eq!(
                mgr.guest_path("/boot/rootfs.vhd").await.unwrap(),
                ROOT_FS_GUEST_PATH
            );
            let layer = {
                let path = fx.dir.path().join("layer.vhd");
                std::fs::File::create(&path).unwrap().set_len(0x1000).unwrap();
                path.to_str().unwrap().to_string()
            };
            let guest = mgr.add(&layer).await.unwrap();
            assert!(guest.starts_with("/run/layers/p1"), "{guest}");
            assert_eq!(fx.modifier.count(), 1);
        }
    }

    #[tokio::test]
    async fn unusable_configurations() {
        let fx = fixture(0, true);
        assert!(matches!(fx.mgr.add("/x").await, Err(VpmemError::NoDevices)));

        let windows =
            Config { guest_os: GuestOs::Windows, ..Default::default() };
        let mgr = VpmemManager::new(
            &test_logger(),
            &windows,
            Arc::new(RecordingModifier::default()),
            Arc::new(LocalFiles),
        );
        assert!(matches!(mgr.add("/x").await, Err(VpmemError::Unsupported)));
        assert!(matches!(
            mgr.with_root_fs("/boot/rootfs.vhd"),
            Err(VpmemError::Unsupported)
        ));
    }
}
