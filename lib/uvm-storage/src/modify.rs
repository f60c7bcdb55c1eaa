// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests submitted to the hypervisor (and, nested within them, to the guest
//! agent) to change the storage configuration of a running UVM.
//!
//! The storage managers never talk to the hypervisor themselves.  They build a
//! [ModifyRequest] and hand it to a [Modifier], which is expected to marshal it
//! (the types here serialize to the hypervisor's JSON schema) and submit it.

use std::path::Path;
use std::sync::Arc;

use serde_derive::Serialize;
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;

/// Well-known instance IDs of the synthetic SCSI controllers, indexed by
/// controller number.
pub const SCSI_CONTROLLER_GUIDS: [&str; 4] = [
    "df6d0690-79e5-55b6-a5ec-c1e2f77f580a",
    "0110f83b-de10-5172-a266-78bca56bf50a",
    "b5d2d8d4-3a75-51bf-945b-3444dc6b8579",
    "305891a9-b251-5dfe-91a2-c25d9212275b",
];

/// Image format reported for VHDs exposed over VPMEM.
pub const VPMEM_IMAGE_FORMAT: &str = "Vhd1";

pub fn scsi_resource_path(controller: u32, lun: u32) -> String {
    format!(
        "VirtualMachine/Devices/Scsi/{}/Attachments/{}",
        SCSI_CONTROLLER_GUIDS[controller as usize], lun
    )
}

pub fn vpmem_device_resource_path(device: u32) -> String {
    format!("VirtualMachine/Devices/VirtualPMem/Devices/{device}")
}

pub fn vpmem_mapping_resource_path(device: u32, offset: u64) -> String {
    format!(
        "VirtualMachine/Devices/VirtualPMem/Devices/{device}/Mappings/{offset}"
    )
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RequestType {
    Add,
    Remove,
}

/// How a backing object is presented on the SCSI bus.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    IntoStaticStr,
    EnumString,
)]
pub enum AttachmentKind {
    /// A VHD/VHDX file on the host.
    VirtualDisk,
    /// A physical disk passed through from the host.
    PassThru,
    /// A non-file disk provided by a host driver, addressed by a typed path.
    ExtensibleVirtualDisk,
}
impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSettings {
    pub path: String,
    #[serde(rename = "Type")]
    pub kind: AttachmentKind,
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensible_virtual_disk_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemDevice {
    pub host_path: String,
    pub read_only: bool,
    pub image_format: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemMapping {
    pub host_path: String,
    pub image_format: &'static str,
}

/// Host-side portion of a request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostSettings {
    Attachment(AttachmentSettings),
    VirtualPMemDevice(VirtualPMemDevice),
    VirtualPMemMapping(VirtualPMemMapping),
}

/// dm-verity metadata of a read-only layer, passed to a Linux guest so that it
/// can verify the device as it is mounted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceVerityInfo {
    pub ext4_size_in_bytes: u64,
    pub block_size: u32,
    pub salt: String,
    pub root_digest: String,
    pub algorithm: String,
    pub superblock_size_in_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LcowMappedVirtualDisk {
    pub mount_path: String,
    pub lun: u8,
    pub controller: u8,
    pub partition: u64,
    pub read_only: bool,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verity_info: Option<DeviceVerityInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WcowMappedVirtualDisk {
    pub container_path: String,
    pub lun: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VPMemMappingInfo {
    pub device_offset_in_bytes: u64,
    pub device_size_in_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LcowMappedVPMemDevice {
    pub device_number: u32,
    pub mount_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_info: Option<VPMemMappingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verity_info: Option<DeviceVerityInfo>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum GuestResourceType {
    MappedVirtualDisk,
    VPMemDevice,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GuestSettings {
    LcowMappedVirtualDisk(LcowMappedVirtualDisk),
    WcowMappedVirtualDisk(WcowMappedVirtualDisk),
    LcowMappedVPMemDevice(LcowMappedVPMemDevice),
}

/// Request forwarded to the guest agent describing how the guest should expose
/// (or eject) a device.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestRequest {
    pub resource_type: GuestResourceType,
    pub request_type: RequestType,
    pub settings: GuestSettings,
}

/// A single configuration change to a running UVM.
///
/// Requests which only affect the guest (such as mounting a second guest path
/// of an already attached disk) carry neither `resource_path` nor `settings`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRequest {
    pub request_type: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<HostSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_request: Option<GuestRequest>,
}
impl ModifyRequest {
    /// A request which only carries a nested guest request.
    pub fn guest_only(guest: GuestRequest) -> Self {
        Self {
            request_type: guest.request_type,
            resource_path: None,
            settings: None,
            guest_request: Some(guest),
        }
    }

    /// Describe the resource this request targets, for error context.
    pub fn resource(&self) -> String {
        match (&self.resource_path, &self.guest_request) {
            (Some(path), _) => path.clone(),
            (None, Some(guest)) => match &guest.settings {
                GuestSettings::LcowMappedVirtualDisk(s) => {
                    format!("guest mount {}", s.mount_path)
                }
                GuestSettings::WcowMappedVirtualDisk(s) => {
                    format!("guest mount {}", s.container_path)
                }
                GuestSettings::LcowMappedVPMemDevice(s) => {
                    format!("guest mount {}", s.mount_path)
                }
            },
            (None, None) => String::from("<empty>"),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Submits configuration changes to a running UVM.
///
/// Implementations are expected to apply their own deadline; the storage
/// managers impose none and propagate whatever error is returned.
#[async_trait::async_trait]
pub trait Modifier: Send + Sync + 'static {
    async fn modify(&self, request: ModifyRequest) -> anyhow::Result<()>;
}

/// Reads dm-verity metadata from a read-only layer VHD, if it carries any.
pub trait VerityReader: Send + Sync + 'static {
    fn read_verity(
        &self,
        host_path: &Path,
    ) -> anyhow::Result<Option<DeviceVerityInfo>>;
}

/// An error which may be observed by several callers at once.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn share(err: anyhow::Error) -> SharedError {
    Arc::from(Box::<dyn std::error::Error + Send + Sync + 'static>::from(err))
}

/// Failure of a [Modifier::modify] call, annotated with the resource it
/// targeted.
#[derive(Clone, Debug, Error)]
#[error("failed to modify UVM resource {resource}: {source}")]
pub struct ModifyError {
    pub resource: String,
    #[source]
    pub source: SharedError,
}
impl ModifyError {
    pub fn new(request: &ModifyRequest, err: anyhow::Error) -> Self {
        Self { resource: request.resource(), source: share(err) }
    }
}

/// Submit `request`, wrapping any failure with the targeted resource.
pub(crate) async fn submit(
    modifier: &dyn Modifier,
    log: &slog::Logger,
    request: ModifyRequest,
) -> Result<(), ModifyError> {
    if let Ok(json) = request.to_json() {
        slog::trace!(log, "submitting modify request"; "request" => json);
    }
    let resource = request.resource();
    modifier
        .modify(request)
        .await
        .map_err(|err| ModifyError { resource, source: share(err) })
}
