// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCSI attachments of a utility VM.
//!
//! A [ScsiManager] owns the controller/LUN table of one UVM.  Each host path
//! occupies at most one slot (an [Attachment]), which in turn may be exposed
//! at one or more guest paths (its [Mount]s).  Attach and detach are
//! reference counted: repeated attaches of a resource share the slot, and the
//! slot is released when the last reference is dropped.
//!
//! Concurrent attaches of the same resource are collapsed.  The caller which
//! creates a mount issues the modify request; anyone arriving while it is in
//! flight waits for its outcome and shares it.  The table lock is never held
//! across an attach modify.  Detach holds it for its entirety.

mod mount;
mod table;

pub use mount::{Mount, MountRegistry};
pub use table::{Attachment, AttachmentTable};

use std::path::Path;
use std::sync::Arc;

use slog::{debug, info, o, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use uvm_storage_config::{Config, GuestOs};

use crate::access::{self, AccessError, AccessGranter, VmAccess};
use crate::codec::AttachmentRecord;
use crate::evd::{EvdPath, EvdPathError};
use crate::inflight::{self, Abandoned, Completer, Completion};
use crate::modify::{
    self, scsi_resource_path, AttachmentKind, AttachmentSettings,
    DeviceVerityInfo, GuestRequest, GuestResourceType, GuestSettings,
    HostSettings, LcowMappedVirtualDisk, ModifyError, ModifyRequest, Modifier,
    RequestType, VerityReader, WcowMappedVirtualDisk,
};
use mount::MountSlot;
use table::NewAttachment;

#[derive(Clone, Debug, Error)]
pub enum ScsiError {
    #[error("no SCSI controllers are configured for this UVM")]
    NoScsiControllers,

    #[error("no available SCSI location")]
    NoAvailableLocation,

    #[error(
        "too many SCSI attachments: {controller}:{lun} requires multiple \
         controller support"
    )]
    TooManyAttachments { controller: u32, lun: u32 },

    #[error("{0} is not attached")]
    NotAttached(String),

    #[error("guest path {guest_path} is already in use by {host_path}")]
    GuestPathInUse { guest_path: String, host_path: String },

    #[error("attach of {0} is still in progress")]
    AttachInProgress(String),

    #[error("extensible virtual disk {0} requires a guest path")]
    MissingGuestPath(String),

    #[error("SCSI location {controller}:{lun} is not available")]
    SlotUnavailable { controller: u32, lun: u32 },

    #[error("{0} is already attached")]
    AlreadyAttached(String),

    #[error(transparent)]
    InvalidEvdPath(#[from] EvdPathError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Modify(#[from] ModifyError),

    #[error("attach was abandoned before it completed")]
    Abandoned,
}

impl From<Abandoned> for ScsiError {
    fn from(_: Abandoned) -> Self {
        ScsiError::Abandoned
    }
}

/// Parameters of an attach request.
#[derive(Clone, Debug, Default)]
pub struct ScsiAttach {
    pub host_path: String,
    /// Where the guest should mount the disk.  Empty to attach it without
    /// mounting.
    pub guest_path: String,
    pub read_only: bool,
    pub encrypted: bool,
    /// The disk is a container image layer, eligible for sharing between
    /// guest mounts when read-only.
    pub is_layer: bool,
    pub partition: u64,
    /// Mount options passed to a Linux guest.
    pub options: Vec<String>,
    pub access: VmAccess,
}

impl ScsiAttach {
    pub fn new(
        host_path: impl Into<String>,
        guest_path: impl Into<String>,
    ) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            ..Default::default()
        }
    }

    /// A read-only container layer.
    pub fn layer(
        host_path: impl Into<String>,
        guest_path: impl Into<String>,
    ) -> Self {
        Self {
            read_only: true,
            is_layer: true,
            ..Self::new(host_path, guest_path)
        }
    }
}

/// Where an attach landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiMount {
    pub host_path: String,
    pub guest_path: String,
    pub controller: u32,
    pub lun: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    pub guest_path: String,
    pub partition: u64,
    pub ref_count: u32,
    pub pending: bool,
}

/// Read-only copy of an [Attachment].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub host_path: String,
    pub controller: u32,
    pub lun: u32,
    pub kind: AttachmentKind,
    pub evd_type: Option<String>,
    pub read_only: bool,
    pub encrypted: bool,
    pub is_layer: bool,
    pub ref_count: u32,
    pub mounts: Vec<MountInfo>,
}

impl From<&Attachment> for AttachmentInfo {
    fn from(att: &Attachment) -> Self {
        Self {
            host_path: att.host_path.clone(),
            controller: att.controller,
            lun: att.lun,
            kind: att.kind,
            evd_type: att.evd_type.clone(),
            read_only: att.read_only,
            encrypted: att.encrypted,
            is_layer: att.is_layer,
            ref_count: att.ref_count,
            mounts: att
                .mounts
                .iter()
                .map(|m| MountInfo {
                    guest_path: m.guest_path.clone(),
                    partition: m.partition,
                    ref_count: m.ref_count,
                    pending: m.attached.is_pending(),
                })
                .collect(),
        }
    }
}

/// The guest-facing half of a mount, used to shape guest requests.
struct GuestMount<'a> {
    guest_path: &'a str,
    controller: u32,
    lun: u32,
    partition: u64,
    read_only: bool,
    encrypted: bool,
    options: &'a [String],
}

enum Reservation {
    /// Another caller is attaching this mount.
    Waiter { done: Completion<ScsiError>, mount: ScsiMount },
    /// This caller must issue the modify request.
    Originator {
        pending: PendingAttach,
        attachment_ready: Option<Completion<ScsiError>>,
        mount: ScsiMount,
    },
}

/// An attach whose outcome has not yet been published.
///
/// Dropping it unresolved (e.g. because the attaching future was cancelled)
/// resolves waiters with [ScsiError::Abandoned] and unwinds the registration.
struct PendingAttach {
    table: Arc<Mutex<AttachmentTable>>,
    log: slog::Logger,
    host_path: String,
    generation: u64,
    mount_key: String,
    new_attachment: bool,
    completer: Option<Completer<ScsiError>>,
}

impl PendingAttach {
    fn succeed(mut self) {
        if let Some(completer) = self.completer.take() {
            completer.complete(Ok(()));
        }
    }

    async fn fail(mut self, err: ScsiError) {
        let mut table = self.table.lock().await;
        self.rollback(&mut table);
        if let Some(completer) = self.completer.take() {
            completer.complete(Err(err));
        }
    }

    /// Undo this caller's registration.  A new attachment is removed along
    /// with every mount hanging off it, since none of them can be valid
    /// without it.
    fn rollback(&self, table: &mut AttachmentTable) {
        let Some(att) = table
            .find_mut(&self.host_path)
            .filter(|att| att.generation == self.generation)
        else {
            return;
        };

        if !self.new_attachment {
            if let Some(mount) = att.mounts.remove(&self.mount_key) {
                att.ref_count = att.ref_count.saturating_sub(mount.ref_count);
            }
            if att.ref_count > 0 {
                debug!(self.log, "rolled back mount";
                    "host_path" => &self.host_path,
                    "guest_path" => &self.mount_key);
                return;
            }
        }

        let (controller, lun) = (att.controller, att.lun);
        table.deallocate(controller, lun);
        debug!(self.log, "released SCSI slot after failed attach";
            "host_path" => &self.host_path,
            "controller" => controller,
            "lun" => lun);
    }
}

impl Drop for PendingAttach {
    fn drop(&mut self) {
        let Some(completer) = self.completer.take() else {
            return;
        };
        warn!(self.log, "attach abandoned while in flight";
            "host_path" => &self.host_path);
        completer.complete(Err(ScsiError::Abandoned));

        if let Ok(mut table) = self.table.try_lock() {
            self.rollback(&mut table);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pending = PendingAttach {
            table: self.table.clone(),
            log: self.log.clone(),
            host_path: std::mem::take(&mut self.host_path),
            generation: self.generation,
            mount_key: std::mem::take(&mut self.mount_key),
            new_attachment: self.new_attachment,
            completer: None,
        };
        handle.spawn(async move {
            let mut table = pending.table.lock().await;
            pending.rollback(&mut table);
        });
    }
}

/// SCSI controller/LUN allocator of one UVM.
pub struct ScsiManager {
    log: slog::Logger,
    vm_id: String,
    guest_os: GuestOs,
    multi_mount: bool,
    modifier: Arc<dyn Modifier>,
    granter: Arc<dyn AccessGranter>,
    verity: Option<Arc<dyn VerityReader>>,
    table: Arc<Mutex<AttachmentTable>>,
}

impl ScsiManager {
    pub fn new(
        log: &slog::Logger,
        vm_id: impl Into<String>,
        config: &Config,
        modifier: Arc<dyn Modifier>,
        granter: Arc<dyn AccessGranter>,
    ) -> Self {
        let vm_id = vm_id.into();
        let log = log.new(o!("component" => "scsi", "vm_id" => vm_id.clone()));
        let scsi = &config.scsi;
        let table = AttachmentTable::new(
            scsi.controllers,
            scsi.luns_per_controller,
            scsi.multi_controller,
            &scsi.reserved,
        );
        info!(log, "SCSI manager created";
            "controllers" => scsi.controllers,
            "luns_per_controller" => scsi.luns_per_controller,
            "reserved" => scsi.reserved.len(),
            "multi_mount" => config.multi_mount());
        Self {
            log,
            vm_id,
            guest_os: config.guest_os,
            multi_mount: config.multi_mount(),
            modifier,
            granter,
            verity: None,
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Attach dm-verity metadata to guest requests for read-only disks.
    pub fn with_verity_reader(mut self, reader: Arc<dyn VerityReader>) -> Self {
        self.verity = Some(reader);
        self
    }

    /// ID of the UVM, as used for access grants.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Attach a VHD/VHDX file.
    pub async fn attach_virtual_disk(
        &self,
        req: ScsiAttach,
    ) -> Result<ScsiMount, ScsiError> {
        self.attach(AttachmentKind::VirtualDisk, None, req).await
    }

    /// Pass a physical disk of the host through to the UVM.  Access is
    /// always granted to this VM individually.
    pub async fn attach_physical_disk(
        &self,
        req: ScsiAttach,
    ) -> Result<ScsiMount, ScsiError> {
        let req = ScsiAttach { access: VmAccess::Individual, ..req };
        self.attach(AttachmentKind::PassThru, None, req).await
    }

    /// Attach an extensible virtual disk, addressed as
    /// `evd://<type>/<mount-path>`.  These must be mounted in the guest, and
    /// need no access grant.
    pub async fn attach_extensible_disk(
        &self,
        req: ScsiAttach,
    ) -> Result<ScsiMount, ScsiError> {
        let evd = EvdPath::parse(&req.host_path)?;
        if req.guest_path.is_empty() {
            return Err(ScsiError::MissingGuestPath(req.host_path));
        }
        self.attach(AttachmentKind::ExtensibleVirtualDisk, Some(evd), req).await
    }

    async fn attach(
        &self,
        kind: AttachmentKind,
        evd: Option<EvdPath>,
        req: ScsiAttach,
    ) -> Result<ScsiMount, ScsiError> {
        if self.table.lock().await.controllers() == 0 {
            return Err(ScsiError::NoScsiControllers);
        }
        if evd.is_none() {
            access::grant(
                self.granter.as_ref(),
                &self.vm_id,
                Path::new(&req.host_path),
                req.access,
            )
            .await?;
        }

        match self.reserve(kind, evd.as_ref(), &req).await? {
            Reservation::Waiter { done, mount } => {
                debug!(self.log, "waiting on in-flight attach";
                    "host_path" => &mount.host_path,
                    "guest_path" => &mount.guest_path);
                done.wait().await?;
                Ok(mount)
            }
            Reservation::Originator { pending, attachment_ready, mount } => {
                if let Some(ready) = attachment_ready {
                    if let Err(err) = ready.wait().await {
                        pending.fail(err.clone()).await;
                        return Err(err);
                    }
                }

                let request = self.add_request(
                    kind,
                    evd.as_ref(),
                    &req,
                    &mount,
                    pending.new_attachment,
                );
                if let Some(request) = request {
                    if let Err(err) = modify::submit(
                        self.modifier.as_ref(),
                        &self.log,
                        request,
                    )
                    .await
                    {
                        let err = ScsiError::from(err);
                        warn!(self.log, "attach failed, rolling back";
                            "host_path" => &mount.host_path,
                            "guest_path" => &mount.guest_path,
                            "error" => %err);
                        pending.fail(err.clone()).await;
                        return Err(err);
                    }
                }
                pending.succeed();
                debug!(self.log, "attached";
                    "host_path" => &mount.host_path,
                    "guest_path" => &mount.guest_path,
                    "controller" => mount.controller,
                    "lun" => mount.lun);
                Ok(mount)
            }
        }
    }

    /// Take references on the attachment and mount for `req`, creating them
    /// as needed.  No modify request is issued here.
    async fn reserve(
        &self,
        kind: AttachmentKind,
        evd: Option<&EvdPath>,
        req: &ScsiAttach,
    ) -> Result<Reservation, ScsiError> {
        let new = NewAttachment {
            host_path: req.host_path.clone(),
            kind,
            evd_type: evd.map(|e| e.evd_type.clone()),
            read_only: req.read_only,
            encrypted: req.encrypted,
            is_layer: req.is_layer,
            allow_multiple_mounts: self.multi_mount
                && req.read_only
                && req.is_layer,
        };
        let (completer, completion) = inflight::pair();

        let mut table = self.table.lock().await;
        if !req.guest_path.is_empty() {
            if let Some(owner) =
                table.guest_path_owner(&req.host_path, &req.guest_path)
            {
                return Err(ScsiError::GuestPathInUse {
                    guest_path: req.guest_path.clone(),
                    host_path: owner.to_string(),
                });
            }
        }

        let (att, existed) = table.allocate_or_find(new, &completion)?;
        let (mount_key, slot) = att.mounts.allocate_or_find(
            &req.guest_path,
            req.partition,
            &req.options,
            &completion,
        );
        let mount = ScsiMount {
            host_path: att.host_path.clone(),
            guest_path: mount_key.clone(),
            controller: att.controller,
            lun: att.lun,
        };
        debug!(self.log, "reserved SCSI mount";
            "host_path" => &mount.host_path,
            "guest_path" => &mount.guest_path,
            "controller" => mount.controller,
            "lun" => mount.lun,
            "new_attachment" => !existed,
            "ref_count" => att.ref_count);

        Ok(match slot {
            MountSlot::Existing(done) => Reservation::Waiter { done, mount },
            MountSlot::Created => Reservation::Originator {
                attachment_ready: existed.then(|| att.attached.clone()),
                pending: PendingAttach {
                    table: self.table.clone(),
                    log: self.log.clone(),
                    host_path: att.host_path.clone(),
                    generation: att.generation,
                    mount_key,
                    new_attachment: !existed,
                    completer: Some(completer),
                },
                mount,
            },
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
        &self,
        request_type: RequestType,
        mount: &GuestMount<'_>,
        verity_info: Option<DeviceVerityInfo>,
    ) -> GuestRequest {
        let settings = match self.guest_os {
            GuestOs::Linux => {
                GuestSettings::LcowMappedVirtualDisk(LcowMappedVirtualDisk {
                    mount_path: mount.guest_path.to_string(),
                    lun: mount.lun as u8,
                    controller: mount.controller as u8,
                    partition: mount.partition,
                    read_only: mount.read_only,
                    encrypted: mount.encrypted,
                    options: mount.options.to_vec(),
                    verity_info,
                })
            }
            GuestOs::Windows => {
                GuestSettings::WcowMappedVirtualDisk(WcowMappedVirtualDisk {
                    container_path: mount.guest_path.to_string(),
                    lun: mount.lun as i32,
                })
            }
        };
        GuestRequest {
            resource_type: GuestResourceType::MappedVirtualDisk,
            request_type,
            settings,
        }
    }

    fn add_request(
        &self,
        kind: AttachmentKind,
        evd: Option<&EvdPath>,
        req: &ScsiAttach,
        mount: &ScsiMount,
        new_attachment: bool,
    ) -> Option<ModifyRequest> {
        let guest = (!mount.guest_path.is_empty()).then(|| {
            let verity = match (self.guest_os, req.read_only) {
                (GuestOs::Linux, true) => self.read_verity(&req.host_path),
                _ => None,
            };
            self.guest_request(
                RequestType::Add,
                &GuestMount {
                    guest_path: &mount.guest_path,
                    controller: mount.controller,
                    lun: mount.lun,
                    partition: req.partition,
                    read_only: req.read_only,
                    encrypted: req.encrypted,
                    options: &req.options,
                },
                verity,
            )
        });

        if !new_attachment {
            return guest.map(ModifyRequest::guest_only);
        }
        let path = match evd {
            Some(evd) => evd.mount_path.clone(),
            None => req.host_path.clone(),
        };
        Some(ModifyRequest {
            request_type: RequestType::Add,
            resource_path: Some(scsi_resource_path(
                mount.controller,
                mount.lun,
            )),
            settings: Some(HostSettings::Attachment(AttachmentSettings {
                path,
                kind,
                read_only: req.read_only,
                extensible_virtual_disk_type: evd.map(|e| e.evd_type.clone()),
            })),
            guest_request: guest,
        })
    }

    /// Drop one reference on the mount of `host_path` at `guest_path`.
    ///
    /// When the mount loses its last reference the guest is told to unmount
    /// it, and when the attachment does, it is removed from the UVM.  If that
    /// request fails, the references are restored.
    pub async fn detach(
        &self,
        host_path: &str,
        guest_path: &str,
    ) -> Result<(), ScsiError> {
        let mut table = self.table.lock().await;
        if table.controllers() == 0 {
            return Err(ScsiError::NoScsiControllers);
        }
        let not_attached = || ScsiError::NotAttached(host_path.to_string());

        let att = table.find_mut(host_path).ok_or_else(not_attached)?;
        let mount = att.mounts.find_mut(guest_path).ok_or_else(not_attached)?;
        match mount.attached.peek() {
            None if mount.attached.is_pending() => {
                return Err(ScsiError::AttachInProgress(host_path.to_string()))
            }
            Some(Ok(())) => {}
            _ => return Err(not_attached()),
        }

        mount.ref_count -= 1;
        let mount_gone = mount.ref_count == 0;
        let mount_key = mount.guest_path.clone();
        let partition = mount.partition;
        att.ref_count -= 1;
        let attachment_gone = att.ref_count == 0;
        let (controller, lun) = (att.controller, att.lun);

        let guest_mount = GuestMount {
            guest_path: &mount_key,
            controller,
            lun,
            partition,
            read_only: att.read_only,
            encrypted: att.encrypted,
            options: &[],
        };
        let request = if attachment_gone {
            // A Linux guest is always told to eject, so that its view of the
            // LUN is cleared before the slot is reused.
            let eject =
                self.guest_os == GuestOs::Linux || !mount_key.is_empty();
            Some(ModifyRequest {
                request_type: RequestType::Remove,
                resource_path: Some(scsi_resource_path(controller, lun)),
                settings: None,
                guest_request: eject.then(|| {
                    self.guest_request(RequestType::Remove, &guest_mount, None)
                }),
            })
        } else if mount_gone && !mount_key.is_empty() {
            Some(ModifyRequest::guest_only(self.guest_request(
                RequestType::Remove,
                &guest_mount,
                None,
            )))
        } else {
            None
        };

        if let Some(request) = request {
            if let Err(err) =
                modify::submit(self.modifier.as_ref(), &self.log, request).await
            {
                if let Some(att) = table.find_mut(host_path) {
                    att.ref_count += 1;
                    if let Some(mount) = att.mounts.find_mut(&mount_key) {
                        mount.ref_count += 1;
                    }
                }
                warn!(self.log, "detach failed, references restored";
                    "host_path" => host_path,
                    "guest_path" => &mount_key,
                    "error" => %err);
                return Err(err.into());
            }
        }

        if attachment_gone {
            table.deallocate(controller, lun);
            debug!(self.log, "released SCSI slot";
                "host_path" => host_path,
                "controller" => controller,
                "lun" => lun);
        } else if mount_gone {
            if let Some(att) = table.find_mut(host_path) {
                att.mounts.remove(&mount_key);
            }
            debug!(self.log, "removed guest mount";
                "host_path" => host_path,
                "guest_path" => &mount_key);
        }
        Ok(())
    }

    /// Guest path of the first mount of `host_path`.
    pub async fn guest_path(
        &self,
        host_path: &str,
    ) -> Result<String, ScsiError> {
        let table = self.table.lock().await;
        table
            .find(host_path)
            .and_then(|att| att.mounts.iter().next())
            .map(|m| m.guest_path.clone())
            .ok_or_else(|| ScsiError::NotAttached(host_path.to_string()))
    }

    pub async fn attachment(&self, host_path: &str) -> Option<AttachmentInfo> {
        self.table.lock().await.find(host_path).map(AttachmentInfo::from)
    }

    /// Every attachment, in controller/LUN order.
    pub async fn snapshot(&self) -> Vec<AttachmentInfo> {
        self.table.lock().await.iter().map(AttachmentInfo::from).collect()
    }

    /// Record an attachment which is already present in the UVM (such as one
    /// carried over from the template of a clone) at its original location.
    /// No modify request is issued.
    pub async fn register(
        &self,
        record: &AttachmentRecord,
    ) -> Result<ScsiMount, ScsiError> {
        let mut table = self.table.lock().await;
        let new = NewAttachment {
            host_path: record.host_path.clone(),
            kind: record.kind,
            evd_type: (!record.evd_type.is_empty())
                .then(|| record.evd_type.clone()),
            read_only: record.read_only,
            encrypted: false,
            is_layer: record.is_layer,
            allow_multiple_mounts: self.multi_mount
                && record.read_only
                && record.is_layer,
        };
        let att = table.insert_at(record.controller, record.lun, new)?;
        if record.mounts.is_empty() {
            att.mounts.insert_attached("", 0);
        }
        for (guest_path, partition) in record.mounts.iter() {
            att.mounts.insert_attached(guest_path, *partition);
        }
        att.ref_count = att.mounts.iter().map(|m| m.ref_count).sum();
        debug!(self.log, "registered SCSI attachment";
            "host_path" => &att.host_path,
            "controller" => att.controller,
            "lun" => att.lun,
            "mounts" => att.mounts.len());
        let mount = ScsiMount {
            host_path: att.host_path.clone(),
            guest_path: att
                .mounts
                .iter()
                .next()
                .map(|m| m.guest_path.clone())
                .unwrap_or_default(),
            controller: att.controller,
            lun: att.lun,
        };
        Ok(mount)
    }
}
