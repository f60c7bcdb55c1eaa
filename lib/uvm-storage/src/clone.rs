// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Carrying the SCSI attachments of a template UVM over to a clone.
//!
//! A cloned UVM resumes with the template's devices at the same locations, so
//! every attachment is recreated at its original controller/LUN.  Read-only
//! disks are shared with the template.  Writable disks (the UVM scratch and
//! any container scratch riding along with it) are copied first, so that the
//! template's files are never written by the clone.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde_derive::Serialize;
use slog::debug;
use thiserror::Error;

use crate::access::{self, AccessError, AccessGranter, VmAccess};
use crate::codec::{AttachmentRecord, CodecError};
use crate::files::HostFiles;
use crate::modify::{AttachmentKind, SCSI_CONTROLLER_GUIDS};
use crate::scsi::{ScsiError, ScsiManager, ScsiMount};

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("failed to create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "failed to copy {} to {}: {source}",
        .src.display(),
        .dst.display()
    )]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} has no file name to copy to")]
    NoFileName(String),

    #[error("controller {0} has no well-known instance ID")]
    UnknownController(u32),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Scsi(#[from] ScsiError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A disk as it appears in the creation document of the clone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloneAttachment {
    pub path: String,
    #[serde(rename = "Type")]
    pub kind: AttachmentKind,
}

/// SCSI attachments of a clone, keyed by controller instance ID and then by
/// LUN, for merging into the clone's creation document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CloneDocument {
    pub scsi: BTreeMap<String, BTreeMap<String, CloneAttachment>>,
}

impl CloneDocument {
    pub fn get(&self, controller: u32, lun: u32) -> Option<&CloneAttachment> {
        let guid = SCSI_CONTROLLER_GUIDS.get(controller as usize)?;
        self.scsi.get(*guid)?.get(&lun.to_string())
    }

    fn insert(&mut self, guid: &str, lun: u32, attachment: CloneAttachment) {
        self.scsi
            .entry(guid.to_string())
            .or_default()
            .insert(lun.to_string(), attachment);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// State shared by the attachments being cloned into one UVM.
pub struct CloneContext<'a> {
    pub log: slog::Logger,
    /// Where copies of writable disks are placed.
    pub scratch_folder: PathBuf,
    pub files: &'a dyn HostFiles,
    pub granter: &'a dyn AccessGranter,
    pub document: CloneDocument,
}

impl CloneContext<'_> {
    /// Destination of the copy of a writable disk.  The UVM scratch disk
    /// (0:0) goes directly in the scratch folder; anything else gets a
    /// directory of its own.
    fn copy_destination(
        &self,
        record: &AttachmentRecord,
    ) -> Result<(PathBuf, PathBuf), CloneError> {
        let dir = match (record.controller, record.lun) {
            (0, 0) => self.scratch_folder.clone(),
            (c, l) => self.scratch_folder.join(format!("clone-mount-{c}-{l}")),
        };
        let name = Path::new(&record.host_path)
            .file_name()
            .ok_or_else(|| CloneError::NoFileName(record.host_path.clone()))?;
        let dst = dir.join(name);
        Ok((dir, dst))
    }

    /// Copy the disk of a writable record and authorize `vm_id` to use the
    /// copy.  The copy is removed again if access cannot be granted.
    async fn copy_writable(
        &self,
        record: &AttachmentRecord,
        vm_id: &str,
    ) -> Result<PathBuf, CloneError> {
        let (dir, dst) = self.copy_destination(record)?;
        self.files
            .create_dir_all(&dir)
            .await
            .map_err(|source| CloneError::CreateDir { path: dir, source })?;

        let src = PathBuf::from(&record.host_path);
        self.files.copy(&src, &dst).await.map_err(|source| {
            CloneError::Copy { src: src.clone(), dst: dst.clone(), source }
        })?;

        if let Err(err) =
            access::grant(self.granter, vm_id, &dst, VmAccess::Individual).await
        {
            self.discard(&dst).await;
            return Err(err.into());
        }
        debug!(self.log, "copied writable disk for clone";
            "src" => %src.display(),
            "dst" => %dst.display());
        Ok(dst)
    }

    async fn discard(&self, copy: &Path) {
        if let Err(err) = self.files.remove(copy).await {
            debug!(self.log, "failed to remove clone copy";
                "path" => %copy.display(),
                "error" => %err);
        }
    }
}

/// Recreate the attachment described by `record` in `target`.  A copy made
/// for a writable disk does not outlive a failure to register it.
pub async fn clone_attachment(
    record: &AttachmentRecord,
    target: &ScsiManager,
    ctx: &mut CloneContext<'_>,
) -> Result<ScsiMount, CloneError> {
    let guid = SCSI_CONTROLLER_GUIDS
        .get(record.controller as usize)
        .ok_or(CloneError::UnknownController(record.controller))?;

    let (record, copy) = if record.read_only {
        (record.clone(), None)
    } else {
        let dst = ctx.copy_writable(record, target.vm_id()).await?;
        let record = AttachmentRecord {
            host_path: dst.to_string_lossy().into_owned(),
            ..record.clone()
        };
        (record, Some(dst))
    };

    let mount = match target.register(&record).await {
        Ok(mount) => mount,
        Err(err) => {
            if let Some(copy) = copy {
                ctx.discard(&copy).await;
            }
            return Err(err.into());
        }
    };
    ctx.document.insert(
        guid,
        record.lun,
        CloneAttachment { path: record.host_path.clone(), kind: record.kind },
    );
    debug!(ctx.log, "cloned SCSI attachment";
        "host_path" => &record.host_path,
        "controller" => record.controller,
        "lun" => record.lun,
        "read_only" => record.read_only);
    Ok(mount)
}

/// Decode a persisted record and clone it into `target`.
pub async fn clone_encoded(
    encoded: &[u8],
    target: &ScsiManager,
    ctx: &mut CloneContext<'_>,
) -> Result<ScsiMount, CloneError> {
    let record = AttachmentRecord::decode(encoded)?;
    clone_attachment(&record, target, ctx).await
}

/// Clone every attachment of `source` into `target`.
pub async fn clone_all(
    source: &ScsiManager,
    target: &ScsiManager,
    ctx: &mut CloneContext<'_>,
) -> Result<Vec<ScsiMount>, CloneError> {
    let mut mounts = Vec::new();
    for info in source.snapshot().await {
        let record = AttachmentRecord::from(&info);
        mounts.push(clone_attachment(&record, target, ctx).await?);
    }
    Ok(mounts)
}
