// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller × LUN slot table.

use uvm_storage_config::{SlotRef, MAX_LUNS_PER_CONTROLLER};

use super::mount::MountRegistry;
use super::ScsiError;
use crate::inflight::Completion;
use crate::modify::{AttachmentKind, SCSI_CONTROLLER_GUIDS};

/// One backing object bound to a controller/LUN pair.
#[derive(Debug)]
pub struct Attachment {
    pub host_path: String,
    pub controller: u32,
    pub lun: u32,
    pub kind: AttachmentKind,
    pub evd_type: Option<String>,
    pub read_only: bool,
    pub encrypted: bool,
    pub is_layer: bool,
    /// Sum of the reference counts of all mounts.
    pub ref_count: u32,
    pub mounts: MountRegistry,
    /// Distinguishes this attachment from a later one of the same host path
    /// which happens to land in the table after this one is released.
    pub(crate) generation: u64,
    /// Resolves once the hypervisor has added the attachment.
    pub(crate) attached: Completion<ScsiError>,
}

/// Properties of an attachment to create if the host path is not present.
#[derive(Debug, Clone)]
pub(crate) struct NewAttachment {
    pub host_path: String,
    pub kind: AttachmentKind,
    pub evd_type: Option<String>,
    pub read_only: bool,
    pub encrypted: bool,
    pub is_layer: bool,
    pub allow_multiple_mounts: bool,
}

#[derive(Debug)]
enum Cell {
    Empty,
    /// In use by something outside the manager's control.
    Reserved,
    Occupied(Attachment),
}

#[derive(Debug)]
pub struct AttachmentTable {
    cells: Vec<Vec<Cell>>,
    multi_controller: bool,
    next_generation: u64,
}

impl AttachmentTable {
    pub fn new(
        controllers: u32,
        luns_per_controller: u32,
        multi_controller: bool,
        reserved: &[SlotRef],
    ) -> Self {
        // Only controllers with a well-known instance ID are addressable.
        let controllers = controllers.min(SCSI_CONTROLLER_GUIDS.len() as u32);
        let luns_per_controller =
            luns_per_controller.min(MAX_LUNS_PER_CONTROLLER);
        let mut cells: Vec<Vec<Cell>> = (0..controllers)
            .map(|_| (0..luns_per_controller).map(|_| Cell::Empty).collect())
            .collect();
        for slot in reserved {
            if let Some(cell) = cells
                .get_mut(slot.controller as usize)
                .and_then(|c| c.get_mut(slot.lun as usize))
            {
                *cell = Cell::Reserved;
            }
        }
        Self { cells, multi_controller, next_generation: 0 }
    }

    pub fn controllers(&self) -> u32 {
        self.cells.len() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.cells.iter().flatten().filter_map(|cell| match cell {
            Cell::Occupied(att) => Some(att),
            _ => None,
        })
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Attachment> {
        self.cells.iter_mut().flatten().filter_map(|cell| match cell {
            Cell::Occupied(att) => Some(att),
            _ => None,
        })
    }

    pub fn find(&self, host_path: &str) -> Option<&Attachment> {
        self.iter().find(|att| att.host_path == host_path)
    }

    pub fn find_mut(&mut self, host_path: &str) -> Option<&mut Attachment> {
        self.iter_mut().find(|att| att.host_path == host_path)
    }

    /// Host path of the attachment, other than `host_path`, which already
    /// exposes a mount at `guest_path`.
    pub fn guest_path_owner(
        &self,
        host_path: &str,
        guest_path: &str,
    ) -> Option<&str> {
        self.iter()
            .find(|att| {
                att.host_path != host_path && att.mounts.exposes(guest_path)
            })
            .map(|att| att.host_path.as_str())
    }

    /// First empty cell, scanning controller 0 first then increasing LUN.
    fn next_free(&self) -> Option<(u32, u32)> {
        self.cells.iter().enumerate().find_map(|(controller, luns)| {
            luns.iter()
                .position(|cell| matches!(cell, Cell::Empty))
                .map(|lun| (controller as u32, lun as u32))
        })
    }

    /// Find the attachment of `new.host_path` and take a reference on it, or
    /// place a new one in the first free cell.
    ///
    /// Returns the attachment and whether it already existed.  Errors leave
    /// the table unchanged.
    pub(crate) fn allocate_or_find(
        &mut self,
        new: NewAttachment,
        attached: &Completion<ScsiError>,
    ) -> Result<(&mut Attachment, bool), ScsiError> {
        if let Some((c, l)) = self
            .find(&new.host_path)
            .map(|att| (att.controller as usize, att.lun as usize))
        {
            return match &mut self.cells[c][l] {
                Cell::Occupied(att) => {
                    att.ref_count += 1;
                    Ok((att, true))
                }
                _ => unreachable!("found attachment in unoccupied cell"),
            };
        }

        let (controller, lun) =
            self.next_free().ok_or(ScsiError::NoAvailableLocation)?;
        if controller > 0 && !self.multi_controller {
            return Err(ScsiError::TooManyAttachments { controller, lun });
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let cell = &mut self.cells[controller as usize][lun as usize];
        *cell = Cell::Occupied(Attachment {
            host_path: new.host_path,
            controller,
            lun,
            kind: new.kind,
            evd_type: new.evd_type,
            read_only: new.read_only,
            encrypted: new.encrypted,
            is_layer: new.is_layer,
            ref_count: 1,
            mounts: MountRegistry::new(new.allow_multiple_mounts),
            generation,
            attached: attached.clone(),
        });
        match cell {
            Cell::Occupied(att) => Ok((att, false)),
            _ => unreachable!("cell was just occupied"),
        }
    }

    /// Place an already-attached `new` at a fixed location.
    pub(crate) fn insert_at(
        &mut self,
        controller: u32,
        lun: u32,
        new: NewAttachment,
    ) -> Result<&mut Attachment, ScsiError> {
        if self.find(&new.host_path).is_some() {
            return Err(ScsiError::AlreadyAttached(new.host_path));
        }
        let generation = self.next_generation;
        let cell = self
            .cells
            .get_mut(controller as usize)
            .and_then(|c| c.get_mut(lun as usize))
            .filter(|cell| matches!(cell, Cell::Empty))
            .ok_or(ScsiError::SlotUnavailable { controller, lun })?;
        *cell = Cell::Occupied(Attachment {
            host_path: new.host_path,
            controller,
            lun,
            kind: new.kind,
            evd_type: new.evd_type,
            read_only: new.read_only,
            encrypted: new.encrypted,
            is_layer: new.is_layer,
            ref_count: 0,
            mounts: MountRegistry::new(new.allow_multiple_mounts),
            generation,
            attached: Completion::resolved(Ok(())),
        });
        self.next_generation += 1;
        match cell {
            Cell::Occupied(att) => Ok(att),
            _ => unreachable!("cell was just occupied"),
        }
    }

    /// Clear the cell at `controller`/`lun`, returning what occupied it.
    pub fn deallocate(
        &mut self,
        controller: u32,
        lun: u32,
    ) -> Option<Attachment> {
        let cell = self
            .cells
            .get_mut(controller as usize)?
            .get_mut(lun as usize)?;
        match std::mem::replace(cell, Cell::Empty) {
            Cell::Occupied(att) => Some(att),
            other => {
                *cell = other;
                None
            }
        }
    }
}
