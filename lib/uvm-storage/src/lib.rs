// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage attachment bookkeeping for a utility VM.
//!
//! Host-side disks reach the UVM either over its virtual SCSI controllers
//! ([scsi]) or as virtual persistent-memory devices ([vpmem]).  The managers
//! here decide where each backing object lands, share objects between
//! concurrent requests, and drive the hypervisor through a [modify::Modifier]
//! so that their tables stay in step with what the UVM actually has attached.

#![allow(clippy::style)]

pub mod access;
pub mod clone;
pub mod codec;
pub mod evd;
pub mod files;
pub mod inflight;
pub mod modify;
pub mod scsi;
pub mod vpmem;

#[cfg(test)]
mod test_util;

pub use scsi::{ScsiAttach, ScsiManager, ScsiMount};
pub use vpmem::VpmemManager;
