// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Granting a UVM access to files on the host.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::modify::{share, SharedError};

/// Access to grant a VM for a host path before it is attached.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VmAccess {
    /// Access was arranged out of band (e.g. layers or GPU VHDs, which are
    /// ACL'd for the VM group when they are installed).
    #[default]
    Noop,
    /// Grant access to the well-known group every VM runs as.
    Group,
    /// Grant access to this VM only.
    Individual,
}

/// Host security operations used to authorize a VM for a path.
#[async_trait::async_trait]
pub trait AccessGranter: Send + Sync + 'static {
    async fn grant_vm_group_access(&self, path: &Path) -> anyhow::Result<()>;
    async fn grant_vm_access(
        &self,
        vm_id: &str,
        path: &Path,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Error)]
#[error("failed to grant VM access to {}: {source}", .path.display())]
pub struct AccessError {
    pub path: PathBuf,
    #[source]
    pub source: SharedError,
}

/// Grant `vm_id` the requested `access` to `path`.
pub async fn grant(
    granter: &dyn AccessGranter,
    vm_id: &str,
    path: &Path,
    access: VmAccess,
) -> Result<(), AccessError> {
    let res = match access {
        VmAccess::Noop => return Ok(()),
        VmAccess::Group => granter.grant_vm_group_access(path).await,
        VmAccess::Individual => granter.grant_vm_access(vm_id, path).await,
    };
    res.map_err(|err| AccessError {
        path: path.to_path_buf(),
        source: share(err),
    })
}
