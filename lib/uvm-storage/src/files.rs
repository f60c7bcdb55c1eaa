// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host filesystem operations the storage managers depend on.

use std::io;
use std::path::Path;

#[async_trait::async_trait]
pub trait HostFiles: Send + Sync + 'static {
    /// Size in bytes of the file at `path`.
    async fn size(&self, path: &Path) -> io::Result<u64>;

    /// Copy `src` to `dst` byte for byte, replacing `dst` if it exists.
    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<()>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [HostFiles] backed by the local filesystem.
#[derive(Default, Debug, Clone, Copy)]
pub struct LocalFiles;

#[async_trait::async_trait]
impl HostFiles for LocalFiles {
    async fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}
