// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extensible virtual disk (EVD) paths.
//!
//! EVDs are disks provided by host drivers which plug into the synthetic SCSI
//! stack rather than being backed by a file.  They are addressed as
//! `evd://<type>/<mount-path>`, where `type` names the provider (for example
//! `space` for storage spaces) and `mount-path` is opaque to us.

use thiserror::Error;

pub const EVD_PREFIX: &str = "evd://";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid extensible virtual disk path: {0}")]
pub struct EvdPathError(pub String);

/// A parsed `evd://` path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvdPath {
    pub evd_type: String,
    pub mount_path: String,
}
impl EvdPath {
    /// Split `host_path` on the first `/` following the prefix.  A path with
    /// no separator, or an empty type, is rejected.
    pub fn parse(host_path: &str) -> Result<Self, EvdPathError> {
        let trimmed = host_path.strip_prefix(EVD_PREFIX).unwrap_or(host_path);
        match trimmed.split_once('/') {
            Some((evd_type, mount_path)) if !evd_type.is_empty() => Ok(Self {
                evd_type: evd_type.to_string(),
                mount_path: mount_path.to_string(),
            }),
            _ => Err(EvdPathError(host_path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_storage_space() {
        let p = EvdPath::parse("evd://space/{pool-id}{disk-id}").unwrap();
        assert_eq!(p.evd_type, "space");
        assert_eq!(p.mount_path, "{pool-id}{disk-id}");
    }

    #[test]
    fn only_first_separator_splits() {
        let p = EvdPath::parse("evd://space/a/b/c").unwrap();
        assert_eq!(p.evd_type, "space");
        assert_eq!(p.mount_path, "a/b/c");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["evd://space", "evd:///path", "evd://", ""] {
            assert_eq!(
                EvdPath::parse(bad),
                Err(EvdPathError(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }
}
