// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-visible mounts of a SCSI attachment.

use std::collections::BTreeMap;

use super::ScsiError;
use crate::inflight::Completion;

#[derive(Debug)]
pub struct Mount {
    pub guest_path: String,
    pub partition: u64,
    pub options: Vec<String>,
    pub ref_count: u32,
    /// Resolves once the guest has been told about this mount.
    pub(crate) attached: Completion<ScsiError>,
}

/// Outcome of [MountRegistry::allocate_or_find].
pub(crate) enum MountSlot {
    /// Somebody else is (or was) responsible for attaching the mount.
    Existing(Completion<ScsiError>),
    /// The caller created the mount and must resolve it.
    Created,
}

/// The mounts of one attachment, keyed by guest path.
///
/// Unless multiple mounts are allowed, the registry holds at most one mount
/// and lookups disregard the guest path entirely.
#[derive(Debug)]
pub struct MountRegistry {
    allow_multiple: bool,
    mounts: BTreeMap<String, Mount>,
}

impl MountRegistry {
    pub fn new(allow_multiple: bool) -> Self {
        Self { allow_multiple, mounts: BTreeMap::new() }
    }

    fn key_for(&self, guest_path: &str) -> Option<&String> {
        if self.allow_multiple {
            self.mounts.get_key_value(guest_path).map(|(k, _)| k)
        } else {
            self.mounts.keys().next()
        }
    }

    /// Find the mount matching `guest_path` and take a reference on it, or
    /// create it with `completion` as its pending signal.
    ///
    /// Returns the key of the mount, which is its guest path.
    pub(crate) fn allocate_or_find(
        &mut self,
        guest_path: &str,
        partition: u64,
        options: &[String],
        completion: &Completion<ScsiError>,
    ) -> (String, MountSlot) {
        if let Some(key) = self.key_for(guest_path).cloned() {
            if let Some(mount) = self.mounts.get_mut(&key) {
                mount.ref_count += 1;
                return (key, MountSlot::Existing(mount.attached.clone()));
            }
        }
        self.mounts.insert(
            guest_path.to_string(),
            Mount {
                guest_path: guest_path.to_string(),
                partition,
                options: options.to_vec(),
                ref_count: 1,
                attached: completion.clone(),
            },
        );
        (guest_path.to_string(), MountSlot::Created)
    }

    /// Insert an already-attached mount, as when reconstructing a clone.
    /// Without multiple mounts, further insertions become references on the
    /// one mount already present.
    pub(crate) fn insert_attached(&mut self, guest_path: &str, partition: u64) {
        if !self.allow_multiple {
            if let Some(mount) = self.mounts.values_mut().next() {
                mount.ref_count += 1;
                return;
            }
        }
        self.mounts.insert(
            guest_path.to_string(),
            Mount {
                guest_path: guest_path.to_string(),
                partition,
                options: Vec::new(),
                ref_count: 1,
                attached: Completion::resolved(Ok(())),
            },
        );
    }

    pub fn find(&self, guest_path: &str) -> Option<&Mount> {
        self.key_for(guest_path).and_then(|k| self.mounts.get(k))
    }

    pub fn find_mut(&mut self, guest_path: &str) -> Option<&mut Mount> {
        let key = self.key_for(guest_path)?.clone();
        self.mounts.get_mut(&key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Mount> {
        self.mounts.remove(key)
    }

    /// Whether any mount is exposed at exactly `guest_path`.
    pub fn exposes(&self, guest_path: &str) -> bool {
        self.mounts.contains_key(guest_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.values()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight;

    #[test]
    fn single_mount_ignores_guest_path() {
        let (_completer, completion) = inflight::pair();
        let mut reg = MountRegistry::new(false);

        let (key, slot) = reg.allocate_or_find("/mnt/a", 0, &[], &completion);
        assert_eq!(key, "/mnt/a");
        assert!(matches!(slot, MountSlot::Created));

        let (key, slot) = reg.allocate_or_find("/mnt/b", 3, &[], &completion);
        assert_eq!(key, "/mnt/a");
        assert!(matches!(slot, MountSlot::Existing(_)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find("/anything").unwrap().ref_count, 2);
        assert!(!reg.exposes("/mnt/b"));
    }

    #[test]
    fn multiple_mounts_keyed_by_guest_path() {
        let (_completer, completion) = inflight::pair();
        let mut reg = MountRegistry::new(true);

        reg.allocate_or_find("/mnt/1", 0, &[], &completion);
        reg.allocate_or_find("/mnt/2", 0, &["ro".to_string()], &completion);
        let (key, slot) = reg.allocate_or_find("/mnt/1", 0, &[], &completion);
        assert_eq!(key, "/mnt/1");
        assert!(matches!(slot, MountSlot::Existing(_)));

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.find("/mnt/1").unwrap().ref_count, 2);
        assert_eq!(reg.find("/mnt/2").unwrap().options, vec!["ro"]);
        assert!(reg.find("/mnt/3").is_none());

        let removed = reg.remove("/mnt/1").unwrap();
        assert_eq!(removed.ref_count, 2);
        assert!(!reg.exposes("/mnt/1"));
    }

    #[test]
    fn attached_mounts_fold_without_multi_mount() {
        let mut single = MountRegistry::new(false);
        single.insert_attached("/mnt/1", 0);
        single.insert_attached("/mnt/2", 0);
        assert_eq!(single.len(), 1);
        let mount = single.find("/mnt/2").unwrap();
        assert_eq!(mount.guest_path, "/mnt/1");
        assert_eq!(mount.ref_count, 2);
        assert!(matches!(mount.attached.peek(), Some(Ok(()))));

        let mut multi = MountRegistry::new(true);
        multi.insert_attached("/mnt/1", 0);
        multi.insert_attached("/mnt/2", 1);
        assert_eq!(multi.len(), 2);
        assert_eq!(multi.find("/mnt/2").unwrap().partition, 1);
    }
}
