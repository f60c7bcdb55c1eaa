// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Versioned binary encoding of SCSI attachment records.
//!
//! Records are persisted with a template UVM and decoded when a UVM is cloned
//! from it.  The layout is fixed; every multi-byte integer is little-endian
//! and strings are a `u32` byte count followed by UTF-8 bytes:
//!
//! | field           | encoding                                     |
//! |-----------------|----------------------------------------------|
//! | version         | `u32`                                        |
//! | host path       | string                                       |
//! | mounts          | `u32` count, then (guest path string, `u64`) |
//! | controller      | `u32`                                        |
//! | LUN             | `u32`                                        |
//! | read-only       | `u8` (0 or 1)                                |
//! | attachment kind | string                                       |
//! | EVD type        | string (empty when not an EVD)               |
//! | is-layer        | `u8` (0 or 1)                                |
//!
//! The version is checked before anything else is read.  A record written by
//! any other version is refused outright.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::modify::AttachmentKind;
use crate::scsi::AttachmentInfo;

/// Version written by [AttachmentRecord::encode].
pub const SERIAL_VERSION: u32 = 2;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CodecError {
    #[error(
        "record version {found} does not match supported version {expected}"
    )]
    VersionMismatch { found: u32, expected: u32 },

    #[error("record truncated while reading {0}")]
    Truncated(&'static str),

    #[error("non-UTF8 string in {0}")]
    Utf8(&'static str),

    #[error("invalid boolean {value} in {field}")]
    InvalidBool { field: &'static str, value: u8 },

    #[error("unknown attachment kind {0:?}")]
    UnknownKind(String),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Placement and identity of one SCSI attachment, as persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentRecord {
    pub host_path: String,
    /// Guest path of each mount, with its partition.
    pub mounts: BTreeMap<String, u64>,
    pub controller: u32,
    pub lun: u32,
    pub read_only: bool,
    pub kind: AttachmentKind,
    /// Extensible virtual disk provider; empty for other kinds.
    pub evd_type: String,
    pub is_layer: bool,
}

impl From<&AttachmentInfo> for AttachmentRecord {
    fn from(info: &AttachmentInfo) -> Self {
        Self {
            host_path: info.host_path.clone(),
            mounts: info
                .mounts
                .iter()
                .map(|m| (m.guest_path.clone(), m.partition))
                .collect(),
            controller: info.controller,
            lun: info.lun,
            read_only: info.read_only,
            kind: info.kind,
            evd_type: info.evd_type.clone().unwrap_or_default(),
            is_layer: info.is_layer,
        }
    }
}

impl AttachmentRecord {
    pub fn encode(&self) -> Bytes {
        let mut dst = Vec::new();
        dst.put_u32_le(SERIAL_VERSION);
        put_str(&mut dst, &self.host_path);
        dst.put_u32_le(self.mounts.len() as u32);
        for (guest_path, partition) in self.mounts.iter() {
            put_str(&mut dst, guest_path);
            dst.put_u64_le(*partition);
        }
        dst.put_u32_le(self.controller);
        dst.put_u32_le(self.lun);
        dst.put_u8(self.read_only as u8);
        put_str(&mut dst, self.kind.as_str());
        put_str(&mut dst, &self.evd_type);
        dst.put_u8(self.is_layer as u8);
        Bytes::from(dst)
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, CodecError> {
        let version = get_u32(&mut src, "version")?;
        if version != SERIAL_VERSION {
            return Err(CodecError::VersionMismatch {
                found: version,
                expected: SERIAL_VERSION,
            });
        }

        let host_path = get_str(&mut src, "host path")?;
        let count = get_u32(&mut src, "mount count")?;
        let mut mounts = BTreeMap::new();
        for _ in 0..count {
            let guest_path = get_str(&mut src, "mount guest path")?;
            let partition = get_u64(&mut src, "mount partition")?;
            mounts.insert(guest_path, partition);
        }
        let controller = get_u32(&mut src, "controller")?;
        let lun = get_u32(&mut src, "lun")?;
        let read_only = get_bool(&mut src, "read-only")?;
        let kind_str = get_str(&mut src, "attachment kind")?;
        let kind = kind_str
            .parse::<AttachmentKind>()
            .map_err(|_| CodecError::UnknownKind(kind_str))?;
        let evd_type = get_str(&mut src, "evd type")?;
        let is_layer = get_bool(&mut src, "is-layer")?;

        if src.has_remaining() {
            return Err(CodecError::TrailingBytes(src.remaining()));
        }
        Ok(Self {
            host_path,
            mounts,
            controller,
            lun,
            read_only,
            kind,
            evd_type,
            is_layer,
        })
    }

    /// Replace `self` with the record in `src`.  On error `self` is left
    /// untouched.
    pub fn decode_into(&mut self, src: &[u8]) -> Result<(), CodecError> {
        *self = Self::decode(src)?;
        Ok(())
    }
}

fn put_str(dst: &mut Vec<u8>, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_u32(src: &mut &[u8], field: &'static str) -> Result<u32, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated(field));
    }
    Ok(src.get_u32_le())
}

fn get_u64(src: &mut &[u8], field: &'static str) -> Result<u64, CodecError> {
    if src.remaining() < 8 {
        return Err(CodecError::Truncated(field));
    }
    Ok(src.get_u64_le())
}

fn get_bool(src: &mut &[u8], field: &'static str) -> Result<bool, CodecError> {
    if !src.has_remaining() {
        return Err(CodecError::Truncated(field));
    }
    match src.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(CodecError::InvalidBool { field, value }),
    }
}

fn get_str(src: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let len = get_u32(src, field)? as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    let s = std::str::from_utf8(&src[..len])
        .map_err(|_| CodecError::Utf8(field))?
        .to_string();
    src.advance(len);
    Ok(s)
}
