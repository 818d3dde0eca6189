//! UUID extended attribute
//!
//! Both the super blob and every lvol blob carry their identity in the
//! `uuid` xattr: the hyphenated form followed by a NUL, 37 bytes in total.
//! Writes always use lower case; reads accept either case.

use lvstore_blob::{Blob, BsError, BsResult};
use uuid::Uuid;

/// Name of the identity attribute
pub const UUID_XATTR: &str = "uuid";

/// Length of the stored identity, terminator included
pub const UUID_STRING_LEN: usize = 37;

/// Encode a UUID in its on-disk form
#[must_use]
pub fn encode_uuid(uuid: &Uuid) -> [u8; UUID_STRING_LEN] {
    let mut raw = [0u8; UUID_STRING_LEN];
    uuid.hyphenated().encode_lower(&mut raw[..UUID_STRING_LEN - 1]);
    raw
}

/// Decode the on-disk form: 36 characters of hyphenated UUID and a NUL
#[must_use]
pub fn decode_uuid(raw: &[u8]) -> Option<Uuid> {
    let (terminator, text) = raw.split_last()?;
    if raw.len() != UUID_STRING_LEN || *terminator != 0 {
        return None;
    }
    Uuid::try_parse_ascii(text).ok()
}

/// Write `uuid` to the identity attribute of an open blob
pub fn write_uuid(blob: &dyn Blob, uuid: &Uuid) -> BsResult<()> {
    blob.set_xattr(UUID_XATTR, &encode_uuid(uuid))
}

/// Read the identity attribute of an open blob
///
/// Fails with `NOT_FOUND` when the attribute is absent and `CORRUPT` when it
/// does not hold a UUID.
pub fn read_uuid(blob: &dyn Blob) -> BsResult<Uuid> {
    let raw = blob.get_xattr(UUID_XATTR)?;
    decode_uuid(&raw).ok_or(BsError::CORRUPT)
}
