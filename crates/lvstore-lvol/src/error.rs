//! Lvol layer error types

use lvstore_blob::BsError;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Step of a lifecycle chain at which a failure was observed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    BsInit,
    BsLoad,
    BsUnload,
    BsDestroy,
    CreateBlob,
    OpenBlob,
    CloseBlob,
    DeleteBlob,
    SyncBlob,
    ResizeBlob,
    SetXattr,
    GetXattr,
    SetSuper,
    GetSuper,
    Iterate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BsInit => "blob store init",
            Self::BsLoad => "blob store load",
            Self::BsUnload => "blob store unload",
            Self::BsDestroy => "blob store destroy",
            Self::CreateBlob => "blob create",
            Self::OpenBlob => "blob open",
            Self::CloseBlob => "blob close",
            Self::DeleteBlob => "blob delete",
            Self::SyncBlob => "blob sync",
            Self::ResizeBlob => "blob resize",
            Self::SetXattr => "xattr write",
            Self::GetXattr => "xattr read",
            Self::SetSuper => "super blob set",
            Self::GetSuper => "super blob get",
            Self::Iterate => "blob iteration",
        };
        f.write_str(name)
    }
}

/// Lvol layer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LvolError {
    /// Missing or unusable store, device or lvol
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Store identity could not be established
    #[error("No device: {step} failed{}", fmt_status(.status.as_ref()))]
    NoDevice { step: Step, status: Option<BsError> },

    /// Store or lvol still in use
    #[error("Busy: {0}")]
    Busy(String),

    /// Referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested size does not fit in the free clusters
    #[error("Capacity exceeded: requested {requested} clusters, {available} free")]
    CapacityExceeded { requested: u64, available: u64 },

    /// Status reported by the blob store, passed through verbatim
    #[error("Backend failure during {step}: {status}")]
    Backend { step: Step, status: BsError },

    /// A store with the same identity is already registered
    #[error("Lvol store {0} is already loaded")]
    AlreadyExists(Uuid),
}

fn fmt_status(status: Option<&BsError>) -> String {
    status.map_or_else(String::new, |s| format!(": {s}"))
}

impl LvolError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Adapter for `map_err` tagging a blob store status with its step
    pub fn backend(step: Step) -> impl FnOnce(BsError) -> Self {
        move |status| Self::Backend { step, status }
    }

    /// Adapter for `map_err` turning a blob store status into `NoDevice`
    pub fn no_device(step: Step) -> impl FnOnce(BsError) -> Self {
        move |status| Self::NoDevice {
            step,
            status: Some(status),
        }
    }

    /// Negative errno reported to completion callbacks
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::NoDevice { .. } => -libc::ENODEV,
            Self::Busy(_) => -libc::EBUSY,
            Self::NotFound(_) => -libc::ENOENT,
            Self::CapacityExceeded { .. } => -libc::ENOMEM,
            Self::Backend { status, .. } => status.errno(),
            Self::AlreadyExists(_) => -libc::EEXIST,
        }
    }
}

/// Result type for lvol operations
pub type LvolResult<T> = Result<T, LvolError>;
