//! Error types for the User Gateway

use thiserror::Error;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Wire codec error
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the required capability or permission bits
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed argument or mismatched metadata
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Entry already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// MS rejected a publish because our view of the metadata is stale
    #[error("Stale version: {0}")]
    StaleVersion(String),

    /// The file's coordinator changed out from under us
    #[error("Coordinator changed: now {0}")]
    CoordinatorChanged(u64),

    /// The remote coordinator could not be reached
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Allocation-sensitive path could not make progress; retriable
    #[error("Out of memory")]
    OutOfMemory,

    /// On-disk or on-wire data failed validation
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Operation cancelled before completion
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Convert to a POSIX errno for the filesystem surface
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::StaleVersion(_) => libc::ESTALE,
            Error::CoordinatorChanged(_) => libc::EAGAIN,
            Error::RemoteUnavailable(_) => libc::ENETDOWN,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Corrupt(_) => libc::EIO,
            Error::Cancelled => libc::EINTR,
            _ => libc::EIO,
        }
    }

    /// True if this error means the remote gateway could not service the
    /// request at all (as opposed to rejecting it), so a coordinator
    /// takeover is worth attempting.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }
}
