//! Error types for the support driver core.

use thiserror::Error;

/// Result type alias using the driver Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in support driver operations.
///
/// Status codes are computed close to the fault and propagated unchanged up
/// to the dispatch boundary, where [`Error::to_errno`] translates them once
/// into the platform's native error-code space.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed header, bad size, or bad session/command combination.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A session for the process already exists in the table.
    #[error("a session for pid {0} already exists")]
    AlreadyExists(u32),

    /// The session was already marked opened.
    #[error("session for pid {0} is already opened")]
    AlreadyOpened(u32),

    /// Session lookup failure at dispatch time.
    #[error("no open session matches the caller")]
    InvalidHandle,

    /// Generic verification or authorization failure.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A module image with this name is already in the loader registry.
    #[error("module '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// Signature, size, or byte-parity failure in the image loader.
    #[error("loader mismatch: {0}")]
    LoaderMismatch(String),

    /// Unresolved import during image loading.
    #[error("unresolved symbol '{0}'")]
    SymbolNotFound(String),

    /// Allocation failure (scratch buffers, executable memory).
    #[error("out of memory")]
    OutOfMemory,

    /// Non-memory resource exhaustion (session slots, image registry).
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Requested capability unavailable on this platform or version.
    #[error("not supported on this platform")]
    NotSupported,

    /// Hardware virtualization is in exclusive use elsewhere.
    #[error("VT-x is in exclusive use by another component")]
    VmxInUse,

    /// An operation was invoked out of its documented order.
    #[error("operation out of order: {0}")]
    WrongOrder(String),

    /// Unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O errors from the file layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-format errors from the ioc crate.
    #[error("wire error: {0}")]
    Wire(#[from] supdrv_ioc::WireError),

    /// DER parse/encode errors from the verifier.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// Executable-format parse errors from the loader.
    #[error("object error: {0}")]
    Object(#[from] object::Error),
}

impl Error {
    /// Translates the driver status into the platform's native error code.
    ///
    /// The mapping is fixed and total; unmapped kinds fall back to `EINVAL`,
    /// matching what the device entry points historically returned for any
    /// rejected request.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidParameter(_) | Error::Wire(_) => libc::EINVAL,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::AlreadyOpened(_) => libc::EALREADY,
            Error::AlreadyLoaded(_) => libc::EEXIST,
            Error::InvalidHandle => libc::EINVAL,
            Error::AccessDenied(_) | Error::Der(_) => libc::EPERM,
            Error::LoaderMismatch(_) | Error::Object(_) => libc::ENOEXEC,
            Error::SymbolNotFound(_) => libc::ENOENT,
            Error::OutOfMemory => libc::ENOMEM,
            Error::OutOfResources(_) => libc::EBUSY,
            Error::NotSupported => libc::ENOTSUP,
            Error::VmxInUse => libc::EBUSY,
            Error::WrongOrder(_) => libc::EINVAL,
            Error::Internal(_) => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
