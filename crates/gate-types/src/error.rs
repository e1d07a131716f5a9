use std::fmt;
use std::io;

use thiserror::Error;

/// Error kind, determined by the error variant.
///
/// Kinds group errors by how callers are expected to react: the first four
/// are recovered at the request boundary, the rest indicate trouble with the
/// environment or the core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadModule,
    NotFound,
    Suspended,
    ResourceLimit,
    InvalidState,
    BadTermination,
    Io,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// True for kinds which describe a problem with the caller's input
    /// rather than with the host.
    pub fn is_public(self) -> bool {
        matches!(
            self,
            ErrorKind::BadModule | ErrorKind::NotFound | ErrorKind::Suspended | ErrorKind::ResourceLimit
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::BadModule => "bad module",
            ErrorKind::NotFound => "not found",
            ErrorKind::Suspended => "suspended",
            ErrorKind::ResourceLimit => "resource limit",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::BadTermination => "bad termination",
            ErrorKind::Io => "i/o",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(text)
    }
}

/// Errors produced by image building, snapshotting and storage.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The module violated a structural or ordering constraint.
    #[error("bad module: {0}")]
    BadModule(String),

    /// The requested entry function is not exported, or has the wrong type.
    #[error("function not found")]
    FunctionNotFound,

    /// An entry function was named although the module exports `_start`.
    #[error("entry function conflicts with _start function")]
    StartFunctionConflict,

    /// A named program or instance does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The program or instance has unfinished execution state.
    #[error("module is suspended")]
    Suspended,

    /// A size or count exceeded a configured or hardcoded bound.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// The instance is being mutated, or the builder is already finished.
    #[error("instance state is invalid")]
    InvalidState,

    /// The sandbox process left its stack variables in a bad configuration.
    #[error("bad termination: {0}")]
    BadTermination(String),

    /// File system or memory mapping failure.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Waiting for a prepared resource was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal consistency check failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ImageError {
    pub fn bad_module(msg: impl Into<String>) -> Self {
        Self::BadModule(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an I/O error with the name of the failed operation.
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Wrap the current `errno` value.
    pub fn last_os_error(context: &'static str) -> Self {
        Self::io(context, io::Error::last_os_error())
    }

    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadModule(_) => ErrorKind::BadModule,
            Self::FunctionNotFound | Self::StartFunctionConflict | Self::NotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Suspended => ErrorKind::Suspended,
            Self::ResourceLimit(_) => ErrorKind::ResourceLimit,
            Self::InvalidState => ErrorKind::InvalidState,
            Self::BadTermination(_) => ErrorKind::BadTermination,
            Self::Io { .. } => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The underlying OS error number, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            context: "i/o",
            source,
        }
    }
}
