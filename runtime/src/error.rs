//! Error kinds for the runtime.
//!
//! Every fallible operation below the gRPC boundary returns
//! [`Result<T>`](Result), not `tonic::Status` directly, so adapters and the
//! lifecycle engine stay independent of the transport. Only the `cri` module
//! converts a [`RuntimeError`] into a `Status`, via [`IntoStatus`].

use std::fmt;
use std::result::Result as StdResult;

use tonic::{Code, Status};

/// Transport-agnostic error classification (matches the CRI error mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    InvalidArgument,
    Dependency(Dependency),
    Timeout,
    OutOfMemory,
}

/// External collaborators whose failures all collapse to one kind at the
/// gRPC boundary, but are kept distinct internally for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    SystemdError,
    StoreError,
    PullFailed,
    ExtractFailed,
    ImportFailed,
    NetworkSetupFailed,
    DbusError,
    /// A CNI plugin, image tool, or `ip netns` subprocess exited non-zero
    /// or failed to spawn.
    ExecFailed,
}

#[derive(Debug)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn dependency(dependency: Dependency, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency(dependency), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

pub type Result<T> = StdResult<T, RuntimeError>;

/// Converts a [`RuntimeError`] into the gRPC status the client sees.
/// `grpc-message` carries only the short kind/message pair; detailed causes
/// stay in the logs via `log_error!` at the call site.
pub trait IntoStatus {
    fn into_status(self) -> Status;
}

impl IntoStatus for RuntimeError {
    fn into_status(self) -> Status {
        let code = match self.kind {
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::InvalidState => Code::FailedPrecondition,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::Timeout => Code::DeadlineExceeded,
            ErrorKind::Dependency(_) | ErrorKind::OutOfMemory => Code::Internal,
        };
        Status::new(code, self.message)
    }
}
