use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SFTP status code for "no such file", as sent on the wire.
pub const SFTP_NO_SUCH_FILE: i32 = 2;

/// Internal misuse of the wrapper layer, reported alongside native codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapperError {
    #[default]
    None,
    /// The owning session was dropped before the call could run.
    OwnerDropped,
    /// A non-empty write made no progress.
    ShortWrite,
    /// The native file handle was already closed or released.
    FileClosed,
}

/// Error raised by any SFTP-facing call: native message plus the ssh and
/// sftp level codes, and the wrapper misuse tag where applicable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpError {
    pub message: String,
    pub ssh_code: i32,
    pub sftp_code: i32,
    pub wrapper: WrapperError,
}

impl SftpError {
    pub fn from_native(err: &ssh2::Error) -> Self {
        let (ssh_code, sftp_code) = match err.code() {
            ssh2::ErrorCode::Session(code) => (code, 0),
            ssh2::ErrorCode::SFTP(code) => (0, code),
        };
        Self {
            message: err.message().to_string(),
            ssh_code,
            sftp_code,
            wrapper: WrapperError::None,
        }
    }

    pub fn owner_dropped() -> Self {
        Self {
            message: "owning session was dropped".to_string(),
            wrapper: WrapperError::OwnerDropped,
            ..Self::default()
        }
    }

    pub fn file_closed() -> Self {
        Self {
            message: "file handle is closed".to_string(),
            wrapper: WrapperError::FileClosed,
            ..Self::default()
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            ..Self::default()
        }
    }

    pub fn short_write() -> Self {
        Self {
            message: "failed to write any data".to_string(),
            wrapper: WrapperError::ShortWrite,
            ..Self::default()
        }
    }

    pub fn is_no_such_file(&self) -> bool {
        self.sftp_code == SFTP_NO_SUCH_FILE
    }
}

impl std::fmt::Display for SftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (ssh: {}, sftp: {}, wrapper: {:?})",
            self.message, self.ssh_code, self.sftp_code, self.wrapper
        )
    }
}

impl std::error::Error for SftpError {}

/// Error raised by session and channel level calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct SshError {
    pub message: String,
    pub code: i32,
}

impl SshError {
    pub fn from_native(err: &ssh2::Error) -> Self {
        let code = match err.code() {
            ssh2::ErrorCode::Session(code) => code,
            ssh2::ErrorCode::SFTP(code) => code,
        };
        Self {
            message: err.message().to_string(),
            code,
        }
    }
}

/// Flat taxonomy of everything that can fail inside a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationErrorKind {
    FileExists,
    FileNotFound,
    OpenFailure,
    FileStreamExpired,
    FileStatFailed,
    SftpError,
    InvalidPath,
    RenameFailure,
    CannotSetFilePermissions,
    FutureTimeout,
    OperationNotPrepared,
    CannotFinalizeDuringRead,
    InvalidOptionsKey,
    TargetFileNotGood,
    CannotWorkCompletedOperation,
    CannotWorkFailedOperation,
    CannotWorkCanceledOperation,
    UnknownWorkState,
    InvalidOperationState,
    OperationNotPossibleOnFileType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub kind: OperationErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sftp: Option<SftpError>,
}

impl OperationError {
    pub fn new(kind: OperationErrorKind) -> Self {
        Self { kind, sftp: None }
    }

    pub fn sftp(kind: OperationErrorKind, err: SftpError) -> Self {
        Self {
            kind,
            sftp: Some(err),
        }
    }
}

impl From<OperationErrorKind> for OperationError {
    fn from(kind: OperationErrorKind) -> Self {
        Self::new(kind)
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sftp {
            Some(err) => write!(f, "{:?}: {}", self.kind, err),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for OperationError {}

/// Outcome of one authentication step against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Denied,
    Partial,
    AgainNeeded,
    Other(i32),
}

impl std::fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthOutcome::Success => f.write_str("authentication succeeded"),
            AuthOutcome::Denied => f.write_str("authentication denied"),
            AuthOutcome::Partial => f.write_str("partial authentication"),
            AuthOutcome::AgainNeeded => f.write_str("authentication must be retried"),
            AuthOutcome::Other(code) => write!(f, "authentication failed with code {code}"),
        }
    }
}

/// Error establishing a new session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot resolve address '{0}'")]
    AddressResolve(String),
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(ssh2::Error),
    #[error("host key for '{host}' rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },
    #[error("failed to authenticate: {0}")]
    AuthenticationFailed(AuthOutcome),
    #[error("session setup failed: {0}")]
    Session(ssh2::Error),
}
