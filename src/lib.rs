//! Multi-session SSH/SFTP client core.
//!
//! Each [`SshSession`] owns a dedicated [`processing::ProcessingThread`];
//! every native call of that session, its channels, its SFTP sub-sessions
//! and their file streams runs on that thread only. SFTP sessions
//! additionally own a [`processing::ProcessingStrand`] that serialises
//! their task flow against the transfer queue.
//!
//! File transfers are cooperative state machines driven by an
//! [`ops::OperationQueue`]: each `work()` call performs one bounded quantum
//! (one chunk read or write, one directory listing) and yields back to the
//! queue, which throttles idle passes and fans progress and completion
//! events out through an injected [`events::EventSink`].

pub mod channel;
pub mod config;
pub mod connect;
pub mod error;
pub mod events;
pub mod ids;
pub mod manager;
pub mod ops;
pub mod processing;
pub mod promise;
pub mod session;
pub mod sftp;

mod util;

pub use channel::Channel;
pub use config::{SessionOptions, SftpOptions, TransferOptions};
pub use error::{AuthOutcome, ConnectError, OperationError, OperationErrorKind, SftpError};
pub use events::EventSink;
pub use ids::{ChannelId, OperationId, SessionId};
pub use manager::{PasswordProvider, SessionManager};
pub use ops::{Operation, OperationQueue, OperationState, OperationType, WorkStatus};
pub use session::{PtyOptions, SshSession};
pub use sftp::{DirectoryEntry, EntryKind, FileStream, Limits, RemoteFileStream, RemoteSftp,
    SftpSession};
