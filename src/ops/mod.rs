pub mod bulk;
pub mod download;
pub mod queue;
pub mod scan;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

pub use bulk::{BulkDownloadOperation, BulkDownloadOptions, BulkProgress};
pub use download::{DownloadOperation, DownloadOptions};
pub use queue::OperationQueue;
pub use scan::{ScanEntry, ScanOperation, ScanOptions, ScanResults};
pub use upload::{UploadOperation, UploadOptions};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OperationError, OperationErrorKind, SftpError};
use crate::ids::OperationId;
use crate::processing::ProcessingStrand;
use crate::promise::{Future, FutureError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Download,
    Upload,
    Scan,
    BulkDownload,
}

/// Lifecycle of one queued operation. Ordering matters: everything below
/// `Completed` is still able to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    NotStarted,
    Preparing,
    Prepared,
    Running,
    Finalizing,
    Completed,
    Canceled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Canceled | OperationState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Reschedule without delay; the operation has more quanta to run.
    MoreWork,
    /// Terminal success.
    Complete,
}

/// `(min, max, current)` byte progress; `current` is monotonic.
pub type ProgressCallback = Box<dyn FnMut(u64, u64, u64) + Send>;

pub(crate) fn no_progress() -> ProgressCallback {
    Box::new(|_, _, _| {})
}

/// State machine for one unit of work, driven by repeated `work()` calls
/// from the queue. Implementations push their I/O through the strand named
/// by `strand()` and block on the resulting futures with a bounded timeout.
pub trait Operation: Send {
    fn id(&self) -> &OperationId;
    fn op_type(&self) -> OperationType;
    fn state(&self) -> OperationState;

    /// A barrier operation must not have successors running in parallel
    /// with it.
    fn is_barrier(&self) -> bool {
        false
    }

    /// How many of the queue's parallel slots this operation claims per
    /// driver pass, capped by the slots still available.
    fn parallel_work_doable(&self, max_parallel: usize) -> usize {
        max_parallel.min(1)
    }

    fn strand(&self) -> Option<ProcessingStrand>;

    fn work(&mut self) -> Result<WorkStatus, OperationError>;

    /// Always runs cleanup; only adopts the `Canceled` state when asked,
    /// so the failure path does not overwrite an existing failure reason.
    fn cancel(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError>;

    fn local_path(&self) -> Option<PathBuf> {
        None
    }

    fn remote_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Bookkeeping shared by all operation implementations.
pub(crate) struct OperationCore {
    pub id: OperationId,
    pub state: OperationState,
    pub error: Option<OperationError>,
}

impl OperationCore {
    pub fn new() -> Self {
        Self {
            id: OperationId::generate(),
            state: OperationState::NotStarted,
            error: None,
        }
    }

    /// The specific "cannot work" error for re-entering a terminal state.
    pub fn terminal_work_error(&self) -> Option<OperationError> {
        match self.state {
            OperationState::Completed => Some(OperationError::new(
                OperationErrorKind::CannotWorkCompletedOperation,
            )),
            OperationState::Failed => Some(OperationError::new(
                OperationErrorKind::CannotWorkFailedOperation,
            )),
            OperationState::Canceled => Some(OperationError::new(
                OperationErrorKind::CannotWorkCanceledOperation,
            )),
            _ => None,
        }
    }
}

/// Waits on a strand future with the operation's bounded timeout and folds
/// the outcome into the operation error taxonomy.
pub(crate) fn wait_operation<T>(
    future: Future<Result<T, SftpError>>,
    timeout: Duration,
    sftp_error_kind: OperationErrorKind,
) -> Result<T, OperationError> {
    match future.wait_timeout(timeout) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(OperationError::sftp(sftp_error_kind, e)),
        Err(FutureError::TimedOut) => Err(OperationError::new(OperationErrorKind::FutureTimeout)),
        Err(FutureError::Broken) => Err(OperationError::sftp(
            sftp_error_kind,
            SftpError::owner_dropped(),
        )),
    }
}
