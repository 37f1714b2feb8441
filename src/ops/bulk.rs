use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::download::{DownloadOperation, DownloadOptions};
use super::scan::ScanResults;
use super::{
    wait_operation, Operation, OperationCore, OperationState, OperationType, WorkStatus,
};
use crate::config::{TransferOptions, DEFAULT_FUTURE_TIMEOUT};
use crate::error::{OperationError, OperationErrorKind};
use crate::ids::OperationId;
use crate::processing::ProcessingStrand;
use crate::sftp::RemoteSftp;

/// Snapshot handed to the overall progress callback after every quantum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkProgress {
    pub current_file: PathBuf,
    pub current_file_bytes: u64,
    pub current_file_total_bytes: u64,
    pub bytes_current: u64,
    pub bytes_total: u64,
    pub file_current_index: u64,
    pub file_count: u64,
}

pub type BulkProgressCallback = Box<dyn FnMut(&BulkProgress) + Send>;

pub struct BulkDownloadOptions {
    pub remote_root: PathBuf,
    pub local_root: PathBuf,
    /// Applied to every per-file download.
    pub transfer: TransferOptions,
    pub future_timeout: Duration,
    pub overall_progress: BulkProgressCallback,
}

impl Default for BulkDownloadOptions {
    fn default() -> Self {
        Self {
            remote_root: PathBuf::new(),
            local_root: PathBuf::new(),
            transfer: TransferOptions::default(),
            future_timeout: DEFAULT_FUTURE_TIMEOUT,
            overall_progress: Box::new(|_| {}),
        }
    }
}

#[derive(Default)]
struct CurrentFileProgress {
    bytes: u64,
    total: u64,
}

/// Consumes the entry list produced by the preceding scan (a barrier, so
/// the list is complete by the time this runs) and downloads every regular
/// file through an inline per-file operation on the same SFTP session.
pub struct BulkDownloadOperation {
    core: OperationCore,
    sftp: Weak<dyn RemoteSftp>,
    entries: ScanResults,
    remote_root: PathBuf,
    local_root: PathBuf,
    transfer: TransferOptions,
    future_timeout: Duration,
    overall_progress: BulkProgressCallback,
    entry_index: usize,
    file_count: u64,
    files_done: u64,
    bytes_total: u64,
    bytes_done: u64,
    current: Option<DownloadOperation>,
    current_path: PathBuf,
    current_progress: Arc<Mutex<CurrentFileProgress>>,
}

impl BulkDownloadOperation {
    pub fn new(
        sftp: Weak<dyn RemoteSftp>,
        entries: ScanResults,
        options: BulkDownloadOptions,
    ) -> Self {
        Self {
            core: OperationCore::new(),
            sftp,
            entries,
            remote_root: options.remote_root,
            local_root: options.local_root,
            transfer: options.transfer,
            future_timeout: options.future_timeout,
            overall_progress: options.overall_progress,
            entry_index: 0,
            file_count: 0,
            files_done: 0,
            bytes_total: 0,
            bytes_done: 0,
            current: None,
            current_path: PathBuf::new(),
            current_progress: Arc::new(Mutex::new(CurrentFileProgress::default())),
        }
    }

    fn local_target(&self, remote: &Path) -> PathBuf {
        match remote.strip_prefix(&self.remote_root) {
            Ok(relative) => self.local_root.join(relative),
            Err(_) => self
                .local_root
                .join(remote.file_name().unwrap_or_default()),
        }
    }

    fn enter_error_state(&mut self, error: OperationError) -> OperationError {
        self.core.state = OperationState::Failed;
        self.core.error = Some(error.clone());
        if let Err(cancel_error) = self.cancel_impl(false) {
            log::error!("bulk download: failed to clean up after error: {cancel_error}");
        }
        error
    }

    fn report_progress(&mut self) {
        let (bytes, total) = {
            let current = self.current_progress.lock().unwrap();
            (current.bytes, current.total)
        };
        let snapshot = BulkProgress {
            current_file: self.current_path.clone(),
            current_file_bytes: bytes,
            current_file_total_bytes: total,
            bytes_current: self.bytes_done + bytes,
            bytes_total: self.bytes_total,
            file_current_index: self.files_done,
            file_count: self.file_count,
        };
        (self.overall_progress)(&snapshot);
    }

    fn begin_totals(&mut self) {
        let entries = self.entries.lock().unwrap();
        self.file_count = entries.iter().filter(|e| e.is_regular_file()).count() as u64;
        self.bytes_total = entries
            .iter()
            .filter(|e| e.is_regular_file())
            .map(|e| e.size)
            .sum();
    }

    fn drive_current(&mut self) -> Result<WorkStatus, OperationError> {
        let operation = self.current.as_mut().expect("checked by caller");
        match operation.work() {
            Ok(WorkStatus::MoreWork) => {
                self.report_progress();
                Ok(WorkStatus::MoreWork)
            }
            Ok(WorkStatus::Complete) => {
                let finished = self.current_progress.lock().unwrap().total;
                self.bytes_done += finished;
                self.files_done += 1;
                self.current = None;
                *self.current_progress.lock().unwrap() = CurrentFileProgress::default();
                self.report_progress();
                Ok(WorkStatus::MoreWork)
            }
            Err(e) => Err(e),
        }
    }

    fn start_next(&mut self) -> Result<WorkStatus, OperationError> {
        let entry = {
            let entries = self.entries.lock().unwrap();
            entries.get(self.entry_index).cloned()
        };

        let Some(entry) = entry else {
            log::info!(
                "bulk download: finished {} files from '{}'",
                self.files_done,
                self.remote_root.display()
            );
            self.core.state = OperationState::Completed;
            return Ok(WorkStatus::Complete);
        };
        self.entry_index += 1;

        if entry.is_dir() {
            let target = self.local_target(&entry.path);
            std::fs::create_dir_all(&target)
                .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?;
            return Ok(WorkStatus::MoreWork);
        }

        if !entry.is_regular_file() {
            // Symlinks and specials are not transferred.
            return Ok(WorkStatus::MoreWork);
        }

        let sftp = self.sftp.upgrade().ok_or(OperationError::sftp(
            OperationErrorKind::SftpError,
            crate::error::SftpError::owner_dropped(),
        ))?;

        let stream = wait_operation(
            sftp.open_file(&entry.path, ssh2::OpenFlags::READ, 0),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;

        *self.current_progress.lock().unwrap() = CurrentFileProgress {
            bytes: 0,
            total: entry.size,
        };
        self.current_path = entry.path.clone();

        let progress = Arc::clone(&self.current_progress);
        let transfer = self.transfer.clone();
        let options = DownloadOptions {
            remote_path: entry.path.clone(),
            local_path: self.local_target(&entry.path),
            future_timeout: self.future_timeout,
            progress: Box::new(move |_min, max, current| {
                let mut state = progress.lock().unwrap();
                state.bytes = current;
                state.total = max;
            }),
            ..DownloadOptions::default()
        }
        .apply_transfer(&transfer);

        self.current = Some(DownloadOperation::new(stream, options));
        self.report_progress();
        Ok(WorkStatus::MoreWork)
    }

    fn cancel_impl(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError> {
        if adopt_cancel_state {
            log::info!("bulk download: '{}' canceled", self.remote_root.display());
            self.core.state = OperationState::Canceled;
        }
        if let Some(mut operation) = self.current.take() {
            let _ = operation.cancel(false);
        }
        Ok(())
    }
}

impl Operation for BulkDownloadOperation {
    fn id(&self) -> &OperationId {
        &self.core.id
    }

    fn op_type(&self) -> OperationType {
        OperationType::BulkDownload
    }

    fn state(&self) -> OperationState {
        self.core.state
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        self.sftp.upgrade().map(|s| s.strand())
    }

    fn work(&mut self) -> Result<WorkStatus, OperationError> {
        match self.core.state {
            OperationState::NotStarted => {
                self.begin_totals();
                self.core.state = OperationState::Running;
                Ok(WorkStatus::MoreWork)
            }
            OperationState::Running => {
                let result = if self.current.is_some() {
                    self.drive_current()
                } else {
                    self.start_next()
                };
                match result {
                    Ok(status) => Ok(status),
                    Err(e) => {
                        log::error!("bulk download: failed: {e}");
                        Err(self.enter_error_state(e))
                    }
                }
            }
            OperationState::Preparing | OperationState::Prepared | OperationState::Finalizing => {
                Err(self.enter_error_state(OperationErrorKind::InvalidOperationState.into()))
            }
            _ => match self.core.terminal_work_error() {
                Some(error) => Err(error),
                None => Err(self.enter_error_state(OperationErrorKind::UnknownWorkState.into())),
            },
        }
    }

    fn cancel(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError> {
        self.cancel_impl(adopt_cancel_state)
    }

    fn local_path(&self) -> Option<PathBuf> {
        Some(self.local_root.clone())
    }

    fn remote_path(&self) -> Option<PathBuf> {
        Some(self.remote_root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::scan::ScanEntry;
    use crate::ops::test_support::{MockSftp, MockStream, TestHarness};
    use crate::sftp::EntryKind;
    use std::sync::Mutex as StdMutex;

    fn drive(op: &mut BulkDownloadOperation) -> Result<(), OperationError> {
        for _ in 0..10_000 {
            match op.work() {
                Ok(WorkStatus::MoreWork) => continue,
                Ok(WorkStatus::Complete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        panic!("bulk download did not settle");
    }

    fn scan_entry(path: &str, kind: EntryKind, size: u64) -> ScanEntry {
        ScanEntry {
            path: PathBuf::from(path),
            kind,
            size,
        }
    }

    #[test]
    fn downloads_every_scanned_file_into_the_mirror_tree() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();
        let local_root = dir.path().join("mirror");

        let entries: ScanResults = Arc::new(Mutex::new(vec![
            scan_entry("/root", EntryKind::Directory, 0),
            scan_entry("/root/a.txt", EntryKind::File, 5),
            scan_entry("/root/dir0", EntryKind::Directory, 0),
            scan_entry("/root/dir0/b.txt", EntryKind::File, 7),
        ]));
        sftp.put_stream(
            "/root/a.txt",
            MockStream::new(harness.strand(), b"aaaaa"),
        );
        sftp.put_stream(
            "/root/dir0/b.txt",
            MockStream::new(harness.strand(), b"bbbbbbb"),
        );

        let snapshots = Arc::new(StdMutex::new(Vec::new()));
        let mut op = BulkDownloadOperation::new(
            sftp.as_weak_dyn(),
            entries,
            BulkDownloadOptions {
                remote_root: PathBuf::from("/root"),
                local_root: local_root.clone(),
                overall_progress: Box::new({
                    let snapshots = Arc::clone(&snapshots);
                    move |progress| snapshots.lock().unwrap().push(progress.clone())
                }),
                ..BulkDownloadOptions::default()
            },
        );

        drive(&mut op).unwrap();
        assert_eq!(op.state(), OperationState::Completed);

        assert_eq!(std::fs::read(local_root.join("a.txt")).unwrap(), b"aaaaa");
        assert_eq!(
            std::fs::read(local_root.join("dir0/b.txt")).unwrap(),
            b"bbbbbbb"
        );

        let snapshots = snapshots.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert_eq!(last.bytes_total, 12);
        assert_eq!(last.bytes_current, 12);
        assert_eq!(last.file_count, 2);
        assert_eq!(last.file_current_index, 2);
    }

    #[test]
    fn missing_remote_file_fails_the_bulk_download() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let entries: ScanResults = Arc::new(Mutex::new(vec![scan_entry(
            "/root/gone.txt",
            EntryKind::File,
            3,
        )]));

        let mut op = BulkDownloadOperation::new(
            sftp.as_weak_dyn(),
            entries,
            BulkDownloadOptions {
                remote_root: PathBuf::from("/root"),
                local_root: dir.path().to_path_buf(),
                ..BulkDownloadOptions::default()
            },
        );

        let error = drive(&mut op).unwrap_err();
        assert_eq!(error.kind, OperationErrorKind::SftpError);
        assert_eq!(op.state(), OperationState::Failed);
    }
}
