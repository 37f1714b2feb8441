use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{
    wait_operation, Operation, OperationCore, OperationState, OperationType, WorkStatus,
};
use crate::config::DEFAULT_FUTURE_TIMEOUT;
use crate::error::{OperationError, OperationErrorKind};
use crate::ids::OperationId;
use crate::processing::ProcessingStrand;
use crate::sftp::{EntryKind, RemoteSftp};

/// One discovered entry with its full remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
}

impl ScanEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_regular_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// The growing entry list, shared with the bulk download that consumes it.
pub type ScanResults = Arc<Mutex<Vec<ScanEntry>>>;

/// `(total_bytes, current_index, total_entries)` per completed quantum.
pub type ScanProgressCallback = Box<dyn FnMut(u64, u64, u64) + Send>;

pub struct ScanOptions {
    pub remote_path: PathBuf,
    pub future_timeout: Duration,
    pub progress: ScanProgressCallback,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            remote_path: PathBuf::new(),
            future_timeout: DEFAULT_FUTURE_TIMEOUT,
            progress: Box::new(|_, _, _| {}),
        }
    }
}

/// Breadth-first walk of a remote directory subtree. One directory listing
/// per work quantum; contiguous runs of regular files are accounted without
/// further round trips.
pub struct ScanOperation {
    core: OperationCore,
    sftp: Weak<dyn RemoteSftp>,
    remote_path: PathBuf,
    entries: ScanResults,
    current_index: usize,
    total_bytes: u64,
    future_timeout: Duration,
    progress: ScanProgressCallback,
}

impl ScanOperation {
    pub fn new(sftp: Weak<dyn RemoteSftp>, entries: ScanResults, options: ScanOptions) -> Self {
        Self {
            core: OperationCore::new(),
            sftp,
            remote_path: options.remote_path,
            entries,
            current_index: 0,
            total_bytes: 0,
            future_timeout: options.future_timeout,
            progress: options.progress,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn enter_error_state(&mut self, error: OperationError) -> OperationError {
        self.core.state = OperationState::Failed;
        self.core.error = Some(error.clone());
        if let Err(cancel_error) = self.cancel(false) {
            log::error!("scan: failed to clean up after error: {cancel_error}");
        }
        error
    }

    fn scan_once(&mut self, path: &PathBuf) -> Result<(), OperationError> {
        let sftp = self.sftp.upgrade().ok_or(OperationError::sftp(
            OperationErrorKind::SftpError,
            crate::error::SftpError::owner_dropped(),
        ))?;

        let listing = wait_operation(
            sftp.list_directory(path),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;

        let mut entries = self.entries.lock().unwrap();
        for child in listing {
            // The session layer already filters dot entries, but servers may
            // emit them anywhere in a listing; a second filter keeps mocks
            // and exotic servers honest.
            if child.name == "." || child.name == ".." {
                continue;
            }
            entries.push(ScanEntry {
                path: path.join(&child.name),
                kind: child.kind,
                size: child.size,
            });
        }
        Ok(())
    }

    fn running_step(&mut self) -> Result<WorkStatus, OperationError> {
        let total_entries = self.entries.lock().unwrap().len();
        if self.current_index >= total_entries {
            log::info!("scan: '{}' completed", self.remote_path.display());
            self.core.state = OperationState::Completed;
            return Ok(WorkStatus::Complete);
        }

        let current = self.entries.lock().unwrap()[self.current_index].clone();
        if current.is_dir() {
            self.scan_once(&current.path)?;
            self.current_index += 1;
        }

        // Account every contiguous non-directory entry; stop at the next
        // directory so it gets its own quantum.
        loop {
            let entry = {
                let entries = self.entries.lock().unwrap();
                entries.get(self.current_index).cloned()
            };
            match entry {
                Some(entry) if entry.is_dir() => break,
                Some(entry) => {
                    if entry.is_regular_file() {
                        self.total_bytes += entry.size;
                    }
                    self.current_index += 1;
                }
                None => break,
            }
        }

        let total_entries = self.entries.lock().unwrap().len() as u64;
        (self.progress)(self.total_bytes, self.current_index as u64, total_entries);

        if self.current_index as u64 >= total_entries {
            log::info!("scan: '{}' completed", self.remote_path.display());
            self.core.state = OperationState::Completed;
            return Ok(WorkStatus::Complete);
        }
        Ok(WorkStatus::MoreWork)
    }
}

impl Operation for ScanOperation {
    fn id(&self) -> &OperationId {
        &self.core.id
    }

    fn op_type(&self) -> OperationType {
        OperationType::Scan
    }

    fn state(&self) -> OperationState {
        self.core.state
    }

    /// Later operations depend on the completed entry list.
    fn is_barrier(&self) -> bool {
        true
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        self.sftp.upgrade().map(|s| s.strand())
    }

    fn work(&mut self) -> Result<WorkStatus, OperationError> {
        match self.core.state {
            OperationState::NotStarted => {
                log::info!("scan: starting scan of '{}'", self.remote_path.display());
                self.total_bytes = 0;
                self.current_index = 0;
                {
                    let mut entries = self.entries.lock().unwrap();
                    entries.clear();
                    entries.push(ScanEntry {
                        path: self.remote_path.clone(),
                        kind: EntryKind::Directory,
                        size: 0,
                    });
                }
                self.core.state = OperationState::Running;
                Ok(WorkStatus::MoreWork)
            }
            OperationState::Running => match self.running_step() {
                Ok(status) => Ok(status),
                Err(e) => {
                    log::error!("scan: failed: {e}");
                    Err(self.enter_error_state(e))
                }
            },
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
        if adopt_cancel_state {
            log::info!("scan: '{}' canceled", self.remote_path.display());
            self.core.state = OperationState::Canceled;
        }
        Ok(())
    }

    fn remote_path(&self) -> Option<PathBuf> {
        Some(self.remote_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_support::{file_entry, MockSftp, TestHarness};
    use std::sync::Mutex as StdMutex;

    fn drive(op: &mut ScanOperation) -> Result<(), OperationError> {
        for _ in 0..1_000 {
            match op.work() {
                Ok(WorkStatus::MoreWork) => continue,
                Ok(WorkStatus::Complete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        panic!("scan did not settle");
    }

    fn tree_sftp(harness: &TestHarness) -> std::sync::Arc<MockSftp> {
        let sftp = MockSftp::new(harness.strand());
        // Dot entries deliberately scattered through the listings.
        sftp.put_listing(
            "/root",
            vec![
                file_entry(".", EntryKind::Directory, 0),
                file_entry("a.txt", EntryKind::File, 1),
                file_entry("dir0", EntryKind::Directory, 0),
                file_entry("..", EntryKind::Directory, 0),
            ],
        );
        sftp.put_listing(
            "/root/dir0",
            vec![
                file_entry("b.txt", EntryKind::File, 2),
                file_entry("dir1", EntryKind::Directory, 0),
                file_entry(".", EntryKind::Directory, 0),
            ],
        );
        sftp.put_listing(
            "/root/dir0/dir1",
            vec![file_entry("c.txt", EntryKind::File, 3)],
        );
        sftp
    }

    #[test]
    fn walks_the_tree_and_accumulates_totals() {
        let harness = TestHarness::new();
        let sftp = tree_sftp(&harness);
        let results: ScanResults = ScanResults::default();

        let progress = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let mut op = ScanOperation::new(
            sftp.as_weak_dyn(),
            std::sync::Arc::clone(&results),
            ScanOptions {
                remote_path: PathBuf::from("/root"),
                progress: Box::new({
                    let progress = std::sync::Arc::clone(&progress);
                    move |bytes, index, total| {
                        progress.lock().unwrap().push((bytes, index, total));
                    }
                }),
                ..ScanOptions::default()
            },
        );

        drive(&mut op).unwrap();
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(op.total_bytes(), 6);

        let entries = results.lock().unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries
            .iter()
            .all(|e| !e.path.ends_with(".") && !e.path.ends_with("..")));
        assert!(entries
            .iter()
            .any(|e| e.path == PathBuf::from("/root/dir0/dir1/c.txt") && e.size == 3));

        let progress = progress.lock().unwrap();
        assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(*progress.last().unwrap(), (6, 6, 6));
    }

    #[test]
    fn listing_error_fails_the_scan() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let results: ScanResults = ScanResults::default();

        let mut op = ScanOperation::new(
            sftp.as_weak_dyn(),
            results,
            ScanOptions {
                remote_path: PathBuf::from("/missing"),
                ..ScanOptions::default()
            },
        );

        let error = drive(&mut op).unwrap_err();
        assert_eq!(error.kind, OperationErrorKind::SftpError);
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[test]
    fn scan_is_a_barrier_and_rejects_terminal_reentry() {
        let harness = TestHarness::new();
        let sftp = tree_sftp(&harness);
        let results: ScanResults = ScanResults::default();
        let mut op = ScanOperation::new(
            sftp.as_weak_dyn(),
            results,
            ScanOptions {
                remote_path: PathBuf::from("/root"),
                ..ScanOptions::default()
            },
        );

        assert!(op.is_barrier());
        drive(&mut op).unwrap();
        assert_eq!(
            op.work().unwrap_err().kind,
            OperationErrorKind::CannotWorkCompletedOperation
        );
    }
}
