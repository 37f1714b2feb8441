use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{
    no_progress, wait_operation, Operation, OperationCore, OperationState, OperationType,
    ProgressCallback, WorkStatus,
};
use crate::config::{sanitize_temp_file_suffix, TransferOptions, DEFAULT_FUTURE_TIMEOUT,
    DEFAULT_TEMP_FILE_SUFFIX};
use crate::error::{OperationError, OperationErrorKind};
use crate::ids::OperationId;
use crate::processing::ProcessingStrand;
use crate::sftp::{RemoteFileStream, RemoteSftp};

const UPLOAD_CHUNK: usize = 8192;

/// Permissions for a fresh remote file when none are configured:
/// owner read/write plus group read.
const DEFAULT_REMOTE_MODE: u32 = 0o640;

pub struct UploadOptions {
    pub remote_path: PathBuf,
    pub local_path: PathBuf,
    pub temp_file_suffix: String,
    pub may_overwrite: bool,
    pub try_continue: bool,
    pub inherit_permissions: bool,
    pub permissions: Option<u32>,
    pub future_timeout: Duration,
    pub progress: ProgressCallback,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            remote_path: PathBuf::new(),
            local_path: PathBuf::new(),
            temp_file_suffix: DEFAULT_TEMP_FILE_SUFFIX.to_string(),
            may_overwrite: false,
            try_continue: false,
            inherit_permissions: false,
            permissions: None,
            future_timeout: DEFAULT_FUTURE_TIMEOUT,
            progress: no_progress(),
        }
    }
}

impl UploadOptions {
    pub fn apply_transfer(mut self, transfer: &TransferOptions) -> Self {
        if let Some(suffix) = &transfer.temp_file_suffix {
            self.temp_file_suffix = suffix.clone();
        }
        if let Some(v) = transfer.may_overwrite {
            self.may_overwrite = v;
        }
        if let Some(v) = transfer.try_continue {
            self.try_continue = v;
        }
        if let Some(v) = transfer.inherit_permissions {
            self.inherit_permissions = v;
        }
        if transfer.custom_permissions.is_some() {
            self.permissions = transfer.custom_permissions;
        }
        self
    }
}

/// Streams a local file into a remote `.part` sibling and renames it onto
/// the target once everything is written. The remote `.part` is kept on
/// cancel so a later upload can resume it.
pub struct UploadOperation {
    core: OperationCore,
    sftp: Weak<dyn RemoteSftp>,
    stream: Weak<dyn RemoteFileStream>,
    remote_path: PathBuf,
    local_path: PathBuf,
    temp_file_suffix: String,
    may_overwrite: bool,
    try_continue: bool,
    inherit_permissions: bool,
    permissions: Option<u32>,
    progress: ProgressCallback,
    local_file: Option<File>,
    total_size: u64,
    left_to_upload: u64,
    future_timeout: Duration,
}

impl UploadOperation {
    pub fn new(sftp: Weak<dyn RemoteSftp>, options: UploadOptions) -> Self {
        Self {
            core: OperationCore::new(),
            sftp,
            stream: Weak::<crate::sftp::FileStream>::new(),
            remote_path: options.remote_path,
            local_path: options.local_path,
            temp_file_suffix: sanitize_temp_file_suffix(&options.temp_file_suffix),
            may_overwrite: options.may_overwrite,
            try_continue: options.try_continue,
            inherit_permissions: options.inherit_permissions,
            permissions: options.permissions,
            progress: options.progress,
            local_file: None,
            total_size: 0,
            left_to_upload: 0,
            future_timeout: options.future_timeout,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.remote_path.clone().into_os_string();
        path.push(&self.temp_file_suffix);
        PathBuf::from(path)
    }

    fn upgrade_sftp(&self) -> Result<Arc<dyn RemoteSftp>, OperationError> {
        self.sftp.upgrade().ok_or(OperationError::sftp(
            OperationErrorKind::SftpError,
            crate::error::SftpError::owner_dropped(),
        ))
    }

    fn enter_error_state(&mut self, error: OperationError) -> OperationError {
        self.core.state = OperationState::Failed;
        self.core.error = Some(error.clone());
        if let Err(cancel_error) = self.cancel_impl(false) {
            log::error!("upload: failed to clean up after error: {cancel_error}");
        }
        error
    }

    pub(crate) fn prepare(&mut self) -> Result<(), OperationError> {
        if self.local_path.as_os_str().is_empty() {
            log::error!("upload: invalid local path");
            return Err(OperationErrorKind::InvalidPath.into());
        }

        if !self.local_path.exists() {
            log::error!("upload: local file '{}' not found", self.local_path.display());
            return Err(OperationErrorKind::FileNotFound.into());
        }

        let file = File::open(&self.local_path)
            .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?;
        self.total_size = file
            .metadata()
            .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?
            .len();
        self.left_to_upload = self.total_size;
        self.local_file = Some(file);

        self.open_or_adopt_file()?;

        log::info!(
            "upload: prepared '{}' -> '{}' ({} bytes)",
            self.local_path.display(),
            self.remote_path.display(),
            self.total_size
        );
        Ok(())
    }

    fn remote_mode(&self) -> u32 {
        if self.inherit_permissions {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(metadata) = std::fs::metadata(&self.local_path) {
                    return metadata.permissions().mode() & 0o7777;
                }
            }
        }
        self.permissions.unwrap_or(DEFAULT_REMOTE_MODE)
    }

    fn open_or_adopt_file(&mut self) -> Result<(), OperationError> {
        let sftp = self.upgrade_sftp()?;

        // The final remote path must not silently be replaced.
        match wait_operation(
            sftp.stat(&self.remote_path),
            self.future_timeout,
            OperationErrorKind::SftpError,
        ) {
            Ok(_) => {
                if !self.may_overwrite {
                    log::warn!(
                        "upload: remote '{}' already exists and may not be overwritten",
                        self.remote_path.display()
                    );
                    return Err(OperationErrorKind::FileExists.into());
                }
            }
            Err(e) => {
                let missing = e
                    .sftp
                    .as_ref()
                    .map(|s| s.is_no_such_file())
                    .unwrap_or(false);
                if !missing {
                    return Err(e);
                }
            }
        }

        let temp = self.temp_path();
        let mode = self.remote_mode() as i32;

        let temp_stat = wait_operation(
            sftp.stat(&temp),
            self.future_timeout,
            OperationErrorKind::SftpError,
        );

        if let Ok(existing) = temp_stat {
            if existing.size > self.left_to_upload {
                log::info!("upload: remote temp is larger than the local file, not adopting");
            } else if self.try_continue {
                log::info!(
                    "upload: continuing upload to '{}' at offset {}",
                    temp.display(),
                    existing.size
                );

                let stream = wait_operation(
                    sftp.open_file(&temp, ssh2::OpenFlags::WRITE, mode),
                    self.future_timeout,
                    OperationErrorKind::SftpError,
                )?;
                let locked = stream
                    .upgrade()
                    .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;

                wait_operation(
                    locked.seek(existing.size),
                    self.future_timeout,
                    OperationErrorKind::SftpError,
                )?;

                let file = self.local_file.as_mut().expect("opened in prepare");
                file.seek(SeekFrom::Start(existing.size))
                    .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?;

                self.left_to_upload -= existing.size;
                self.stream = stream;
                return Ok(());
            }
        }

        log::info!("upload: starting new upload to '{}'", temp.display());
        let stream = wait_operation(
            sftp.open_file(
                &temp,
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
                mode,
            ),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;
        self.stream = stream;
        Ok(())
    }

    /// One write quantum. Returns true while bytes remain.
    pub(crate) fn write_once(&mut self) -> Result<bool, OperationError> {
        if self.core.state < OperationState::Prepared {
            return Err(OperationErrorKind::OperationNotPrepared.into());
        }

        if self.left_to_upload == 0 {
            return Ok(false);
        }

        let Some(file) = self.local_file.as_mut() else {
            return Err(OperationErrorKind::OpenFailure.into());
        };

        let stream = self
            .stream
            .upgrade()
            .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;

        let chunk_len = UPLOAD_CHUNK.min(self.left_to_upload as usize);
        let mut chunk = vec![0u8; chunk_len];
        let read = file
            .read(&mut chunk)
            .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?;
        if read == 0 {
            // The local file shrank underneath us.
            log::error!("upload: local file ended before the expected size");
            return Err(OperationErrorKind::OpenFailure.into());
        }
        chunk.truncate(read);

        wait_operation(
            stream.write(chunk),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;

        self.left_to_upload -= read as u64;
        (self.progress)(0, self.total_size, self.total_size - self.left_to_upload);
        Ok(self.left_to_upload > 0)
    }

    pub(crate) fn finalize(&mut self) -> Result<(), OperationError> {
        if self.core.state == OperationState::Running {
            return Err(OperationErrorKind::CannotFinalizeDuringRead.into());
        }

        self.local_file = None;

        let stream = self
            .stream
            .upgrade()
            .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;
        stream.close(false);

        let sftp = self.upgrade_sftp()?;

        // Re-check the destination; a stat error here means "try the rename
        // anyway".
        if let Ok(_existing) = wait_operation(
            sftp.stat(&self.remote_path),
            self.future_timeout,
            OperationErrorKind::SftpError,
        ) {
            if !self.may_overwrite {
                log::warn!(
                    "upload: remote '{}' already exists and may not be overwritten",
                    self.remote_path.display()
                );
                return Err(OperationErrorKind::FileExists.into());
            }
        }

        wait_operation(
            sftp.rename(&self.temp_path(), &self.remote_path),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;

        log::info!(
            "upload: finalized '{}' -> '{}'",
            self.local_path.display(),
            self.remote_path.display()
        );
        Ok(())
    }

    fn cancel_impl(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError> {
        if adopt_cancel_state {
            log::info!(
                "upload: '{}' -> '{}' canceled",
                self.local_path.display(),
                self.remote_path.display()
            );
            self.core.state = OperationState::Canceled;
        }
        self.cleanup();
        Ok(())
    }

    /// The remote `.part` is deliberately kept so resumption stays possible.
    fn cleanup(&mut self) {
        self.local_file = None;
        if let Some(stream) = self.stream.upgrade() {
            stream.close(false);
        }
    }
}

impl Operation for UploadOperation {
    fn id(&self) -> &OperationId {
        &self.core.id
    }

    fn op_type(&self) -> OperationType {
        OperationType::Upload
    }

    fn state(&self) -> OperationState {
        self.core.state
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        self.sftp.upgrade().map(|s| s.strand())
    }

    fn work(&mut self) -> Result<WorkStatus, OperationError> {
        loop {
            match self.core.state {
                OperationState::NotStarted => self.core.state = OperationState::Preparing,
                OperationState::Preparing => {
                    if let Err(e) = self.prepare() {
                        log::error!("upload: failed to prepare: {e}");
                        return Err(self.enter_error_state(e));
                    }
                    self.core.state = OperationState::Prepared;
                }
                OperationState::Prepared => self.core.state = OperationState::Running,
                OperationState::Running => match self.write_once() {
                    Err(e) => {
                        log::error!("upload: failed to write: {e}");
                        return Err(self.enter_error_state(e));
                    }
                    Ok(true) => return Ok(WorkStatus::MoreWork),
                    Ok(false) => self.core.state = OperationState::Finalizing,
                },
                OperationState::Finalizing => {
                    if let Err(e) = self.finalize() {
                        log::error!("upload: failed to finalize: {e}");
                        return Err(self.enter_error_state(e));
                    }
                    self.core.state = OperationState::Completed;
                    return Ok(WorkStatus::Complete);
                }
                _ => {
                    return match self.core.terminal_work_error() {
                        Some(error) => Err(error),
                        None => {
                            Err(self
                                .enter_error_state(OperationErrorKind::UnknownWorkState.into()))
                        }
                    }
                }
            }
        }
    }

    fn cancel(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError> {
        self.cancel_impl(adopt_cancel_state)
    }

    fn local_path(&self) -> Option<PathBuf> {
        Some(self.local_path.clone())
    }

    fn remote_path(&self) -> Option<PathBuf> {
        Some(self.remote_path.clone())
    }
}

impl Drop for UploadOperation {
    fn drop(&mut self) {
        let _ = self.cancel_impl(false);

        if let Some(strand) = self.strand() {
            let _ = strand.push_promise_task(|| ()).wait_timeout(self.future_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_support::{file_entry, MockSftp, MockStream, TestHarness};
    use crate::sftp::EntryKind;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Mutex as StdMutex;

    fn drive(op: &mut UploadOperation) -> Result<(), OperationError> {
        for _ in 0..10_000 {
            match op.work() {
                Ok(WorkStatus::MoreWork) => continue,
                Ok(WorkStatus::Complete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        panic!("operation did not settle");
    }

    fn local_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_local_file_fails_with_file_not_found() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.bin"),
                local_path: dir.path().join("nope.bin"),
                ..UploadOptions::default()
            },
        );
        let error = drive(&mut op).unwrap_err();
        assert_eq!(error.kind, OperationErrorKind::FileNotFound);
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[test]
    fn uploads_in_chunks_then_renames_the_temp() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 249) as u8).collect();
        let local = local_file(&dir, "in.bin", &content);

        let stream = MockStream::new(harness.strand(), b"");
        sftp.put_stream("/remote/out.bin.filepart", stream.clone());

        let currents = Arc::new(StdMutex::new(Vec::new()));
        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.bin"),
                local_path: local,
                progress: Box::new({
                    let currents = Arc::clone(&currents);
                    move |_, max, current| {
                        assert_eq!(max, 20_000);
                        currents.lock().unwrap().push(current);
                    }
                }),
                ..UploadOptions::default()
            },
        );
        drive(&mut op).unwrap();

        assert_eq!(*stream.written.lock().unwrap(), content);
        assert_eq!(
            *sftp.renames.lock().unwrap(),
            vec![(
                PathBuf::from("/remote/out.bin.filepart"),
                PathBuf::from("/remote/out.bin")
            )]
        );
        let opened = sftp.opened.lock().unwrap();
        assert!(opened[0].1.contains(ssh2::OpenFlags::CREATE));
        assert!(opened[0].1.contains(ssh2::OpenFlags::TRUNCATE));

        let currents = currents.lock().unwrap();
        assert!(currents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*currents.last().unwrap(), 20_000);
        assert!(stream.close_calls.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[test]
    fn resume_adopts_remote_temp_and_uploads_the_tail() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let content = b"0123456789abcdefghij"; // 20 bytes
        let local = local_file(&dir, "in.txt", content);

        sftp.put_stat(
            "/remote/out.txt.filepart",
            file_entry("out.txt.filepart", EntryKind::File, 10),
        );
        let stream = MockStream::new(harness.strand(), b"");
        sftp.put_stream("/remote/out.txt.filepart", stream.clone());

        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.txt"),
                local_path: local,
                try_continue: true,
                ..UploadOptions::default()
            },
        );
        drive(&mut op).unwrap();

        assert_eq!(*stream.written.lock().unwrap(), &content[10..]);
        assert_eq!(*stream.seeks.lock().unwrap(), vec![10]);
        let opened = sftp.opened.lock().unwrap();
        assert_eq!(opened.len(), 1);
        assert!(!opened[0].1.contains(ssh2::OpenFlags::TRUNCATE));
    }

    #[test]
    fn larger_remote_temp_is_not_adopted() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let content = b"0123456789abcdefghij";
        let local = local_file(&dir, "in.txt", content);

        sftp.put_stat(
            "/remote/out.txt.filepart",
            file_entry("out.txt.filepart", EntryKind::File, 100),
        );
        let stream = MockStream::new(harness.strand(), b"");
        sftp.put_stream("/remote/out.txt.filepart", stream.clone());

        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.txt"),
                local_path: local,
                try_continue: true,
                ..UploadOptions::default()
            },
        );
        drive(&mut op).unwrap();

        assert_eq!(*stream.written.lock().unwrap(), content);
        assert!(stream.seeks.lock().unwrap().is_empty());
        let opened = sftp.opened.lock().unwrap();
        assert!(opened[0].1.contains(ssh2::OpenFlags::TRUNCATE));
    }

    #[test]
    fn existing_remote_target_without_overwrite_fails() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();
        let local = local_file(&dir, "in.txt", b"abc");

        sftp.put_stat("/remote/out.txt", file_entry("out.txt", EntryKind::File, 3));

        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.txt"),
                local_path: local,
                ..UploadOptions::default()
            },
        );
        let error = drive(&mut op).unwrap_err();
        assert_eq!(error.kind, OperationErrorKind::FileExists);
    }

    #[test]
    fn cancel_keeps_the_remote_temp_for_resumption() {
        let harness = TestHarness::new();
        let sftp = MockSftp::new(harness.strand());
        let dir = tempfile::tempdir().unwrap();

        let content: Vec<u8> = vec![7; 20_000];
        let local = local_file(&dir, "in.bin", &content);
        let stream = MockStream::new(harness.strand(), b"");
        sftp.put_stream("/remote/out.bin.filepart", stream.clone());

        let mut op = UploadOperation::new(
            sftp.as_weak_dyn(),
            UploadOptions {
                remote_path: PathBuf::from("/remote/out.bin"),
                local_path: local,
                ..UploadOptions::default()
            },
        );
        assert!(matches!(op.work(), Ok(WorkStatus::MoreWork)));

        op.cancel(true).unwrap();
        assert_eq!(op.state(), OperationState::Canceled);
        assert!(stream.close_calls.load(AtomicOrdering::SeqCst) >= 1);
        assert!(sftp.renames.lock().unwrap().is_empty());

        op.cancel(true).unwrap();
        assert_eq!(op.state(), OperationState::Canceled);
    }
}
