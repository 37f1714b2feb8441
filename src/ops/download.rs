use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Weak;
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
use crate::sftp::RemoteFileStream;

/// Read quantum; the actual request is additionally capped by the stream's
/// read limit.
const DOWNLOAD_CHUNK: usize = 8192;

pub struct DownloadOptions {
    pub remote_path: PathBuf,
    pub local_path: PathBuf,
    pub temp_file_suffix: String,
    pub may_overwrite: bool,
    pub reserve_space: bool,
    pub try_continue: bool,
    pub inherit_permissions: bool,
    pub do_cleanup: bool,
    pub permissions: Option<u32>,
    pub future_timeout: Duration,
    pub progress: ProgressCallback,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            remote_path: PathBuf::new(),
            local_path: PathBuf::new(),
            temp_file_suffix: DEFAULT_TEMP_FILE_SUFFIX.to_string(),
            may_overwrite: false,
            reserve_space: false,
            try_continue: false,
            inherit_permissions: false,
            do_cleanup: true,
            permissions: None,
            future_timeout: DEFAULT_FUTURE_TIMEOUT,
            progress: no_progress(),
        }
    }
}

impl DownloadOptions {
    /// Overlays session level transfer settings onto these defaults.
    pub fn apply_transfer(mut self, transfer: &TransferOptions) -> Self {
        if let Some(suffix) = &transfer.temp_file_suffix {
            self.temp_file_suffix = suffix.clone();
        }
        if let Some(v) = transfer.may_overwrite {
            self.may_overwrite = v;
        }
        if let Some(v) = transfer.reserve_space {
            self.reserve_space = v;
        }
        if let Some(v) = transfer.try_continue {
            self.try_continue = v;
        }
        if let Some(v) = transfer.inherit_permissions {
            self.inherit_permissions = v;
        }
        if let Some(v) = transfer.do_cleanup {
            self.do_cleanup = v;
        }
        if transfer.custom_permissions.is_some() {
            self.permissions = transfer.custom_permissions;
        }
        self
    }
}

/// Streams one remote file into a local `.part` sibling and renames it onto
/// the target once all bytes arrived.
pub struct DownloadOperation {
    core: OperationCore,
    stream: Weak<dyn RemoteFileStream>,
    remote_path: PathBuf,
    local_path: PathBuf,
    temp_file_suffix: String,
    may_overwrite: bool,
    reserve_space: bool,
    try_continue: bool,
    inherit_permissions: bool,
    do_cleanup: bool,
    permissions: Option<u32>,
    progress: ProgressCallback,
    local_file: Option<File>,
    file_size: u64,
    written: u64,
    future_timeout: Duration,
}

impl DownloadOperation {
    pub fn new(stream: Weak<dyn RemoteFileStream>, options: DownloadOptions) -> Self {
        Self {
            core: OperationCore::new(),
            stream,
            remote_path: options.remote_path,
            local_path: options.local_path,
            temp_file_suffix: sanitize_temp_file_suffix(&options.temp_file_suffix),
            may_overwrite: options.may_overwrite,
            reserve_space: options.reserve_space,
            try_continue: options.try_continue,
            inherit_permissions: options.inherit_permissions,
            do_cleanup: options.do_cleanup,
            permissions: options.permissions,
            progress: options.progress,
            local_file: None,
            file_size: 0,
            written: 0,
            future_timeout: options.future_timeout,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.local_path.clone().into_os_string();
        path.push(&self.temp_file_suffix);
        PathBuf::from(path)
    }

    fn enter_error_state(&mut self, error: OperationError) -> OperationError {
        self.core.state = OperationState::Failed;
        self.core.error = Some(error.clone());
        if let Err(cancel_error) = self.cancel_impl(false) {
            log::error!("download: failed to clean up after error: {cancel_error}");
        }
        error
    }

    pub(crate) fn prepare(&mut self) -> Result<(), OperationError> {
        if self.local_path.as_os_str().is_empty() {
            log::error!("download: invalid local path");
            return Err(OperationErrorKind::InvalidPath.into());
        }

        // Initial check; checked again right before the rename.
        if self.local_path.exists() && !self.may_overwrite {
            log::error!(
                "download: '{}' already exists and may not be overwritten",
                self.local_path.display()
            );
            return Err(OperationErrorKind::FileExists.into());
        }

        let stream = self
            .stream
            .upgrade()
            .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;

        let info = wait_operation(
            stream.stat(),
            self.future_timeout,
            OperationErrorKind::FileStatFailed,
        )?;
        self.file_size = info.size;

        self.open_or_adopt_file(&stream)?;

        if self.reserve_space && self.file_size != 0 {
            self.reserve_local_space()?;
        }

        log::info!(
            "download: prepared '{}' -> '{}' ({} bytes)",
            self.remote_path.display(),
            self.local_path.display(),
            self.file_size
        );
        Ok(())
    }

    fn open_or_adopt_file(
        &mut self,
        stream: &std::sync::Arc<dyn RemoteFileStream>,
    ) -> Result<(), OperationError> {
        let temp = self.temp_path();

        if self.try_continue && temp.exists() {
            let file = OpenOptions::new()
                .append(true)
                .open(&temp)
                .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?;
            let existing = file
                .metadata()
                .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))?
                .len();

            if existing == self.file_size {
                // Already complete, just not renamed; finalize will do that.
                log::info!(
                    "download: '{}' already complete, renaming in finalize",
                    temp.display()
                );
                self.local_file = None;
                self.written = existing;
                return Ok(());
            } else if existing > self.file_size {
                log::info!(
                    "download: '{}' is larger than the remote file, restarting",
                    temp.display()
                );
                drop(file);
                self.local_file = Some(open_truncated(&temp)?);
                self.written = 0;
            } else {
                log::info!(
                    "download: resuming '{}' at offset {existing}",
                    temp.display()
                );
                wait_operation(
                    stream.seek(existing),
                    self.future_timeout,
                    OperationErrorKind::FileStatFailed,
                )?;
                self.local_file = Some(file);
                self.written = existing;
            }
        } else {
            log::info!("download: starting new download to '{}'", temp.display());
            self.local_file = Some(open_truncated(&temp)?);
            self.written = 0;
        }

        Ok(())
    }

    fn reserve_local_space(&mut self) -> Result<(), OperationError> {
        let Some(file) = self.local_file.as_mut() else {
            return Ok(()); // adopted-complete; nothing to reserve
        };
        let restore = self.written;
        file.seek(SeekFrom::Start(self.file_size - 1))
            .and_then(|_| file.write_all(&[0]))
            .and_then(|_| file.seek(SeekFrom::Start(restore)))
            .map(drop)
            .map_err(|_| OperationError::new(OperationErrorKind::OpenFailure))
    }

    /// One read quantum. Returns true while more data is expected.
    pub(crate) fn read_once(&mut self) -> Result<bool, OperationError> {
        if self.core.state < OperationState::Prepared {
            return Err(OperationErrorKind::OperationNotPrepared.into());
        }

        if self.file_size == 0 || self.written >= self.file_size {
            return Ok(false);
        }

        if self.local_file.is_none() {
            return Err(OperationErrorKind::OpenFailure.into());
        }

        let stream = self
            .stream
            .upgrade()
            .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;

        let chunk = wait_operation(
            stream.read_some(DOWNLOAD_CHUNK.min(stream.read_length_limit())),
            self.future_timeout,
            OperationErrorKind::SftpError,
        )?;
        if chunk.is_empty() {
            return Ok(false);
        }

        let file = self.local_file.as_mut().expect("checked above");
        if file.write_all(&chunk).is_err() {
            log::error!("download: local write failed");
            return Err(OperationErrorKind::TargetFileNotGood.into());
        }

        self.written += chunk.len() as u64;
        (self.progress)(0, self.file_size, self.written);
        Ok(self.written < self.file_size)
    }

    pub(crate) fn finalize(&mut self) -> Result<(), OperationError> {
        if self.core.state == OperationState::Running {
            return Err(OperationErrorKind::CannotFinalizeDuringRead.into());
        }

        self.local_file = None;

        if self.local_path.exists() && !self.may_overwrite {
            log::error!(
                "download: '{}' appeared during transfer and may not be overwritten",
                self.local_path.display()
            );
            return Err(OperationErrorKind::FileExists.into());
        }

        if let Err(e) = fs::rename(self.temp_path(), &self.local_path) {
            log::error!("download: rename failed: {e}");
            return Err(OperationErrorKind::RenameFailure.into());
        }

        if self.inherit_permissions {
            let stream = self
                .stream
                .upgrade()
                .ok_or(OperationError::new(OperationErrorKind::FileStreamExpired))?;
            let info = wait_operation(
                stream.stat(),
                self.future_timeout,
                OperationErrorKind::FileStatFailed,
            )?;
            apply_mode(&self.local_path, info.permissions & 0o7777)
                .map_err(|_| OperationError::new(OperationErrorKind::CannotSetFilePermissions))?;
        } else if let Some(mode) = self.permissions {
            apply_mode(&self.local_path, mode)
                .map_err(|_| OperationError::new(OperationErrorKind::CannotSetFilePermissions))?;
        }

        log::info!(
            "download: finalized '{}' -> '{}'",
            self.remote_path.display(),
            self.local_path.display()
        );
        Ok(())
    }

    fn cancel_impl(&mut self, adopt_cancel_state: bool) -> Result<(), OperationError> {
        if adopt_cancel_state {
            log::info!(
                "download: '{}' -> '{}' canceled",
                self.remote_path.display(),
                self.local_path.display()
            );
            self.core.state = OperationState::Canceled;
        }
        self.cleanup();
        Ok(())
    }

    fn cleanup(&mut self) {
        self.local_file = None;

        if self.do_cleanup {
            let temp = self.temp_path();
            if temp.exists() {
                let _ = fs::remove_file(&temp);
            }
        }

        if let Some(stream) = self.stream.upgrade() {
            stream.close(false);
        }
    }
}

impl Operation for DownloadOperation {
    fn id(&self) -> &OperationId {
        &self.core.id
    }

    fn op_type(&self) -> OperationType {
        OperationType::Download
    }

    fn state(&self) -> OperationState {
        self.core.state
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        self.stream.upgrade().and_then(|s| s.strand())
    }

    fn work(&mut self) -> Result<WorkStatus, OperationError> {
        loop {
            match self.core.state {
                OperationState::NotStarted => self.core.state = OperationState::Preparing,
                OperationState::Preparing => {
                    if let Err(e) = self.prepare() {
                        log::error!("download: failed to prepare: {e}");
                        return Err(self.enter_error_state(e));
                    }
                    self.core.state = OperationState::Prepared;
                }
                OperationState::Prepared => self.core.state = OperationState::Running,
                OperationState::Running => match self.read_once() {
                    Err(e) => {
                        log::error!("download: failed to read: {e}");
                        return Err(self.enter_error_state(e));
                    }
                    Ok(true) => return Ok(WorkStatus::MoreWork),
                    Ok(false) => self.core.state = OperationState::Finalizing,
                },
                OperationState::Finalizing => {
                    if let Err(e) = self.finalize() {
                        log::error!("download: failed to finalize: {e}");
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

impl Drop for DownloadOperation {
    fn drop(&mut self) {
        let _ = self.cancel_impl(false);

        // Let queued stream tasks finish before the buffers go away.
        if let Some(strand) = self.strand() {
            let _ = strand.push_promise_task(|| ()).wait_timeout(self.future_timeout);
        }
    }
}

fn open_truncated(path: &std::path::Path) -> Result<File, OperationError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            log::error!("download: failed to open '{}': {e}", path.display());
            OperationError::new(OperationErrorKind::OpenFailure)
        })
}

#[cfg(unix)]
fn apply_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
