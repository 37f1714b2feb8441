use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;

use super::bulk::{BulkDownloadOperation, BulkDownloadOptions};
use super::download::{DownloadOperation, DownloadOptions};
use super::scan::{ScanOperation, ScanOptions, ScanResults};
use super::upload::{UploadOperation, UploadOptions};
use super::{wait_operation, Operation, OperationType, WorkStatus};
use crate::config::SftpOptions;
use crate::error::{OperationError, OperationErrorKind, SftpError};
use crate::events::{self, CompletionReason, EventSink};
use crate::ids::{OperationId, SessionId};
use crate::promise::FutureError;
use crate::sftp::RemoteSftp;

const QUEUE_START_THROTTLE: Duration = Duration::from_millis(10);
const QUEUE_MAX_THROTTLE: Duration = Duration::from_secs(2);

/// How many work passes may re-enter back-to-back before the driver yields
/// to the throttle timer again.
const UNTHROTTLED_BURST_LIMIT: u32 = 10;

const OPEN_WAIT: Duration = Duration::from_secs(5);

struct QueuedOperation {
    id: OperationId,
    operation: Box<dyn Operation>,
}

struct QueueState {
    operations: VecDeque<QueuedOperation>,
    paused: bool,
    stopping: bool,
    throttle: Duration,
    unthrottled: u32,
}

struct QueueInner {
    session_id: SessionId,
    sftp: Weak<dyn RemoteSftp>,
    options: SftpOptions,
    events: Arc<dyn EventSink>,
    state: Mutex<QueueState>,
    wake: Condvar,
}

/// Ordered queue of long-running file operations bound to one SFTP session.
/// A dedicated driver thread repeatedly calls `work()` on the front
/// operations; quick quanta run back-to-back, an idle queue backs off
/// exponentially up to the throttle ceiling.
pub struct OperationQueue {
    inner: Arc<QueueInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn new(
        session_id: SessionId,
        sftp: Weak<dyn RemoteSftp>,
        options: SftpOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                session_id,
                sftp,
                options,
                events,
                state: Mutex::new(QueueState {
                    operations: VecDeque::new(),
                    paused: false,
                    stopping: false,
                    throttle: QUEUE_START_THROTTLE,
                    unthrottled: 0,
                }),
                wake: Condvar::new(),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut driver = self.driver.lock().unwrap();
        if driver.is_some() {
            return;
        }
        self.inner.state.lock().unwrap().stopping = false;
        let inner = Arc::clone(&self.inner);
        *driver = Some(std::thread::spawn(move || driver_loop(inner)));
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopping = true;
        }
        self.inner.wake.notify_all();
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paused(&self) -> bool {
        self.inner.state.lock().unwrap().paused
    }

    pub fn pause(&self, paused: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.paused = paused;
            state.throttle = QUEUE_START_THROTTLE;
            state.unthrottled = 0;
        }
        self.inner.wake.notify_all();
    }

    /// Removes every queued operation with this id (a scan and its bulk
    /// download share one). Cleanup runs through the operations' drop path.
    pub fn cancel(&self, id: &OperationId) {
        let removed: Vec<QueuedOperation> = {
            let mut state = self.inner.state.lock().unwrap();
            let mut kept = VecDeque::new();
            let mut removed = Vec::new();
            while let Some(entry) = state.operations.pop_front() {
                if &entry.id == id {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.operations = kept;
            state.throttle = QUEUE_START_THROTTLE;
            removed
        };
        self.inner.wake.notify_all();

        for mut entry in removed {
            let _ = entry.operation.cancel(true);
            self.inner
                .emit_completed(CompletionReason::Canceled, &entry, None);
        }
    }

    pub fn cancel_all(&self) {
        let removed: Vec<QueuedOperation> = {
            let mut state = self.inner.state.lock().unwrap();
            state.throttle = QUEUE_START_THROTTLE;
            state.operations.drain(..).collect()
        };
        self.inner.wake.notify_all();

        for mut entry in removed {
            let _ = entry.operation.cancel(true);
            self.inner
                .emit_completed(CompletionReason::Canceled, &entry, None);
        }
        log::info!("all operations in the queue have been canceled");
    }

    /// Stats the remote target and enqueues either a single download or a
    /// scan + bulk download pair sharing one id.
    pub fn add_download_operation(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<PathBuf>,
    ) -> Result<OperationId, OperationError> {
        let local_path = local_path.into();
        let remote_path = remote_path.into();

        let sftp = self.upgrade_sftp()?;
        let timeout = self.inner.options.operation_timeout();

        let info = wait_operation(
            sftp.stat(&remote_path),
            timeout,
            OperationErrorKind::SftpError,
        )?;

        let operation_id = OperationId::generate();

        if info.is_regular_file() {
            let stream = match sftp
                .open_file(&remote_path, ssh2::OpenFlags::READ, 0)
                .wait_timeout(OPEN_WAIT)
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(OperationError::sftp(OperationErrorKind::SftpError, e)),
                Err(FutureError::TimedOut) | Err(FutureError::Broken) => {
                    return Err(OperationErrorKind::OpenFailure.into())
                }
            };

            let transfer = self.inner.options.download_options.clone().unwrap_or_default();
            let options = DownloadOptions {
                remote_path: remote_path.clone(),
                local_path,
                progress: self.download_progress_emitter(operation_id.clone()),
                ..DownloadOptions::default()
            }
            .apply_transfer(&transfer);

            self.push(QueuedOperation {
                id: operation_id.clone(),
                operation: Box::new(DownloadOperation::new(stream, options)),
            });
            self.emit_added(&operation_id, OperationType::Download, Some(info.size));
        } else if info.is_dir() {
            let results: ScanResults = ScanResults::default();

            let scan = ScanOperation::new(
                Weak::clone(&self.inner.sftp),
                Arc::clone(&results),
                ScanOptions {
                    remote_path: remote_path.clone(),
                    progress: self.scan_progress_emitter(operation_id.clone()),
                    ..ScanOptions::default()
                },
            );

            let bulk = BulkDownloadOperation::new(
                Weak::clone(&self.inner.sftp),
                results,
                BulkDownloadOptions {
                    remote_root: remote_path,
                    local_root: local_path,
                    transfer: self.inner.options.download_options.clone().unwrap_or_default(),
                    overall_progress: self.bulk_progress_emitter(operation_id.clone()),
                    ..BulkDownloadOptions::default()
                },
            );

            self.push(QueuedOperation {
                id: operation_id.clone(),
                operation: Box::new(scan),
            });
            self.push(QueuedOperation {
                id: operation_id.clone(),
                operation: Box::new(bulk),
            });
            self.emit_added(&operation_id, OperationType::Scan, None);
            self.emit_added(&operation_id, OperationType::BulkDownload, None);
        } else {
            log::error!("remote path is neither a file nor a directory");
            return Err(OperationErrorKind::OperationNotPossibleOnFileType.into());
        }

        Ok(operation_id)
    }

    pub fn add_upload_operation(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<PathBuf>,
    ) -> Result<OperationId, OperationError> {
        let local_path = local_path.into();
        let remote_path = remote_path.into();

        // A missing local file is still enqueued; the operation reports
        // FileNotFound through the regular completion event.
        let total_bytes = match std::fs::metadata(&local_path) {
            Ok(metadata) if metadata.is_dir() => {
                return Err(OperationErrorKind::OperationNotPossibleOnFileType.into())
            }
            Ok(metadata) => Some(metadata.len()),
            Err(_) => None,
        };

        let operation_id = OperationId::generate();
        let transfer = self.inner.options.upload_options.clone().unwrap_or_default();
        let options = UploadOptions {
            remote_path,
            local_path,
            progress: self.upload_progress_emitter(operation_id.clone()),
            ..UploadOptions::default()
        }
        .apply_transfer(&transfer);

        self.push(QueuedOperation {
            id: operation_id.clone(),
            operation: Box::new(UploadOperation::new(Weak::clone(&self.inner.sftp), options)),
        });
        self.emit_added(&operation_id, OperationType::Upload, total_bytes);
        Ok(operation_id)
    }

    fn upgrade_sftp(&self) -> Result<Arc<dyn RemoteSftp>, OperationError> {
        self.inner.sftp.upgrade().ok_or(OperationError::sftp(
            OperationErrorKind::SftpError,
            SftpError::owner_dropped(),
        ))
    }

    fn push(&self, entry: QueuedOperation) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.operations.push_back(entry);
            state.throttle = QUEUE_START_THROTTLE;
            state.unthrottled = 0;
        }
        self.inner.wake.notify_all();
    }

    fn emit_added(&self, id: &OperationId, kind: OperationType, total_bytes: Option<u64>) {
        events::emit(
            self.inner.events.as_ref(),
            &events::operation_added_channel(&self.inner.session_id),
            &events::OperationAdded {
                operation_id: id.clone(),
                kind,
                total_bytes,
            },
        );
    }

    fn download_progress_emitter(&self, id: OperationId) -> super::ProgressCallback {
        let events = Arc::clone(&self.inner.events);
        let channel = events::download_progress_channel(&self.inner.session_id);
        Box::new(move |min, max, current| {
            events::emit(
                events.as_ref(),
                &channel,
                &events::TransferProgress {
                    operation_id: id.clone(),
                    min,
                    max,
                    current,
                },
            );
        })
    }

    fn upload_progress_emitter(&self, id: OperationId) -> super::ProgressCallback {
        let events = Arc::clone(&self.inner.events);
        let channel = events::upload_progress_channel(&self.inner.session_id);
        Box::new(move |min, max, current| {
            events::emit(
                events.as_ref(),
                &channel,
                &events::TransferProgress {
                    operation_id: id.clone(),
                    min,
                    max,
                    current,
                },
            );
        })
    }

    fn scan_progress_emitter(&self, id: OperationId) -> super::scan::ScanProgressCallback {
        let events = Arc::clone(&self.inner.events);
        let channel = events::scan_progress_channel(&self.inner.session_id);
        Box::new(move |total_bytes, current_index, total_entries| {
            events::emit(
                events.as_ref(),
                &channel,
                &events::ScanProgress {
                    operation_id: id.clone(),
                    total_bytes,
                    current_index,
                    total_entries,
                },
            );
        })
    }

    fn bulk_progress_emitter(&self, id: OperationId) -> super::bulk::BulkProgressCallback {
        let events = Arc::clone(&self.inner.events);
        let channel = events::bulk_download_progress_channel(&self.inner.session_id);
        Box::new(move |progress| {
            events::emit(
                events.as_ref(),
                &channel,
                &events::BulkDownloadProgress {
                    operation_id: id.clone(),
                    current_file: progress.current_file.display().to_string(),
                    current_file_bytes: progress.current_file_bytes,
                    current_file_total_bytes: progress.current_file_total_bytes,
                    bytes_current: progress.bytes_current,
                    bytes_total: progress.bytes_total,
                    file_current_index: progress.file_current_index,
                    file_count: progress.file_count,
                },
            );
        })
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl QueueInner {
    fn emit_completed(
        &self,
        reason: CompletionReason,
        entry: &QueuedOperation,
        error: Option<OperationError>,
    ) {
        if let Some(error) = &error {
            log::error!("operation {} failed: {error}", entry.id.value());
        }
        events::emit(
            self.events.as_ref(),
            &events::operation_completed_channel(&self.session_id),
            &events::OperationCompleted {
                reason,
                operation_id: entry.id.clone(),
                completion_time: Utc::now(),
                local_path: entry.operation.local_path(),
                remote_path: entry.operation.remote_path(),
                error,
            },
        );
    }
}

fn driver_loop(inner: Arc<QueueInner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.stopping {
            break;
        }

        if state.paused || state.operations.is_empty() {
            state.unthrottled = 0;
            state.throttle = QUEUE_START_THROTTLE;
            state = inner.wake.wait(state).unwrap();
            continue;
        }

        let worked = work_pass(&inner, &mut state);
        if state.stopping {
            break;
        }

        if worked {
            state.unthrottled += 1;
            if state.unthrottled < UNTHROTTLED_BURST_LIMIT {
                state.throttle = QUEUE_START_THROTTLE;
                continue;
            }
            state.unthrottled = 0;
        }

        state.throttle = (state.throttle * 2).min(QUEUE_MAX_THROTTLE);
        let throttle = state.throttle;
        let (next, _) = inner.wake.wait_timeout(state, throttle).unwrap();
        state = next;
    }
}

/// One pass over the front of the queue. Every operation claims a share of
/// the parallelism budget through `parallel_work_doable`; a barrier never
/// runs alongside its successors. Returns whether any operation asked to be
/// rescheduled without delay.
///
/// A terminal operation is removed at its index, not by popping the front:
/// with a parallelism above one the settling element can sit behind a still
/// running one, and dropping the front there would discard a live operation
/// while keeping the terminal one.
fn work_pass(inner: &QueueInner, state: &mut QueueState) -> bool {
    let mut slots = inner.options.concurrency();

    let mut more_work = false;
    let mut index = 0;
    while index < state.operations.len() && slots > 0 {
        if index > 0 && state.operations[index].operation.is_barrier() {
            break;
        }

        let claimed = state.operations[index]
            .operation
            .parallel_work_doable(slots)
            .clamp(1, slots);

        match state.operations[index].operation.work() {
            Err(error) => {
                let entry = state
                    .operations
                    .remove(index)
                    .expect("index is within bounds");
                inner.emit_completed(CompletionReason::Failed, &entry, Some(error));
                // Another pass recomputes offsets instead of fixing them up.
                return true;
            }
            Ok(WorkStatus::Complete) => {
                let entry = state
                    .operations
                    .remove(index)
                    .expect("index is within bounds");
                log::info!("operation completed: {}", entry.id.value());
                inner.emit_completed(CompletionReason::Completed, &entry, None);
                return true;
            }
            Ok(WorkStatus::MoreWork) => {
                more_work = true;
            }
        }

        if state.operations[index].operation.is_barrier() {
            break;
        }
        slots -= claimed;
        index += 1;
    }
    more_work
}
