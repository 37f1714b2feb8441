use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{detached, DirectoryEntry, Limits, SftpSession};
use crate::error::SftpError;
use crate::processing::ProcessingStrand;
use crate::promise::{self, Future, Promise};
use crate::util::{io_retry, ssh2_retry, NATIVE_CALL_TIMEOUT};

const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Chunk callback for [`RemoteFileStream::read_all`]; return false to stop.
pub type ChunkCallback = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// One open remote file. The live implementation runs every call through
/// the owning SFTP session's strand; the trait is the seam the transfer
/// operations (and their tests) work against.
pub trait RemoteFileStream: Send + Sync {
    fn seek(&self, pos: u64) -> Future<Result<(), SftpError>>;
    fn tell(&self) -> Future<Result<u64, SftpError>>;
    fn rewind(&self) -> Future<Result<(), SftpError>>;
    fn stat(&self) -> Future<Result<DirectoryEntry, SftpError>>;
    /// One read, bounded by the read limit; the returned chunk may be
    /// shorter. Empty means end of file.
    fn read_some(&self, max_len: usize) -> Future<Result<Vec<u8>, SftpError>>;
    /// Reads to the end (or until the callback declines more data),
    /// scheduling one strand task per chunk. Resolves with the total bytes
    /// read.
    fn read_all(&self, on_chunk: ChunkCallback) -> Future<Result<u64, SftpError>>;
    /// Writes all of `data`, splitting it into write-limit sized parts.
    fn write(&self, data: Vec<u8>) -> Future<Result<(), SftpError>>;
    fn read_length_limit(&self) -> usize;
    fn write_length_limit(&self) -> usize;
    /// Closes the native handle inside the strand and detaches from the
    /// owning session.
    fn close(&self, is_back_element: bool);
    fn strand(&self) -> Option<ProcessingStrand>;
}

pub struct FileStream {
    sftp: Mutex<Weak<SftpSession>>,
    /// Shared with pending strand tasks, so the native handle outlives the
    /// wrapper until the last queued call has run.
    raw: Arc<Mutex<Option<ssh2::File>>>,
    limits: Limits,
}

impl FileStream {
    pub(crate) fn new(sftp: Weak<SftpSession>, file: ssh2::File, limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            sftp: Mutex::new(sftp),
            raw: Arc::new(Mutex::new(Some(file))),
            limits,
        })
    }

    pub(crate) fn identity(&self) -> &Arc<Mutex<Option<ssh2::File>>> {
        &self.raw
    }

    fn owner(&self) -> Option<Arc<SftpSession>> {
        self.sftp.lock().unwrap().upgrade()
    }

    fn perform_promise<R, F>(&self, f: F) -> Future<Result<R, SftpError>>
    where
        F: FnOnce(&mut ssh2::File) -> Result<R, SftpError> + Send + 'static,
        R: Send + 'static,
    {
        let Some(sftp) = self.owner() else {
            return detached();
        };
        let raw = Arc::clone(&self.raw);
        sftp.perform_promise(move || {
            let mut guard = raw.lock().unwrap();
            let file = guard.as_mut().ok_or_else(SftpError::file_closed)?;
            f(file)
        })
    }

    /// Surrenders the native handle to the caller; the stream becomes inert.
    pub fn release(&self) -> Option<ssh2::File> {
        *self.sftp.lock().unwrap() = Weak::new();
        self.raw.lock().unwrap().take()
    }

    /// Teardown path used by the owning session, already on its thread.
    pub(crate) fn close_on_owner_thread(&self, sftp: &SftpSession, is_back_element: bool) {
        self.raw.lock().unwrap().take();
        sftp.remove_file_stream(&self.raw, is_back_element);
    }
}

impl RemoteFileStream for FileStream {
    fn seek(&self, pos: u64) -> Future<Result<(), SftpError>> {
        self.perform_promise(move |file| {
            file.seek(SeekFrom::Start(pos))
                .map(drop)
                .map_err(|e| SftpError::from_io(&e))
        })
    }

    fn tell(&self) -> Future<Result<u64, SftpError>> {
        self.perform_promise(|file| {
            file.seek(SeekFrom::Current(0))
                .map_err(|e| SftpError::from_io(&e))
        })
    }

    fn rewind(&self) -> Future<Result<(), SftpError>> {
        self.seek(0)
    }

    fn stat(&self) -> Future<Result<DirectoryEntry, SftpError>> {
        self.perform_promise(|file| {
            let stat = ssh2_retry(|| file.stat()).map_err(|e| SftpError::from_native(&e))?;
            Ok(DirectoryEntry::from_stat(String::new(), &stat))
        })
    }

    fn read_some(&self, max_len: usize) -> Future<Result<Vec<u8>, SftpError>> {
        let limit = self.limits.max_read_len;
        self.perform_promise(move |file| {
            let len = max_len.min(limit);
            if len == 0 {
                return Ok(Vec::new());
            }
            let mut buffer = vec![0u8; len];
            let n = io_retry(NATIVE_CALL_TIMEOUT, || file.read(&mut buffer))
                .map_err(|e| SftpError::from_io(&e))?;
            buffer.truncate(n);
            Ok(buffer)
        })
    }

    fn read_all(&self, on_chunk: ChunkCallback) -> Future<Result<u64, SftpError>> {
        let Some(sftp) = self.owner() else {
            return detached();
        };
        let (promise, future) = promise::promise();
        let state = ReadAllState {
            strand: sftp.strand(),
            raw: Arc::clone(&self.raw),
            callback: on_chunk,
            promise,
            total: 0,
            chunk_len: self.limits.max_read_len.min(4096).max(1),
        };
        schedule_read(state);
        future
    }

    fn write(&self, data: Vec<u8>) -> Future<Result<(), SftpError>> {
        if data.len() <= self.limits.max_write_len {
            return self.perform_promise(move |file| write_fully(file, &data));
        }

        let Some(sftp) = self.owner() else {
            return detached();
        };
        let (promise, future) = promise::promise();
        let state = WritePartState {
            strand: sftp.strand(),
            raw: Arc::clone(&self.raw),
            data,
            offset: 0,
            limit: self.limits.max_write_len,
            promise,
        };
        schedule_write_part(state);
        future
    }

    fn read_length_limit(&self) -> usize {
        self.limits.max_read_len
    }

    fn write_length_limit(&self) -> usize {
        self.limits.max_write_len
    }

    fn close(&self, is_back_element: bool) {
        let Some(sftp) = self.owner() else {
            // Owner already gone; just drop the handle.
            self.raw.lock().unwrap().take();
            return;
        };

        if sftp.strand().within_processing_thread() {
            self.close_on_owner_thread(&sftp, is_back_element);
            return;
        }

        let raw = Arc::clone(&self.raw);
        let sftp_for_task = Arc::clone(&sftp);
        let future = sftp.perform_promise(move || {
            raw.lock().unwrap().take();
            sftp_for_task.remove_file_stream(&raw, is_back_element);
            true
        });
        let _ = future.wait_timeout(CLOSE_WAIT);
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        self.owner().map(|sftp| sftp.strand())
    }
}

fn write_fully(file: &mut ssh2::File, data: &[u8]) -> Result<(), SftpError> {
    let mut offset = 0;
    while offset < data.len() {
        let written = io_retry(NATIVE_CALL_TIMEOUT, || file.write(&data[offset..]))
            .map_err(|e| SftpError::from_io(&e))?;
        if written == 0 {
            return Err(SftpError::short_write());
        }
        offset += written;
    }
    Ok(())
}

struct ReadAllState {
    strand: ProcessingStrand,
    raw: Arc<Mutex<Option<ssh2::File>>>,
    callback: ChunkCallback,
    promise: Promise<Result<u64, SftpError>>,
    total: u64,
    chunk_len: usize,
}

fn schedule_read(mut state: ReadAllState) {
    let strand = state.strand.clone();
    strand.push_task(move || {
        let outcome = {
            let mut guard = state.raw.lock().unwrap();
            match guard.as_mut() {
                None => Err(SftpError::file_closed()),
                Some(file) => {
                    let mut buffer = vec![0u8; state.chunk_len];
                    io_retry(NATIVE_CALL_TIMEOUT, || file.read(&mut buffer))
                        .map(|n| {
                            buffer.truncate(n);
                            buffer
                        })
                        .map_err(|e| SftpError::from_io(&e))
                }
            }
        };

        match outcome {
            Err(e) => {
                state.promise.set(Err(e));
                (state.callback)(&[]);
            }
            Ok(chunk) if chunk.is_empty() => {
                state.promise.set(Ok(state.total));
                (state.callback)(&[]);
            }
            Ok(chunk) => {
                state.total += chunk.len() as u64;
                if (state.callback)(&chunk) {
                    schedule_read(state);
                } else {
                    state.promise.set(Ok(state.total));
                }
            }
        }
    });
}

struct WritePartState {
    strand: ProcessingStrand,
    raw: Arc<Mutex<Option<ssh2::File>>>,
    data: Vec<u8>,
    offset: usize,
    limit: usize,
    promise: Promise<Result<(), SftpError>>,
}

fn schedule_write_part(mut state: WritePartState) {
    let strand = state.strand.clone();
    strand.push_task(move || {
        let outcome = {
            let mut guard = state.raw.lock().unwrap();
            match guard.as_mut() {
                None => Err(SftpError::file_closed()),
                Some(file) => {
                    let end = (state.offset + state.limit).min(state.data.len());
                    io_retry(NATIVE_CALL_TIMEOUT, || {
                        file.write(&state.data[state.offset..end])
                    })
                    .map_err(|e| SftpError::from_io(&e))
                }
            }
        };

        match outcome {
            Err(e) => state.promise.set(Err(e)),
            Ok(0) => state.promise.set(Err(SftpError::short_write())),
            Ok(written) => {
                state.offset += written;
                if state.offset >= state.data.len() {
                    state.promise.set(Ok(()));
                } else {
                    schedule_write_part(state);
                }
            }
        }
    });
}
