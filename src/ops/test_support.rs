use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{SftpError, SFTP_NO_SUCH_FILE};
use crate::events::EventSink;
use crate::processing::{ProcessingStrand, ProcessingThread};
use crate::promise::{self, Future};
use crate::sftp::file_stream::ChunkCallback;
use crate::sftp::{DirectoryEntry, EntryKind, Limits, RemoteFileStream, RemoteSftp};

/// Started processing thread + strand, the fixture every operation test
/// builds on.
pub(crate) struct TestHarness {
    pub thread: ProcessingThread,
}

impl TestHarness {
    pub fn new() -> Self {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        Self { thread }
    }

    pub fn strand(&self) -> ProcessingStrand {
        self.thread.create_strand()
    }
}

pub(crate) fn no_such_file() -> SftpError {
    SftpError {
        message: "no such file".to_string(),
        sftp_code: SFTP_NO_SUCH_FILE,
        ..SftpError::default()
    }
}

pub(crate) fn file_entry(name: &str, kind: EntryKind, size: u64) -> DirectoryEntry {
    DirectoryEntry {
        name: name.to_string(),
        kind,
        size,
        uid: 1000,
        gid: 1000,
        permissions: match kind {
            EntryKind::Directory => 0o040755,
            _ => 0o100644,
        },
        atime: 0,
        mtime: 0,
    }
}

/// Scripted in-memory remote file. Futures resolve immediately; the strand
/// only exists so operations can flush it on drop.
pub(crate) struct MockStream {
    strand: ProcessingStrand,
    pub content: Mutex<Vec<u8>>,
    pub position: Mutex<u64>,
    pub written: Mutex<Vec<u8>>,
    pub stat_size: Mutex<Option<u64>>,
    pub stat_error: Mutex<Option<SftpError>>,
    pub write_error: Mutex<Option<SftpError>>,
    pub permissions: u32,
    pub read_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub seeks: Mutex<Vec<u64>>,
    pub limits: Limits,
}

impl MockStream {
    pub fn new(strand: ProcessingStrand, content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            strand,
            content: Mutex::new(content.to_vec()),
            position: Mutex::new(0),
            written: Mutex::new(Vec::new()),
            stat_size: Mutex::new(None),
            stat_error: Mutex::new(None),
            write_error: Mutex::new(None),
            permissions: 0o100644,
            read_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
            limits: Limits::default(),
        })
    }

    pub fn as_weak_dyn(self: &Arc<Self>) -> Weak<dyn RemoteFileStream> {
        let strong: Arc<dyn RemoteFileStream> = Arc::clone(self) as Arc<dyn RemoteFileStream>;
        // The weak handle points at the same allocation as `self`.
        let weak = Arc::downgrade(&strong);
        drop(strong);
        weak
    }

    fn size(&self) -> u64 {
        self.stat_size
            .lock()
            .unwrap()
            .unwrap_or(self.content.lock().unwrap().len() as u64)
    }
}

impl RemoteFileStream for MockStream {
    fn seek(&self, pos: u64) -> Future<Result<(), SftpError>> {
        self.seeks.lock().unwrap().push(pos);
        *self.position.lock().unwrap() = pos;
        promise::ready(Ok(()))
    }

    fn tell(&self) -> Future<Result<u64, SftpError>> {
        promise::ready(Ok(*self.position.lock().unwrap()))
    }

    fn rewind(&self) -> Future<Result<(), SftpError>> {
        self.seek(0)
    }

    fn stat(&self) -> Future<Result<DirectoryEntry, SftpError>> {
        if let Some(error) = self.stat_error.lock().unwrap().clone() {
            return promise::ready(Err(error));
        }
        let mut entry = file_entry("", EntryKind::File, self.size());
        entry.permissions = self.permissions;
        promise::ready(Ok(entry))
    }

    fn read_some(&self, max_len: usize) -> Future<Result<Vec<u8>, SftpError>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.content.lock().unwrap();
        let mut position = self.position.lock().unwrap();
        let start = (*position as usize).min(content.len());
        let end = (start + max_len.min(self.limits.max_read_len)).min(content.len());
        let chunk = content[start..end].to_vec();
        *position = end as u64;
        promise::ready(Ok(chunk))
    }

    fn read_all(&self, mut on_chunk: ChunkCallback) -> Future<Result<u64, SftpError>> {
        let mut total = 0u64;
        loop {
            let chunk = match self.read_some(4096).try_take() {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return promise::ready(Err(e)),
                _ => break,
            };
            if chunk.is_empty() {
                on_chunk(&[]);
                break;
            }
            total += chunk.len() as u64;
            if !on_chunk(&chunk) {
                break;
            }
        }
        promise::ready(Ok(total))
    }

    fn write(&self, data: Vec<u8>) -> Future<Result<(), SftpError>> {
        if let Some(error) = self.write_error.lock().unwrap().clone() {
            return promise::ready(Err(error));
        }
        *self.position.lock().unwrap() += data.len() as u64;
        self.written.lock().unwrap().extend_from_slice(&data);
        promise::ready(Ok(()))
    }

    fn read_length_limit(&self) -> usize {
        self.limits.max_read_len
    }

    fn write_length_limit(&self) -> usize {
        self.limits.max_write_len
    }

    fn close(&self, _is_back_element: bool) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn strand(&self) -> Option<ProcessingStrand> {
        Some(self.strand.clone())
    }
}

/// Scripted remote filesystem for scan, upload, bulk and queue tests.
pub(crate) struct MockSftp {
    strand: ProcessingStrand,
    pub stats: Mutex<HashMap<PathBuf, Result<DirectoryEntry, SftpError>>>,
    pub listings: Mutex<HashMap<PathBuf, Vec<DirectoryEntry>>>,
    pub streams: Mutex<HashMap<PathBuf, Arc<MockStream>>>,
    pub opened: Mutex<Vec<(PathBuf, ssh2::OpenFlags)>>,
    pub renames: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub rename_error: Mutex<Option<SftpError>>,
}

impl MockSftp {
    pub fn new(strand: ProcessingStrand) -> Arc<Self> {
        Arc::new(Self {
            strand,
            stats: Mutex::new(HashMap::new()),
            listings: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            renames: Mutex::new(Vec::new()),
            rename_error: Mutex::new(None),
        })
    }

    pub fn as_weak_dyn(self: &Arc<Self>) -> Weak<dyn RemoteSftp> {
        let strong: Arc<dyn RemoteSftp> = Arc::clone(self) as Arc<dyn RemoteSftp>;
        let weak = Arc::downgrade(&strong);
        drop(strong);
        weak
    }

    pub fn put_stat(&self, path: impl Into<PathBuf>, entry: DirectoryEntry) {
        self.stats.lock().unwrap().insert(path.into(), Ok(entry));
    }

    pub fn put_listing(&self, path: impl Into<PathBuf>, entries: Vec<DirectoryEntry>) {
        self.listings.lock().unwrap().insert(path.into(), entries);
    }

    pub fn put_stream(&self, path: impl Into<PathBuf>, stream: Arc<MockStream>) {
        self.streams.lock().unwrap().insert(path.into(), stream);
    }
}

impl RemoteSftp for MockSftp {
    fn stat(&self, path: &Path) -> Future<Result<DirectoryEntry, SftpError>> {
        let result = self
            .stats
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| Err(no_such_file()));
        promise::ready(result)
    }

    fn list_directory(&self, path: &Path) -> Future<Result<Vec<DirectoryEntry>, SftpError>> {
        let result = self
            .listings
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(no_such_file);
        promise::ready(result)
    }

    fn open_file(
        &self,
        path: &Path,
        flags: ssh2::OpenFlags,
        _mode: i32,
    ) -> Future<Result<Weak<dyn RemoteFileStream>, SftpError>> {
        self.opened.lock().unwrap().push((path.to_path_buf(), flags));
        let stream = self.streams.lock().unwrap().get(path).cloned();
        match stream {
            Some(stream) => promise::ready(Ok(stream.as_weak_dyn())),
            None => promise::ready(Err(no_such_file())),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Future<Result<(), SftpError>> {
        if let Some(error) = self.rename_error.lock().unwrap().clone() {
            return promise::ready(Err(error));
        }
        self.renames
            .lock()
            .unwrap()
            .push((from.to_path_buf(), to.to_path_buf()));
        promise::ready(Ok(()))
    }

    fn strand(&self) -> ProcessingStrand {
        self.strand.clone()
    }
}

/// Event sink that records everything for assertions.
pub(crate) struct CollectingSink {
    pub events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn on_channel_suffix(&self, suffix: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(channel, _)| channel.ends_with(suffix))
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Polls until at least `count` events arrived on the channel.
    pub fn wait_for(&self, suffix: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.on_channel_suffix(suffix).len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, channel: &str, payload: serde_json::Value) {
        self.events.lock().unwrap().push((channel.to_string(), payload));
    }
}
