pub mod file_stream;

pub use file_stream::{FileStream, RemoteFileStream};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::SftpError;
use crate::processing::ProcessingStrand;
use crate::promise::{self, Future};
use crate::session::SessionInner;
use crate::util::ssh2_retry;

const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Server-advertised transfer caps. libssh2 does not negotiate
/// `limits@openssh.com`, so these report its fixed SFTP packet ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_read_len: usize,
    pub max_write_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_read_len: 30_000,
            max_write_len: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Attributes of one remote file or directory, as far as libssh2 surfaces
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
    pub atime: u64,
    pub mtime: u64,
}

impl DirectoryEntry {
    pub(crate) fn from_stat(name: String, stat: &ssh2::FileStat) -> Self {
        let permissions = stat.perm.unwrap_or(0);
        let kind = if stat.is_dir() {
            EntryKind::Directory
        } else if stat.is_file() {
            EntryKind::File
        } else if permissions & 0o170000 == 0o120000 {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        };
        Self {
            name,
            kind,
            size: stat.size.unwrap_or(0),
            uid: stat.uid.unwrap_or(0),
            gid: stat.gid.unwrap_or(0),
            permissions,
            atime: stat.atime.unwrap_or(0),
            mtime: stat.mtime.unwrap_or(0),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_regular_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// The filesystem surface the transfer operations work against. The live
/// implementation is [`SftpSession`]; tests drive the operations with mocks.
pub trait RemoteSftp: Send + Sync {
    fn stat(&self, path: &Path) -> Future<Result<DirectoryEntry, SftpError>>;
    fn list_directory(&self, path: &Path) -> Future<Result<Vec<DirectoryEntry>, SftpError>>;
    fn open_file(
        &self,
        path: &Path,
        flags: ssh2::OpenFlags,
        mode: i32,
    ) -> Future<Result<Weak<dyn RemoteFileStream>, SftpError>>;
    fn rename(&self, from: &Path, to: &Path) -> Future<Result<(), SftpError>>;
    fn strand(&self) -> ProcessingStrand;
}

/// One SFTP sub-session on an [`SshSession`](crate::session::SshSession).
/// Every call runs on the session's processing thread, serialised through
/// this session's own strand.
pub struct SftpSession {
    owner: Weak<SessionInner>,
    strand: ProcessingStrand,
    raw: Mutex<Option<ssh2::Sftp>>,
    file_streams: Mutex<Vec<Arc<FileStream>>>,
    limits: Limits,
    self_weak: Mutex<Weak<SftpSession>>,
}

impl SftpSession {
    pub(crate) fn new(
        owner: Weak<SessionInner>,
        strand: ProcessingStrand,
        raw: ssh2::Sftp,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            owner,
            strand,
            raw: Mutex::new(Some(raw)),
            file_streams: Mutex::new(Vec::new()),
            limits: Limits::default(),
            self_weak: Mutex::new(Weak::new()),
        });
        *session.self_weak.lock().unwrap() = Arc::downgrade(&session);
        session
    }

    fn weak(&self) -> Weak<Self> {
        self.self_weak.lock().unwrap().clone()
    }

    pub fn strand(&self) -> ProcessingStrand {
        self.strand.clone()
    }

    pub fn perform<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.strand.push_task(task)
    }

    pub fn perform_promise<F, R>(&self, task: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.strand.push_promise_task(task)
    }

    fn with_raw<R, F>(&self, path_hint: &Path, f: F) -> Result<R, SftpError>
    where
        F: FnOnce(&ssh2::Sftp) -> Result<R, ssh2::Error>,
    {
        let guard = self.raw.lock().unwrap();
        let raw = guard.as_ref().ok_or_else(SftpError::file_closed)?;
        f(raw).map_err(|e| {
            let err = SftpError::from_native(&e);
            log::debug!("sftp call on '{}' failed: {err}", path_hint.display());
            err
        })
    }

    pub fn list_directory(
        &self,
        path: impl Into<PathBuf>,
    ) -> Future<Result<Vec<DirectoryEntry>, SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            let entries =
                this.with_raw(&path, |sftp| ssh2_retry(|| sftp.readdir(&path)))?;
            // Some servers emit "." and ".." entries, at arbitrary positions.
            Ok(entries
                .iter()
                .filter_map(|(entry_path, stat)| {
                    let name = entry_path.file_name()?.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(DirectoryEntry::from_stat(name, stat))
                })
                .collect())
        })
    }

    pub fn create_directory(
        &self,
        path: impl Into<PathBuf>,
        mode: i32,
    ) -> Future<Result<(), SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&path, |sftp| ssh2_retry(|| sftp.mkdir(&path, mode)))
        })
    }

    /// Creates the file if it does not exist, then closes it again.
    pub fn create_file(
        &self,
        path: impl Into<PathBuf>,
        mode: i32,
    ) -> Future<Result<(), SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&path, |sftp| {
                ssh2_retry(|| {
                    sftp.open_mode(
                        &path,
                        ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE,
                        mode,
                        ssh2::OpenType::File,
                    )
                })
                .map(drop)
            })
        })
    }

    pub fn remove_file(&self, path: impl Into<PathBuf>) -> Future<Result<(), SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&path, |sftp| ssh2_retry(|| sftp.unlink(&path)))
        })
    }

    pub fn remove_directory(&self, path: impl Into<PathBuf>) -> Future<Result<(), SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&path, |sftp| ssh2_retry(|| sftp.rmdir(&path)))
        })
    }

    pub fn stat(&self, path: impl Into<PathBuf>) -> Future<Result<DirectoryEntry, SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            let stat = this.with_raw(&path, |sftp| ssh2_retry(|| sftp.stat(&path)))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(DirectoryEntry::from_stat(name, &stat))
        })
    }

    pub fn set_stat(
        &self,
        path: impl Into<PathBuf>,
        stat: ssh2::FileStat,
    ) -> Future<Result<(), SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&path, |sftp| ssh2_retry(|| sftp.setstat(&path, stat.clone())))
        })
    }

    pub fn chown(
        &self,
        path: impl Into<PathBuf>,
        uid: u32,
        gid: u32,
    ) -> Future<Result<(), SftpError>> {
        self.set_stat(
            path,
            ssh2::FileStat {
                size: None,
                uid: Some(uid),
                gid: Some(gid),
                perm: None,
                atime: None,
                mtime: None,
            },
        )
    }

    pub fn chmod(&self, path: impl Into<PathBuf>, mode: u32) -> Future<Result<(), SftpError>> {
        self.set_stat(
            path,
            ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            },
        )
    }

    pub fn rename(
        &self,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
    ) -> Future<Result<(), SftpError>> {
        let from = from.into();
        let to = to.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            this.with_raw(&from, |sftp| ssh2_retry(|| sftp.rename(&from, &to, None)))
        })
    }

    /// Opens a remote file and wraps it in a [`FileStream`] owned by this
    /// session. The caller only receives a weak handle; closing the session
    /// tears down all streams it still owns.
    pub fn open_file(
        &self,
        path: impl Into<PathBuf>,
        flags: ssh2::OpenFlags,
        mode: i32,
    ) -> Future<Result<Weak<dyn RemoteFileStream>, SftpError>> {
        let path = path.into();
        let weak = self.weak();
        self.strand.push_promise_task(move || {
            let this = weak.upgrade().ok_or_else(SftpError::owner_dropped)?;
            let file = this.with_raw(&path, |sftp| {
                ssh2_retry(|| sftp.open_mode(&path, flags, mode, ssh2::OpenType::File))
            })?;

            let stream = FileStream::new(this.weak(), file, this.limits);
            this.file_streams.lock().unwrap().push(Arc::clone(&stream));

            let as_dyn: Arc<dyn RemoteFileStream> = stream;
            Ok(Arc::downgrade(&as_dyn))
        })
    }

    pub fn limits(&self) -> Future<Result<Limits, SftpError>> {
        let limits = self.limits;
        self.strand.push_promise_task(move || Ok(limits))
    }

    /// Strictly final: destroys all live file streams, drops the native
    /// handle, detaches from the owning session and rejects every further
    /// submission. `is_back_element` lets the owner pop in O(1) when it
    /// knows this is the last session in its list.
    pub fn close(&self, is_back_element: bool) -> bool {
        if self.strand.is_finalized() {
            return false;
        }

        if self.strand.within_processing_thread() {
            self.strand.finalize();
            self.teardown(is_back_element);
            return true;
        }

        let weak = self.weak();
        let future = self.strand.push_final_promise_task(move || {
            if let Some(this) = weak.upgrade() {
                this.teardown(is_back_element);
            }
            true
        });
        future.wait_timeout(CLOSE_WAIT).unwrap_or(false)
    }

    /// Session-shutdown path, already on the processing thread.
    pub(crate) fn shutdown_on_thread(&self) {
        self.strand.finalize();
        self.teardown(true);
    }

    fn teardown(&self, is_back_element: bool) {
        loop {
            let stream = self.file_streams.lock().unwrap().last().cloned();
            match stream {
                Some(stream) => stream.close_on_owner_thread(self, true),
                None => break,
            }
        }
        *self.raw.lock().unwrap() = None;

        if let (Some(owner), Some(this)) = (self.owner.upgrade(), self.weak().upgrade()) {
            owner.remove_sftp_session(&this, is_back_element);
        }
    }

    pub(crate) fn remove_file_stream(
        &self,
        identity: &Arc<Mutex<Option<ssh2::File>>>,
        is_back_element: bool,
    ) {
        let mut streams = self.file_streams.lock().unwrap();
        if is_back_element
            && streams
                .last()
                .map(|s| Arc::ptr_eq(s.identity(), identity))
                .unwrap_or(false)
        {
            streams.pop();
            return;
        }
        streams.retain(|s| !Arc::ptr_eq(s.identity(), identity));
    }
}

impl RemoteSftp for SftpSession {
    fn stat(&self, path: &Path) -> Future<Result<DirectoryEntry, SftpError>> {
        SftpSession::stat(self, path.to_path_buf())
    }

    fn list_directory(&self, path: &Path) -> Future<Result<Vec<DirectoryEntry>, SftpError>> {
        SftpSession::list_directory(self, path.to_path_buf())
    }

    fn open_file(
        &self,
        path: &Path,
        flags: ssh2::OpenFlags,
        mode: i32,
    ) -> Future<Result<Weak<dyn RemoteFileStream>, SftpError>> {
        SftpSession::open_file(self, path.to_path_buf(), flags, mode)
    }

    fn rename(&self, from: &Path, to: &Path) -> Future<Result<(), SftpError>> {
        SftpSession::rename(self, from.to_path_buf(), to.to_path_buf())
    }

    fn strand(&self) -> ProcessingStrand {
        SftpSession::strand(self)
    }
}

/// Resolves immediately with an owner-dropped error, for calls against an
/// already-detached object.
pub(crate) fn detached<T: Send + 'static>() -> Future<Result<T, SftpError>> {
    promise::ready(Err(SftpError::owner_dropped()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(perm: u32, size: u64) -> ssh2::FileStat {
        ssh2::FileStat {
            size: Some(size),
            uid: Some(1000),
            gid: Some(1000),
            perm: Some(perm),
            atime: Some(1),
            mtime: Some(2),
        }
    }

    #[test]
    fn entry_kind_is_derived_from_mode_bits() {
        let file = DirectoryEntry::from_stat("a".into(), &stat(0o100644, 3));
        assert!(file.is_regular_file());
        assert_eq!(file.size, 3);

        let dir = DirectoryEntry::from_stat("d".into(), &stat(0o040755, 0));
        assert!(dir.is_dir());

        let link = DirectoryEntry::from_stat("l".into(), &stat(0o120777, 0));
        assert_eq!(link.kind, EntryKind::Symlink);
    }

    #[test]
    fn default_limits_match_the_packet_ceiling() {
        let limits = Limits::default();
        assert_eq!(limits.max_read_len, 30_000);
        assert_eq!(limits.max_write_len, 30_000);
    }
}
