use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{SftpError, SshError};
use crate::ids::SessionId;
use crate::processing::ProcessingThread;
use crate::promise::Future;
use crate::sftp::SftpSession;
use crate::util::{ssh2_retry, ssh2_retry_deadline};

/// Cycle pacing of the session thread; keeps the channel polling permanent
/// tasks from spinning a core.
const SESSION_MIN_CYCLE_WAIT: Duration = Duration::from_millis(1);

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for [`SshSession::create_pty_channel`].
#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub environment: Option<HashMap<String, String>>,
    pub terminal_type: String,
    pub columns: u32,
    pub rows: u32,
    pub request_shell: bool,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            environment: None,
            terminal_type: "xterm-256color".to_string(),
            columns: 80,
            rows: 24,
            request_shell: true,
        }
    }
}

/// State shared between the session facade, its channels and SFTP sessions.
/// Children keep weak references up; ownership only flows downward through
/// the live lists, and removal goes through the to-remove bucket so a child
/// is never destroyed inside its own call stack.
pub(crate) struct SessionInner {
    pub(crate) thread: ProcessingThread,
    pub(crate) raw: Mutex<ssh2::Session>,
    channels: Mutex<Vec<Arc<Channel>>>,
    channels_to_remove: Mutex<Vec<Arc<Channel>>>,
    sftp_sessions: Mutex<Vec<Arc<SftpSession>>>,
}

impl SessionInner {
    /// Moves one channel from the live list into the to-remove bucket and
    /// schedules the drain. Safe to call while that channel is executing;
    /// teardown happens after it has returned to the scheduler.
    pub(crate) fn channel_remove_itself(self: &Arc<Self>, target: &Arc<Channel>) {
        let inner = Arc::clone(self);
        let target = Arc::clone(target);
        self.thread.push_task(move || {
            let moved = {
                let mut channels = inner.channels.lock().unwrap();
                match channels.iter().position(|c| Arc::ptr_eq(c, &target)) {
                    Some(index) => Some(channels.remove(index)),
                    None => None, // already flagged for removal
                }
            };
            if let Some(channel) = moved {
                inner.channels_to_remove.lock().unwrap().push(channel);
                inner.removal_task();
            }
        });
    }

    pub(crate) fn remove_all_channels(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.thread.push_task(move || {
            if !inner.channels_to_remove.lock().unwrap().is_empty() {
                inner.removal_task();
            }
            let drained: Vec<_> = inner.channels.lock().unwrap().drain(..).collect();
            inner.channels_to_remove.lock().unwrap().extend(drained);
            inner.removal_task();
        });
    }

    fn removal_task(&self) {
        let bucket: Vec<_> = self
            .channels_to_remove
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for channel in bucket {
            channel.shutdown();
        }
    }

    /// Runs on the processing thread, from the SFTP session's final strand
    /// task.
    pub(crate) fn remove_sftp_session(&self, target: &Arc<SftpSession>, is_back_element: bool) {
        let mut sessions = self.sftp_sessions.lock().unwrap();
        if is_back_element
            && sessions
                .last()
                .map(|s| Arc::ptr_eq(s, target))
                .unwrap_or(false)
        {
            sessions.pop();
            return;
        }
        sessions.retain(|s| !Arc::ptr_eq(s, target));
    }

    pub(crate) fn remove_all_sftp_sessions(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.thread.push_task(move || {
            let sessions: Vec<_> = inner.sftp_sessions.lock().unwrap().drain(..).collect();
            for session in sessions {
                session.shutdown_on_thread();
            }
        });
    }
}

/// One authenticated connection. Owns the processing thread every native
/// call of this session runs on, and acts as the factory for interactive
/// channels and SFTP sub-sessions.
pub struct SshSession {
    id: SessionId,
    inner: Arc<SessionInner>,
}

impl SshSession {
    /// Wraps an authenticated native session. The handle is switched to
    /// non-blocking mode; from here on it is only used on the processing
    /// thread.
    pub fn new(id: SessionId, session: ssh2::Session) -> Self {
        session.set_blocking(false);
        Self {
            id,
            inner: Arc::new(SessionInner {
                thread: ProcessingThread::new(),
                raw: Mutex::new(session),
                channels: Mutex::new(Vec::new()),
                channels_to_remove: Mutex::new(Vec::new()),
                sftp_sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn start(&self) {
        self.inner.thread.start(SESSION_MIN_CYCLE_WAIT);
    }

    pub fn is_running(&self) -> bool {
        self.inner.thread.is_running()
    }

    /// Tears down every channel and SFTP session, disconnects, then stops
    /// the processing thread. The teardown tasks run before the disconnect
    /// task because the thread executes in submission order.
    pub fn stop(&self) {
        self.inner.remove_all_channels();
        self.inner.remove_all_sftp_sessions();

        let inner = Arc::clone(&self.inner);
        self.inner.thread.push_task(move || {
            let raw = inner.raw.lock().unwrap();
            if let Err(e) = ssh2_retry_deadline(DISCONNECT_TIMEOUT, || {
                raw.disconnect(None, "closing session", None)
            }) {
                log::debug!("session disconnect reported: {e}");
            }
        });

        self.inner.thread.stop();
    }

    /// Opens an interactive channel: session, environment, PTY, then shell.
    /// Any failing step aborts with the native error.
    pub fn create_pty_channel(&self, options: PtyOptions) -> Future<Result<Weak<Channel>, SshError>> {
        let inner = Arc::clone(&self.inner);
        self.inner.thread.push_promise_task(move || {
            let mut raw_channel = {
                let raw = inner.raw.lock().unwrap();
                ssh2_retry(|| raw.channel_session()).map_err(|e| SshError::from_native(&e))?
            };

            if let Some(environment) = &options.environment {
                for (name, value) in environment {
                    ssh2_retry(|| raw_channel.setenv(name, value))
                        .map_err(|e| SshError::from_native(&e))?;
                }
            }

            ssh2_retry(|| {
                raw_channel.request_pty(
                    &options.terminal_type,
                    None,
                    Some((options.columns, options.rows, 0, 0)),
                )
            })
            .map_err(|e| SshError::from_native(&e))?;

            if options.request_shell {
                ssh2_retry(|| raw_channel.shell()).map_err(|e| SshError::from_native(&e))?;
            }

            let channel = Channel::new(Arc::downgrade(&inner), raw_channel, true);
            inner.channels.lock().unwrap().push(Arc::clone(&channel));
            log::info!(
                "created pty channel, channel total is now {}",
                inner.channels.lock().unwrap().len()
            );
            Ok(Arc::downgrade(&channel))
        })
    }

    /// Allocates and initialises an SFTP sub-session running on its own
    /// strand of this session's thread.
    pub fn create_sftp_session(&self) -> Future<Result<Weak<SftpSession>, SftpError>> {
        let inner = Arc::clone(&self.inner);
        self.inner.thread.push_promise_task(move || {
            let sftp = {
                let raw = inner.raw.lock().unwrap();
                ssh2_retry(|| raw.sftp()).map_err(|e| SftpError::from_native(&e))?
            };

            let strand = inner.thread.create_strand();
            let session = SftpSession::new(Arc::downgrade(&inner), strand, sftp);
            inner.sftp_sessions.lock().unwrap().push(Arc::clone(&session));
            Ok(Arc::downgrade(&session))
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.stop();
    }
}
