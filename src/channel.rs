use std::io::Read;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::promise::{self, Future};
use crate::session::SessionInner;
use crate::util::{ssh2_retry_deadline, NATIVE_CALL_TIMEOUT};

/// Extended data stream id carrying stderr.
const STDERR_STREAM: i32 = 1;

/// How many buffer-sized reads one polling cycle may consume per stream,
/// so a chatty channel cannot monopolize the processing thread.
const MAX_READS_PER_CYCLE: usize = 16;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send>;
pub type ExitCallback = Box<dyn FnOnce() + Send>;

/// One interactive stream (PTY + shell) on a session. Reading happens
/// through a permanent task on the session's processing thread; writes are
/// one-shot tasks and therefore arrive in submission order.
pub struct Channel {
    owner: Weak<SessionInner>,
    raw: Mutex<Option<ssh2::Channel>>,
    read_task: Mutex<Option<crate::processing::PermanentTaskId>>,
    on_stdout: Mutex<Option<OutputCallback>>,
    on_stderr: Mutex<Option<OutputCallback>>,
    on_exit: Mutex<Option<ExitCallback>>,
    is_pty: bool,
}

impl Channel {
    pub(crate) fn new(
        owner: Weak<SessionInner>,
        raw: ssh2::Channel,
        is_pty: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner,
            raw: Mutex::new(Some(raw)),
            read_task: Mutex::new(None),
            on_stdout: Mutex::new(None),
            on_stderr: Mutex::new(None),
            on_exit: Mutex::new(None),
            is_pty,
        })
    }

    pub fn is_pty(&self) -> bool {
        self.is_pty
    }

    /// Registers the output callbacks and starts the polling task.
    /// `on_exit` fires exactly once, on remote EOF, channel death or close.
    pub fn start_reading(
        self: &Arc<Self>,
        on_stdout: impl FnMut(&[u8]) + Send + 'static,
        on_stderr: impl FnMut(&[u8]) + Send + 'static,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> bool {
        *self.on_stdout.lock().unwrap() = Some(Box::new(on_stdout));
        *self.on_stderr.lock().unwrap() = Some(Box::new(on_stderr));
        *self.on_exit.lock().unwrap() = Some(Box::new(on_exit));

        let Some(inner) = self.owner.upgrade() else {
            return false;
        };

        let weak = Arc::downgrade(self);
        let (accepted, id) = inner.thread.push_permanent_task(move || {
            if let Some(channel) = weak.upgrade() {
                channel.poll_once();
            }
        });
        if accepted {
            *self.read_task.lock().unwrap() = Some(id);
        } else {
            log::error!("failed to register channel polling task");
        }
        accepted
    }

    /// Queues data for the remote side. Ordering across calls is the call
    /// order on the submitting thread.
    pub fn write(self: &Arc<Self>, data: Vec<u8>) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let weak = Arc::downgrade(self);
        inner.thread.push_task(move || {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            let mut guard = channel.raw.lock().unwrap();
            let Some(raw) = guard.as_mut() else {
                return;
            };

            let mut written = 0;
            while written < data.len() {
                match std::io::Write::write(raw, &data[written..]) {
                    Ok(0) => {
                        log::error!("channel write made no progress, dropping remainder");
                        break;
                    }
                    Ok(n) => written += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        log::error!("channel write failed: {e}");
                        break;
                    }
                }
            }
        });
    }

    /// Resizes the PTY; resolves with the native status code.
    pub fn resize_pty(self: &Arc<Self>, columns: u32, rows: u32) -> Future<i32> {
        let Some(inner) = self.owner.upgrade() else {
            return promise::ready(-1);
        };
        let weak = Arc::downgrade(self);
        inner.thread.push_promise_task(move || {
            let Some(channel) = weak.upgrade() else {
                return -1;
            };
            let mut guard = channel.raw.lock().unwrap();
            let Some(raw) = guard.as_mut() else {
                return -1;
            };
            match ssh2_retry_deadline(NATIVE_CALL_TIMEOUT, || {
                raw.request_pty_size(columns, rows, None, None)
            }) {
                Ok(()) => 0,
                Err(e) => match e.code() {
                    ssh2::ErrorCode::Session(code) => code,
                    ssh2::ErrorCode::SFTP(code) => code,
                },
            }
        })
    }

    /// Detaches the polling task and schedules removal from the owning
    /// session. The native channel is half-closed on the session thread.
    pub fn close(self: &Arc<Self>) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        if let Some(id) = self.read_task.lock().unwrap().take() {
            inner.thread.remove_permanent_task(id);
        }
        inner.channel_remove_itself(self);
    }

    /// One cycle of the permanent polling task: drain stdout, then stderr.
    /// A negative read classifies the channel as dead.
    fn poll_once(self: &Arc<Self>) {
        let mut dead = false;
        {
            let mut guard = self.raw.lock().unwrap();
            let Some(raw) = guard.as_mut() else {
                return;
            };

            let mut buffer = [0u8; 1024];
            for _ in 0..MAX_READS_PER_CYCLE {
                match raw.read(&mut buffer) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => {
                        if let Some(cb) = self.on_stdout.lock().unwrap().as_mut() {
                            cb(&buffer[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::debug!("channel read failed: {e}");
                        dead = true;
                        break;
                    }
                }
            }

            if !dead {
                let mut stderr = raw.stream(STDERR_STREAM);
                for _ in 0..MAX_READS_PER_CYCLE {
                    match stderr.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Some(cb) = self.on_stderr.lock().unwrap().as_mut() {
                                cb(&buffer[..n]);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::debug!("channel stderr read failed: {e}");
                            dead = true;
                            break;
                        }
                    }
                }
            }

            if !dead && raw.eof() {
                dead = true;
            }
        }

        if dead {
            self.fire_exit();
            if let Some(inner) = self.owner.upgrade() {
                if let Some(id) = self.read_task.lock().unwrap().take() {
                    // Within the thread, so the removal is deferred past the
                    // current permanents pass.
                    inner.thread.remove_permanent_task(id);
                }
                inner.channel_remove_itself(self);
            }
        }
    }

    /// Runs inside the session's removal task: detach polling, half-close
    /// the native channel, notify exit.
    pub(crate) fn shutdown(&self) {
        if let Some(inner) = self.owner.upgrade() {
            if let Some(id) = self.read_task.lock().unwrap().take() {
                inner.thread.remove_permanent_task(id);
            }
        }

        if let Some(mut raw) = self.raw.lock().unwrap().take() {
            let _ = ssh2_retry_deadline(CLOSE_TIMEOUT, || raw.send_eof());
            let _ = ssh2_retry_deadline(CLOSE_TIMEOUT, || raw.close());
        }

        self.fire_exit();
    }

    fn fire_exit(&self) {
        if let Some(on_exit) = self.on_exit.lock().unwrap().take() {
            on_exit();
        }
    }
}
