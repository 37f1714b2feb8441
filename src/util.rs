use std::io::{self, ErrorKind};
use std::thread;
use std::time::{Duration, Instant};

/// libssh2's EAGAIN, surfaced when the session is in non-blocking mode.
pub(crate) const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Upper bound for retrying a single native call. The caller-visible future
/// timeouts are much shorter; this only stops a dead socket from spinning a
/// task forever.
pub(crate) const NATIVE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_SLEEP: Duration = Duration::from_millis(5);

/// Retries an ssh2 call that may return EAGAIN while the session is in
/// non-blocking mode.
pub(crate) fn ssh2_retry<T, F>(f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    ssh2_retry_deadline(NATIVE_CALL_TIMEOUT, f)
}

pub(crate) fn ssh2_retry_deadline<T, F>(timeout: Duration, mut f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Same for io-level reads/writes on channels and remote files, where EAGAIN
/// arrives as `WouldBlock`.
pub(crate) fn io_retry<T, F>(timeout: Duration, mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_retry_returns_first_real_error() {
        let mut calls = 0;
        let result: io::Result<()> = io_retry(Duration::from_secs(1), || {
            calls += 1;
            Err(io::Error::new(ErrorKind::PermissionDenied, "nope"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(calls, 1);
    }

    #[test]
    fn io_retry_keeps_trying_on_would_block() {
        let mut calls = 0;
        let result = io_retry(Duration::from_secs(1), || {
            calls += 1;
            if calls < 3 {
                Err(io::Error::new(ErrorKind::WouldBlock, "again"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn io_retry_gives_up_after_the_deadline() {
        let result: io::Result<()> = io_retry(Duration::from_millis(20), || {
            Err(io::Error::new(ErrorKind::WouldBlock, "again"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::WouldBlock);
    }
}
