use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::SessionOptions;
use crate::error::{AuthOutcome, ConnectError};

const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Answers the credential questions of the authentication chain. The
/// [`SessionManager`](crate::manager::SessionManager) implements this with
/// its provider chain and password cache.
pub trait AuthBroker: Send + Sync {
    /// `what_for` is "keyPhrase" or "password"; `None` means no provider
    /// had an answer.
    fn ask_password(&self, what_for: &str, prompt: &str) -> Option<String>;
    fn cached_password(&self, user: &str, host: &str, port: u16) -> Option<String>;
    fn store_password(&self, user: &str, host: &str, port: u16, password: &str);
}

/// Broker that never answers; key-based and agent auth still work.
pub struct NoPrompt;

impl AuthBroker for NoPrompt {
    fn ask_password(&self, _what_for: &str, _prompt: &str) -> Option<String> {
        None
    }

    fn cached_password(&self, _user: &str, _host: &str, _port: u16) -> Option<String> {
        None
    }

    fn store_password(&self, _user: &str, _host: &str, _port: u16, _password: &str) {}
}

/// Connects, handshakes, checks the host key and authenticates. The
/// returned session is still in blocking mode; wrapping it in an
/// [`SshSession`](crate::session::SshSession) switches it over.
pub fn establish(
    options: &SessionOptions,
    broker: &dyn AuthBroker,
) -> Result<ssh2::Session, ConnectError> {
    let address = format!("{}:{}", options.host, options.port());
    let tcp = connect_with_timeout(&address, options.connect_timeout())?;
    if options.no_delay.unwrap_or(false) {
        tcp.set_nodelay(true)?;
    }

    let mut session = ssh2::Session::new().map_err(ConnectError::Session)?;
    apply_pre_handshake_options(&session, options)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ConnectError::Handshake)?;

    check_known_hosts(&session, options)?;
    authenticate(&session, options, broker)?;

    Ok(session)
}

fn connect_with_timeout(address: &str, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let resolved = address
        .to_socket_addrs()
        .map_err(|_| ConnectError::AddressResolve(address.to_string()))?
        .next()
        .ok_or_else(|| ConnectError::AddressResolve(address.to_string()))?;

    let stream = TcpStream::connect_timeout(&resolved, timeout)?;

    // TCP-level keepalive so idle sessions survive stateful middleboxes.
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

    Ok(stream)
}

fn apply_pre_handshake_options(
    session: &ssh2::Session,
    options: &SessionOptions,
) -> Result<(), ConnectError> {
    if let Some(kex) = &options.key_exchange_algorithms {
        session
            .method_pref(ssh2::MethodType::Kex, kex)
            .map_err(ConnectError::Session)?;
    }
    if let Some(prefs) = &options.compression_client_to_server {
        session
            .method_pref(ssh2::MethodType::CompCs, prefs)
            .map_err(ConnectError::Session)?;
    }
    if let Some(prefs) = &options.compression_server_to_client {
        session
            .method_pref(ssh2::MethodType::CompSc, prefs)
            .map_err(ConnectError::Session)?;
    }
    if options.compression_level.is_some() {
        log::debug!("compression level is not tunable with libssh2, ignoring");
    }

    if let Some(verbosity) = &options.log_verbosity {
        if verbosity != "none" {
            session.trace(ssh2::TraceFlags::all());
        }
    }

    // libssh2 has no equivalents for these; surface that instead of
    // silently accepting the configuration.
    if options.proxy_command.is_some() {
        log::warn!("proxyCommand is not supported by the libssh2 backend, ignoring");
    }
    if options.identity_agent.is_some() {
        log::warn!("identityAgent is not supported by the libssh2 backend, ignoring");
    }
    if options.gssapi_server_identity.is_some()
        || options.gssapi_client_identity.is_some()
        || options.gssapi_delegate_credentials.is_some()
    {
        log::warn!("GSSAPI options are not supported by the libssh2 backend, ignoring");
    }
    if options.bypass_config.is_some() {
        // libssh2 never reads ssh client configuration files.
        log::debug!("bypassConfig has no effect with the libssh2 backend");
    }

    session.set_timeout(options.connect_timeout().as_millis() as u32);
    Ok(())
}

fn check_known_hosts(
    session: &ssh2::Session,
    options: &SessionOptions,
) -> Result<(), ConnectError> {
    let strict = options.strict_host_key_check.unwrap_or(false);

    let Some(file) = options.known_hosts_file() else {
        if strict {
            return Err(ConnectError::HostKeyRejected {
                host: options.host.clone(),
                reason: "no known hosts file available".to_string(),
            });
        }
        return Ok(());
    };

    let mut known_hosts = session.known_hosts().map_err(ConnectError::Session)?;
    if file.exists() {
        known_hosts
            .read_file(&file, ssh2::KnownHostFileKind::OpenSSH)
            .map_err(ConnectError::Session)?;
    }

    let Some((key, _key_type)) = session.host_key() else {
        if strict {
            return Err(ConnectError::HostKeyRejected {
                host: options.host.clone(),
                reason: "server presented no host key".to_string(),
            });
        }
        return Ok(());
    };

    let verdict = known_hosts.check_port(&options.host, options.port(), key);
    let reason = match verdict {
        ssh2::CheckResult::Match => return Ok(()),
        ssh2::CheckResult::NotFound => "host key is not in the known hosts file",
        ssh2::CheckResult::Mismatch => "host key does not match the known hosts entry",
        ssh2::CheckResult::Failure => "known hosts check failed",
    };

    if strict {
        return Err(ConnectError::HostKeyRejected {
            host: options.host.clone(),
            reason: reason.to_string(),
        });
    }
    log::warn!("{}: {reason}, continuing without strict checking", options.host);
    Ok(())
}

/// Authentication order: agent (if enabled), public-key auto discovery,
/// explicit key file (passphrase via the broker), password (cache first,
/// then the broker; a fresh success is cached).
fn authenticate(
    session: &ssh2::Session,
    options: &SessionOptions,
    broker: &dyn AuthBroker,
) -> Result<(), ConnectError> {
    let user = options
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());
    let mut last = AuthOutcome::AgainNeeded;

    if options.try_agent_for_authentication.unwrap_or(false) {
        if let Err(e) = session.userauth_agent(&user) {
            last = outcome_from(&e);
            log::debug!("agent authentication failed: {e}");
        }
    }

    if !session.authenticated() && options.use_public_key_auto_auth.unwrap_or(false) {
        if let Some(dir) = options.ssh_directory() {
            for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
                if session.authenticated() {
                    break;
                }
                let key = dir.join(name);
                if !key.exists() {
                    continue;
                }
                if let Err(e) = session.userauth_pubkey_file(&user, None, &key, None) {
                    last = outcome_from(&e);
                    log::debug!("public key '{}' rejected: {e}", key.display());
                }
            }
        }
    }

    if !session.authenticated() {
        if let Some(key) = &options.ssh_key {
            if let Err(first) = session.userauth_pubkey_file(&user, None, key, None) {
                // The key is probably encrypted; ask the provider chain.
                let prompt = format!("Passphrase for '{}': ", key.display());
                match broker.ask_password("keyPhrase", &prompt) {
                    Some(phrase) => {
                        if let Err(e) =
                            session.userauth_pubkey_file(&user, None, key, Some(&phrase))
                        {
                            last = outcome_from(&e);
                            log::error!("key file authentication failed: {e}");
                        }
                    }
                    None => last = outcome_from(&first),
                }
            }
        }
    }

    if !session.authenticated() {
        if let Some(cached) = broker.cached_password(&user, &options.host, options.port()) {
            if let Err(e) = session.userauth_password(&user, &cached) {
                last = outcome_from(&e);
                log::debug!("cached password rejected: {e}");
            }
        }
    }

    if !session.authenticated() {
        match broker.ask_password("password", "Password: ") {
            Some(password) => match session.userauth_password(&user, &password) {
                Ok(()) => broker.store_password(&user, &options.host, options.port(), &password),
                Err(e) => last = outcome_from(&e),
            },
            None => last = AuthOutcome::Denied,
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        log::error!("failed to authenticate '{}@{}': {last}", user, options.host);
        Err(ConnectError::AuthenticationFailed(last))
    }
}

fn outcome_from(error: &ssh2::Error) -> AuthOutcome {
    match error.code() {
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => AuthOutcome::Denied,
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => AuthOutcome::AgainNeeded,
        ssh2::ErrorCode::Session(code) => AuthOutcome::Other(code),
        ssh2::ErrorCode::SFTP(code) => AuthOutcome::Other(code),
    }
}
