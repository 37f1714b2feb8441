use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TEMP_FILE_SUFFIX: &str = ".filepart";
pub const DEFAULT_FUTURE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection target and SSH options for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Path to an explicit private key file.
    pub ssh_key: Option<PathBuf>,
    pub try_agent_for_authentication: Option<bool>,
    pub use_public_key_auto_auth: Option<bool>,
    pub known_hosts_file: Option<PathBuf>,
    pub ssh_directory: Option<PathBuf>,
    pub strict_host_key_check: Option<bool>,
    pub bypass_config: Option<bool>,
    pub connect_timeout_seconds: Option<u64>,
    pub connect_timeout_u_seconds: Option<u64>,
    pub key_exchange_algorithms: Option<String>,
    pub compression_client_to_server: Option<String>,
    pub compression_server_to_client: Option<String>,
    pub compression_level: Option<i32>,
    pub proxy_command: Option<String>,
    pub identity_agent: Option<String>,
    pub no_delay: Option<bool>,
    pub gssapi_server_identity: Option<String>,
    pub gssapi_client_identity: Option<String>,
    pub gssapi_delegate_credentials: Option<bool>,
    pub log_verbosity: Option<String>,
}

impl SessionOptions {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    pub fn connect_timeout(&self) -> Duration {
        let seconds = self.connect_timeout_seconds.unwrap_or(15);
        let micros = self.connect_timeout_u_seconds.unwrap_or(0);
        Duration::from_secs(seconds) + Duration::from_micros(micros)
    }

    /// Directory holding keys and the known-hosts file, `~/.ssh` by default.
    pub fn ssh_directory(&self) -> Option<PathBuf> {
        self.ssh_directory
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh")))
    }

    pub fn known_hosts_file(&self) -> Option<PathBuf> {
        self.known_hosts_file
            .clone()
            .or_else(|| self.ssh_directory().map(|dir| dir.join("known_hosts")))
    }
}

/// Per-operation transfer settings. Every field is optional so a session
/// level instance can be overlaid onto the per-operation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferOptions {
    pub temp_file_suffix: Option<String>,
    pub may_overwrite: Option<bool>,
    pub reserve_space: Option<bool>,
    pub try_continue: Option<bool>,
    pub inherit_permissions: Option<bool>,
    pub do_cleanup: Option<bool>,
    /// POSIX permission bits applied to the finished file.
    pub custom_permissions: Option<u32>,
}

/// Replaces an unusable staging suffix: it must be non-empty and must not
/// contain a path separator, otherwise the rename target would leave the
/// destination directory.
pub fn sanitize_temp_file_suffix(suffix: &str) -> String {
    if suffix.is_empty() || suffix.contains('/') || suffix.contains('\\') {
        DEFAULT_TEMP_FILE_SUFFIX.to_string()
    } else {
        suffix.to_string()
    }
}

/// SFTP level settings of one session: how long enqueue-time calls may
/// block, how many operations run in parallel, and the transfer defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SftpOptions {
    pub operation_timeout_seconds: Option<u64>,
    pub concurrency: Option<usize>,
    pub download_options: Option<TransferOptions>,
    pub upload_options: Option<TransferOptions>,
}

impl SftpOptions {
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(1).max(1)
    }
}
