//! Remote Mirror Client.
//!
//! Every operation opens a fresh session, does one logical action and drops
//! the session. Writes go through the [`CircuitBreaker`]; reads always try.

pub mod breaker;
pub mod ftp;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{resolve_port_field, resolve_string_field};
use crate::error::{Error, Result};
use crate::payload;
use crate::util::sanitize_remote_text;

pub use breaker::CircuitBreaker;

pub const DEFAULT_SNAPSHOT_NAME: &str = "_snapshot.json";
const DEFAULT_FTP_PORT: u16 = 21;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub name: String,
    pub size: u64,
}

/// One open connection to the mirror, already positioned in the base
/// directory and in binary transfer mode. Dropping it closes the connection.
pub trait MirrorSession {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()>;
    fn get(&mut self, name: &str) -> Result<Vec<u8>>;
    /// Every regular file in the base directory, control names included.
    fn list(&mut self) -> Result<Vec<MirrorEntry>>;
    fn remove(&mut self, name: &str) -> Result<()>;
}

pub trait MirrorTransport: Send + Sync {
    fn describe(&self) -> String;
    /// `create_dir` asks the transport to create the base directory when it
    /// is missing; only write paths set it.
    fn open(&self, create_dir: bool) -> Result<Box<dyn MirrorSession + '_>>;
}

fn default_host_env() -> Option<String> {
    Some("FTP_HOST".into())
}

fn default_port_env() -> Option<String> {
    Some("FTP_PORT".into())
}

fn default_user_env() -> Option<String> {
    Some("FTP_USER".into())
}

fn default_password_env() -> Option<String> {
    Some("FTP_PASS".into())
}

fn default_remote_path_env() -> Option<String> {
    Some("FTP_PATH".into())
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_failure_threshold() -> u32 {
    breaker::DEFAULT_FAILURE_THRESHOLD
}

fn default_snapshot_name() -> String {
    DEFAULT_SNAPSHOT_NAME.into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub host: Option<String>,
    #[serde(default = "default_host_env")]
    pub host_env: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_port_env")]
    pub port_env: Option<String>,
    pub user: Option<String>,
    #[serde(default = "default_user_env")]
    pub user_env: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: Option<String>,
    pub remote_path: Option<String>,
    #[serde(default = "default_remote_path_env")]
    pub remote_path_env: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            host: None,
            host_env: default_host_env(),
            port: None,
            port_env: default_port_env(),
            user: None,
            user_env: default_user_env(),
            password: None,
            password_env: default_password_env(),
            remote_path: None,
            remote_path_env: default_remote_path_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            snapshot_name: default_snapshot_name(),
        }
    }
}

impl MirrorConfig {
    /// Connection settings, or `None` when no host is configured anywhere.
    pub fn resolve(&self) -> Result<Option<ftp::FtpSettings>> {
        let Some(host) = resolve_string_field(self.host.as_deref(), self.host_env.as_deref())
        else {
            return Ok(None);
        };
        let port = resolve_port_field("mirror.port", self.port, self.port_env.as_deref())?
            .unwrap_or(DEFAULT_FTP_PORT);
        let user = resolve_string_field(self.user.as_deref(), self.user_env.as_deref())
            .unwrap_or_else(|| "anonymous".into());
        // Passwords are taken verbatim; surrounding spaces may be significant.
        let password = self
            .password
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.password_env
                    .as_deref()
                    .and_then(|k| std::env::var(k).ok())
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_default();
        let remote_path =
            resolve_string_field(self.remote_path.as_deref(), self.remote_path_env.as_deref())
                .unwrap_or_else(|| "/".into());
        Ok(Some(ftp::FtpSettings {
            host,
            port,
            user,
            password,
            remote_path,
            timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }))
    }

    pub fn snapshot_name(&self) -> Result<String> {
        let name = self.snapshot_name.trim();
        crate::util::validate_file_name(name)
            .map(ToOwned::to_owned)
            .map_err(|e| e.context("mirror.snapshot_name"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorStatus {
    pub configured: bool,
    pub target: Option<String>,
    pub write_allowed: bool,
    pub failures: u32,
}

#[derive(Clone)]
pub struct Mirror {
    transport: Option<Arc<dyn MirrorTransport>>,
    breaker: Arc<CircuitBreaker>,
    snapshot_name: String,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("target", &self.transport.as_ref().map(|t| t.describe()))
            .field("breaker", &self.breaker)
            .field("snapshot_name", &self.snapshot_name)
            .finish()
    }
}

impl Mirror {
    pub fn new(transport: Arc<dyn MirrorTransport>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            transport: Some(transport),
            breaker,
            snapshot_name: DEFAULT_SNAPSHOT_NAME.into(),
        }
    }

    /// A mirror with nothing behind it: reads and writes all report
    /// `Unreachable`.
    pub fn disabled() -> Self {
        Self {
            transport: None,
            breaker: Arc::new(CircuitBreaker::default()),
            snapshot_name: DEFAULT_SNAPSHOT_NAME.into(),
        }
    }

    pub fn from_config(cfg: &MirrorConfig) -> Result<Self> {
        let snapshot_name = cfg.snapshot_name()?;
        let Some(settings) = cfg.resolve()? else {
            tracing::info!("no mirror host configured; running local-only");
            return Ok(Self::disabled().with_snapshot_name(snapshot_name));
        };
        let transport = ftp::FtpTransport::new(settings);
        tracing::info!(mirror = %transport.describe(), "mirror configured");
        let breaker = Arc::new(CircuitBreaker::new(cfg.failure_threshold));
        Ok(Self::new(Arc::new(transport), breaker).with_snapshot_name(snapshot_name))
    }

    pub fn with_snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_name = name.into();
        self
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    pub fn write_allowed(&self) -> bool {
        self.is_configured() && self.breaker.is_write_allowed()
    }

    pub fn status(&self) -> MirrorStatus {
        MirrorStatus {
            configured: self.is_configured(),
            target: self.transport.as_ref().map(|t| t.describe()),
            write_allowed: self.write_allowed(),
            failures: self.breaker.failures(),
        }
    }

    fn run<T>(
        &self,
        op: &str,
        write: bool,
        f: impl FnOnce(&mut dyn MirrorSession) -> Result<T>,
    ) -> Result<T> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(Error::unreachable("mirror not configured"));
        };
        if write && !self.breaker.is_write_allowed() {
            return Err(Error::unreachable(format!(
                "mirror writes suspended after {} connection failure(s)",
                self.breaker.failures()
            )));
        }
        let out = transport
            .open(write)
            .and_then(|mut session| f(session.as_mut()));
        match &out {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_unreachable() => {
                if self.breaker.record_failure() {
                    tracing::warn!(
                        mirror = %transport.describe(),
                        op,
                        error = %e,
                        "mirror unreachable; suspending mirror writes until restart"
                    );
                } else {
                    tracing::warn!(mirror = %transport.describe(), op, error = %e, "mirror unreachable");
                }
            }
            Err(_) => {}
        }
        out
    }

    /// Probe reachability with an empty session.
    pub fn probe(&self) -> Result<()> {
        self.run("probe", false, |_| Ok(()))
    }

    /// Store `bytes` as `name` and read them back. A copy that does not
    /// match is removed and reported as `Corrupt`.
    pub fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let expected = Sha256::digest(bytes);
        let res = self.run("upload", true, |s| {
            s.put(name, bytes)?;
            let echo = s.get(name)?;
            if let Err(e) = verify_echo(name, bytes.len(), &expected, &echo) {
                if let Err(rm) = s.remove(name) {
                    tracing::warn!(file = name, error = %rm, "failed to remove mismatched mirror copy");
                }
                return Err(e);
            }
            Ok(())
        });
        match &res {
            Ok(()) => tracing::info!(
                file = name,
                bytes = bytes.len(),
                sha256 = %hex::encode(&expected),
                "mirrored upload"
            ),
            Err(e) => tracing::warn!(file = name, error = %e, "mirror upload failed"),
        }
        res
    }

    pub fn download(&self, name: &str) -> Result<Vec<u8>> {
        let res = self.run("download", false, |s| s.get(name));
        match &res {
            Ok(b) => tracing::info!(file = name, bytes = b.len(), "downloaded from mirror"),
            Err(e) if e.is_not_found() => tracing::debug!(file = name, "not on mirror"),
            Err(e) => tracing::warn!(file = name, error = %e, "mirror download failed"),
        }
        res
    }

    /// Data files on the mirror: dot-names and the snapshot are left out.
    pub fn list(&self) -> Result<Vec<MirrorEntry>> {
        let mut entries = self.run("list", false, |s| s.list())?;
        entries.retain(|e| !e.name.starts_with('.') && e.name != self.snapshot_name);
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(files = entries.len(), "listed mirror");
        Ok(entries)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let res = self.run("remove", true, |s| s.remove(name));
        match &res {
            Ok(()) => tracing::info!(file = name, "removed from mirror"),
            Err(e) => tracing::warn!(file = name, error = %e, "mirror remove failed"),
        }
        res
    }

    /// The mirror's snapshot bytes, `None` when there is none.
    pub fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        match self.run("read snapshot", false, |s| s.get(&self.snapshot_name)) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let name = self.snapshot_name.clone();
        self.upload(&name, bytes)
    }
}

fn verify_echo(name: &str, len: usize, expected: &[u8], echo: &[u8]) -> Result<()> {
    if echo.len() != len {
        return Err(Error::corrupt(format!(
            "mirror copy of {} has {} bytes, expected {len}",
            sanitize_remote_text(name),
            echo.len()
        )));
    }
    if Sha256::digest(echo).as_slice() != expected {
        return Err(Error::corrupt(format!(
            "mirror copy of {} differs from the local bytes (expected sha256 {})",
            sanitize_remote_text(name),
            hex::encode(expected)
        )));
    }
    payload::verify(name, echo)
}
