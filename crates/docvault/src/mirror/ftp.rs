//! FTP mirror transport on `suppaftp`: passive mode, binary transfers only.

use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};

use super::{MirrorEntry, MirrorSession, MirrorTransport};
use crate::error::{Error, Result};
use crate::util::sanitize_remote_text;

#[derive(Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_path: String,
    /// Connect timeout, also applied to every read and write.
    pub timeout: Duration,
}

impl std::fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("remote_path", &self.remote_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FtpTransport {
    settings: FtpSettings,
}

impl FtpTransport {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FtpSettings {
        &self.settings
    }
}

impl MirrorTransport for FtpTransport {
    fn describe(&self) -> String {
        let s = &self.settings;
        let path = if s.remote_path.starts_with('/') {
            s.remote_path.clone()
        } else {
            format!("/{}", s.remote_path)
        };
        format!("ftp://{}@{}:{}{}", s.user, s.host, s.port, path)
    }

    fn open(&self, create_dir: bool) -> Result<Box<dyn MirrorSession + '_>> {
        Ok(Box::new(FtpSession::connect(&self.settings, create_dir)?))
    }
}

/// Connection-level failures (and 421/530) are `Unreachable`, 550 is
/// `NotFound`, anything else is a plain error.
fn ftp_err(target: &str, op: &str, e: FtpError) -> Error {
    let msg = format!("{target}: {op} failed: {}", sanitize_remote_text(&e.to_string()));
    match &e {
        FtpError::ConnectionError(_) => Error::unreachable(msg),
        FtpError::UnexpectedResponse(resp) => match resp.status {
            Status::NotAvailable | Status::NotLoggedIn => Error::unreachable(msg),
            Status::FileUnavailable => Error::not_found(msg),
            _ => Error::msg(msg),
        },
        _ => Error::msg(msg),
    }
}

// Anything with a line break would smuggle a second command.
fn arg(value: &str) -> Result<&str> {
    if value.is_empty() || value.contains(['\r', '\n']) {
        return Err(Error::validation(format!(
            "invalid FTP argument '{}'",
            sanitize_remote_text(value)
        )));
    }
    Ok(value)
}

pub struct FtpSession {
    stream: FtpStream,
    target: String,
}

impl FtpSession {
    pub fn connect(s: &FtpSettings, create_dir: bool) -> Result<Self> {
        let target = format!("{}:{}", s.host, s.port);
        let addrs: Vec<SocketAddr> = (s.host.as_str(), s.port)
            .to_socket_addrs()
            .map_err(|e| Error::unreachable(format!("failed to resolve {target}: {e}")))?
            .collect();
        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match FtpStream::connect_timeout(addr, s.timeout) {
                Ok(st) => {
                    stream = Some(st);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let Some(mut stream) = stream else {
            return Err(match last_err {
                Some(e) => ftp_err(&target, "connect", e),
                None => Error::unreachable(format!("{target}: no addresses resolved")),
            });
        };
        stream
            .get_ref()
            .set_read_timeout(Some(s.timeout))
            .and_then(|_| stream.get_ref().set_write_timeout(Some(s.timeout)))
            .map_err(|e| Error::unreachable(format!("{target}: set timeouts: {e}")))?;
        // Servers behind NAT advertise private PASV addresses; dial the control peer.
        stream.set_passive_nat_workaround(true);

        if s.user.contains(['\r', '\n']) || s.password.contains(['\r', '\n']) {
            return Err(Error::validation("FTP credentials contain a line break"));
        }
        stream
            .login(s.user.as_str(), s.password.as_str())
            .map_err(|e| ftp_err(&target, "login", e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| ftp_err(&target, "TYPE I", e))?;

        let mut session = Self { stream, target };
        session.change_dir(&s.remote_path, create_dir)?;
        tracing::debug!(mirror = %session.target, "ftp session open");
        Ok(session)
    }

    fn change_dir(&mut self, path: &str, create: bool) -> Result<()> {
        let path = path.trim();
        if path.is_empty() || path == "." {
            return Ok(());
        }
        let path = arg(path)?;
        let err = match self.stream.cwd(path) {
            Ok(()) => return Ok(()),
            Err(e) => ftp_err(&self.target, "CWD", e),
        };
        if !create || err.is_unreachable() {
            return Err(err);
        }

        let mut prefix = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix.push_str(seg);
            // A refusal here usually means "already exists".
            if let Err(e) = self.stream.mkdir(&prefix) {
                let e = ftp_err(&self.target, "MKD", e);
                if e.is_unreachable() {
                    return Err(e);
                }
            }
        }
        self.stream
            .cwd(path)
            .map_err(|e| ftp_err(&self.target, "CWD", e))?;
        tracing::info!(mirror = %self.target, dir = path, "created mirror directory");
        Ok(())
    }

    fn size_of(&mut self, name: &str) -> Result<u64> {
        let size = self
            .stream
            .size(name)
            .map_err(|e| ftp_err(&self.target, "SIZE", e))?;
        Ok(size as u64)
    }
}

impl MirrorSession for FtpSession {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let name = arg(name)?;
        self.stream
            .put_file(name, &mut Cursor::new(bytes))
            .map_err(|e| ftp_err(&self.target, "STOR", e))?;
        Ok(())
    }

    fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        let name = arg(name)?;
        let buf = self
            .stream
            .retr_as_buffer(name)
            .map_err(|e| ftp_err(&self.target, "RETR", e))?;
        Ok(buf.into_inner())
    }

    fn list(&mut self) -> Result<Vec<MirrorEntry>> {
        let lines = match self.stream.nlst(None) {
            Ok(lines) => lines,
            Err(e) => {
                let e = ftp_err(&self.target, "NLST", e);
                // Empty directory on servers that refuse to list nothing.
                if e.is_not_found() {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
        };
        let names: Vec<String> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.rsplit('/').next().unwrap_or(l).to_string())
            .filter(|n| n != "." && n != "..")
            .collect();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if arg(&name).is_err() {
                continue;
            }
            match self.size_of(&name) {
                Ok(size) => out.push(MirrorEntry { name, size }),
                Err(e) if e.is_unreachable() => return Err(e),
                Err(_) => tracing::debug!(
                    entry = %sanitize_remote_text(&name),
                    "skipping mirror entry without a size"
                ),
            }
        }
        Ok(out)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let name = arg(name)?;
        let err = match self.stream.rm(name) {
            Ok(()) => return Ok(()),
            Err(e) => ftp_err(&self.target, "DELE", e),
        };
        if !err.is_not_found() {
            return Err(err);
        }
        // 550 covers both "no such file" and "permission denied".
        match self.size_of(name) {
            Err(e) if e.is_not_found() => Err(err),
            Err(e) if e.is_unreachable() => Err(e),
            _ => Err(Error::msg(format!(
                "{}: DELE refused for {} and the file is still present",
                self.target,
                sanitize_remote_text(name)
            ))),
        }
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}
