use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use docvault::Vault;
use docvault::error::ErrorKind;
use docvault::layout::DataLayout;
use docvault::mirror::ftp::{FtpSettings, FtpTransport};
use docvault::mirror::{CircuitBreaker, DEFAULT_SNAPSHOT_NAME, Mirror};
use docvault::model::UploadMeta;
use docvault::vault::MirrorOutcome;

const PASSWORD: &str = "s3cret";

#[derive(Default)]
struct ServerState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    /// Files whose DELE is refused with a 550 although they exist.
    locked: BTreeSet<String>,
    commands: Vec<String>,
}

type Shared = Arc<Mutex<ServerState>>;

/// Scripted single-directory FTP server speaking just enough of the
/// protocol for the client: USER/PASS, TYPE, CWD/MKD, PASV and transfers.
struct FakeFtp {
    port: u16,
    state: Shared,
}

impl FakeFtp {
    fn start(dirs: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind control");
        let port = listener.local_addr().expect("addr").port();
        let state: Shared = Arc::new(Mutex::new(ServerState {
            dirs: dirs.iter().map(|d| d.to_string()).collect(),
            ..ServerState::default()
        }));
        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = shared.clone();
                thread::spawn(move || serve(stream, state));
            }
        });
        Self { port, state }
    }

    fn settings(&self, remote_path: &str, password: &str) -> FtpSettings {
        FtpSettings {
            host: "127.0.0.1".into(),
            port: self.port,
            user: "site".into(),
            password: password.into(),
            remote_path: remote_path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn mirror(&self, remote_path: &str) -> Mirror {
        let transport = FtpTransport::new(self.settings(remote_path, PASSWORD));
        Mirror::new(Arc::new(transport), Arc::new(CircuitBreaker::default()))
    }

    fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().expect("state").files.get(name).cloned()
    }

    fn insert(&self, name: &str, bytes: &[u8]) {
        self.state
            .lock()
            .expect("state")
            .files
            .insert(name.to_string(), bytes.to_vec());
    }

    fn lock(&self, name: &str) {
        self.state
            .lock()
            .expect("state")
            .locked
            .insert(name.to_string());
    }

    fn commands(&self) -> Vec<String> {
        self.state.lock().expect("state").commands.clone()
    }
}

fn reply(w: &mut TcpStream, line: &str) -> std::io::Result<()> {
    w.write_all(format!("{line}\r\n").as_bytes())
}

fn serve(stream: TcpStream, state: Shared) {
    let mut writer = stream.try_clone().expect("clone");
    let mut reader = BufReader::new(stream);
    let mut binary = false;
    let mut passive: Option<TcpListener> = None;
    if reply(&mut writer, "220 fake ftp ready").is_err() {
        return;
    }
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end().to_string();
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };
        state.lock().expect("state").commands.push(cmd.clone());
        let res = match cmd.as_str() {
            "USER" => reply(&mut writer, "331 password required"),
            "PASS" if arg == PASSWORD => reply(&mut writer, "230 logged in"),
            "PASS" => reply(&mut writer, "530 login incorrect"),
            "TYPE" => {
                binary = arg == "I";
                reply(&mut writer, "200 type set")
            }
            "CWD" => {
                if state.lock().expect("state").dirs.contains(&arg) {
                    reply(&mut writer, "250 directory changed")
                } else {
                    reply(&mut writer, "550 no such directory")
                }
            }
            "MKD" => {
                state.lock().expect("state").dirs.insert(arg.clone());
                reply(&mut writer, &format!("257 \"{arg}\" created"))
            }
            "PASV" => {
                let l = TcpListener::bind("127.0.0.1:0").expect("bind data");
                let p = l.local_addr().expect("addr").port();
                passive = Some(l);
                reply(
                    &mut writer,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256),
                )
            }
            "STOR" => {
                let Some(l) = passive.take() else {
                    let _ = reply(&mut writer, "425 use PASV first");
                    continue;
                };
                // The client dials the data port right after sending the command.
                let (mut data, _) = l.accept().expect("accept");
                if !binary {
                    let _ = reply(&mut writer, "451 refusing ASCII transfer");
                    continue;
                }
                let _ = reply(&mut writer, "150 ok to send data");
                let mut buf = Vec::new();
                data.read_to_end(&mut buf).expect("read data");
                state.lock().expect("state").files.insert(arg, buf);
                reply(&mut writer, "226 transfer complete")
            }
            "RETR" => {
                let Some(l) = passive.take() else {
                    let _ = reply(&mut writer, "425 use PASV first");
                    continue;
                };
                let (mut data, _) = l.accept().expect("accept");
                let body = state.lock().expect("state").files.get(&arg).cloned();
                match body {
                    None => reply(&mut writer, "550 no such file"),
                    Some(body) => {
                        let _ = reply(&mut writer, "150 opening data connection");
                        let _ = data.write_all(&body);
                        drop(data);
                        reply(&mut writer, "226 transfer complete")
                    }
                }
            }
            "NLST" => {
                let Some(l) = passive.take() else {
                    let _ = reply(&mut writer, "425 use PASV first");
                    continue;
                };
                let (mut data, _) = l.accept().expect("accept");
                let names: Vec<String> =
                    state.lock().expect("state").files.keys().cloned().collect();
                let _ = reply(&mut writer, "150 here comes the listing");
                let _ = data.write_all(names.join("\r\n").as_bytes());
                drop(data);
                reply(&mut writer, "226 listing done")
            }
            "SIZE" => match state.lock().expect("state").files.get(&arg) {
                Some(b) => reply(&mut writer, &format!("213 {}", b.len())),
                None => reply(&mut writer, "550 not a plain file"),
            },
            "DELE" => {
                let mut st = state.lock().expect("state");
                let removed = !st.locked.contains(&arg) && st.files.remove(&arg).is_some();
                drop(st);
                if removed {
                    reply(&mut writer, "250 deleted")
                } else {
                    reply(&mut writer, "550 no such file")
                }
            }
            "QUIT" => {
                let _ = reply(&mut writer, "221 bye");
                return;
            }
            _ => reply(&mut writer, "502 not implemented"),
        };
        if res.is_err() {
            return;
        }
    }
}

#[test]
fn upload_list_download_remove_over_ftp() {
    let server = FakeFtp::start(&["/backup"]);
    let mirror = server.mirror("/backup/uploads");

    mirror.upload("a.pdf", b"%PDF-1.4 over the wire").expect("upload");
    assert_eq!(server.file("a.pdf").as_deref(), Some(&b"%PDF-1.4 over the wire"[..]));
    server.insert(DEFAULT_SNAPSHOT_NAME, b"{}");
    server.insert(".ftpquota", b"1");

    let listed = mirror.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "a.pdf");
    assert_eq!(listed[0].size, 22);

    assert_eq!(mirror.download("a.pdf").expect("download"), b"%PDF-1.4 over the wire");
    assert!(mirror.download("missing.pdf").unwrap_err().is_not_found());
    assert!(mirror.write_allowed(), "a missing file is not an outage");

    mirror.remove("a.pdf").expect("remove");
    assert!(server.file("a.pdf").is_none());

    let cmds = server.commands();
    assert!(cmds.iter().any(|c| c == "MKD"), "base directory created: {cmds:?}");
    let first_type = cmds.iter().position(|c| c == "TYPE").expect("TYPE sent");
    let first_stor = cmds.iter().position(|c| c == "STOR").expect("STOR sent");
    assert!(first_type < first_stor);
    let quits = cmds.iter().filter(|c| *c == "QUIT").count();
    let users = cmds.iter().filter(|c| *c == "USER").count();
    assert_eq!(quits, users, "every session is closed");
}

#[test]
fn binary_payload_survives_transfer() {
    let server = FakeFtp::start(&["/"]);
    let mirror = server.mirror("/");
    let mut body = b"\x89PNG\r\n\x1a\n".to_vec();
    body.extend((0..=255u8).cycle().take(4096));
    mirror.upload("photo.png", &body).expect("upload");
    assert_eq!(mirror.download("photo.png").expect("download"), body);
}

#[test]
fn rejected_login_trips_the_breaker() {
    let server = FakeFtp::start(&["/"]);
    let transport = FtpTransport::new(server.settings("/", "wrong"));
    let mirror = Mirror::new(Arc::new(transport), Arc::new(CircuitBreaker::default()));

    let err = mirror.upload("a.pdf", b"%PDF").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(!mirror.write_allowed());
    assert!(mirror.remove("a.pdf").unwrap_err().is_unreachable());
}

#[test]
fn vault_repairs_through_ftp() {
    let server = FakeFtp::start(&["/site"]);
    let tmp = tempfile::tempdir().expect("tempdir");
    let vault = Vault::open(DataLayout::under(tmp.path()), server.mirror("/site")).expect("open");

    let out = vault
        .commit(b"%PDF-1.4 contract", &UploadMeta::named("contract.pdf"))
        .expect("commit");
    assert_eq!(out.mirror, MirrorOutcome::Mirrored);
    assert!(server.file(DEFAULT_SNAPSHOT_NAME).is_some());

    vault.store().remove(&out.document.filename).expect("lose local copy");
    let resolved = vault.resolve(&out.document.filename).expect("repair");
    assert!(resolved.repaired);
    assert_eq!(resolved.bytes, b"%PDF-1.4 contract");
}

#[test]
fn refused_delete_is_not_reported_as_missing() {
    let server = FakeFtp::start(&["/"]);
    let mirror = server.mirror("/");
    server.insert("locked.pdf", b"%PDF-1.4 keep");
    server.lock("locked.pdf");

    let err = mirror.remove("locked.pdf").unwrap_err();
    assert!(!err.is_not_found(), "{err}");
    assert!(!err.is_unreachable(), "{err}");
    assert!(server.file("locked.pdf").is_some());

    let err = mirror.remove("never-there.pdf").unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(mirror.write_allowed());
}

#[test]
fn purge_reports_refused_mirror_delete() {
    let server = FakeFtp::start(&["/site"]);
    let tmp = tempfile::tempdir().expect("tempdir");
    let vault = Vault::open(DataLayout::under(tmp.path()), server.mirror("/site")).expect("open");
    let doc = vault
        .commit(b"%PDF-1.4 permit", &UploadMeta::named("permit.pdf"))
        .expect("commit")
        .document;
    server.lock(&doc.filename);

    let purged = vault.purge(doc.id).expect("purge");
    assert!(matches!(purged.mirror, MirrorOutcome::Failed { .. }), "{:?}", purged.mirror);
    assert!(server.file(&doc.filename).is_some());
    assert!(vault.resolve(&doc.filename).unwrap_err().is_not_found());
}
