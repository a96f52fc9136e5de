use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use docvault::auth::{self, AuthConfig};
use docvault::config::{self, ConfigDoc, ServerConfig};
use docvault::model::UploadMeta;
use docvault::reconcile::ReconcileConfig;
use docvault::snapshot;
use docvault::{Error, Result, Vault};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile snapshots and files with the mirror, then print the report
    Boot,
    /// Print layout, counts, mirror state and snapshot timestamps
    Status,
    /// Fetch a stored file, repairing it from the mirror when missing locally
    Resolve {
        filename: String,
        /// Write the bytes here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Upload a file as a new document
    Commit {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Store the document as not visible
        #[arg(long)]
        hidden: bool,
    },
    /// Delete a document and its stored file
    Purge { id: i64 },
    /// Save the snapshot now (local and mirror)
    Snapshot,
    /// Download every mirror file missing locally
    SyncFiles,
    /// Rebuild the document table from the mirror listing
    Resync,
    /// Check credentials and print a session token (password from DOCVAULT_PASSWORD)
    Login { username: String },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let doc = config::load_optional(args.config.as_deref())?;
    match args.cmd {
        Command::Boot => cmd_boot(&doc),
        Command::Status => cmd_status(&doc),
        Command::Resolve { filename, out } => cmd_resolve(&doc, &filename, out.as_deref()),
        Command::Commit {
            file,
            title,
            description,
            hidden,
        } => cmd_commit(&doc, &file, title, description, hidden),
        Command::Purge { id } => print_json(&open_vault(&doc)?.purge(id)?),
        Command::Snapshot => print_json(&open_vault(&doc)?.save_snapshot()?),
        Command::SyncFiles => print_json(&open_vault(&doc)?.sync_files()?),
        Command::Resync => print_json(&open_vault(&doc)?.cold_resync()?),
        Command::Login { username } => cmd_login(&doc, &username),
    }
}

// Logs go to stderr; stdout carries command output.
fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_vault(doc: &ConfigDoc) -> Result<Vault> {
    let vault = Vault::from_config(doc)?;
    let auth: AuthConfig = doc.section("auth")?;
    auth::ensure_admin(
        vault.conn(),
        &auth.admin_username,
        auth.initial_password().as_deref(),
    )?;
    Ok(vault)
}

fn cmd_boot(doc: &ConfigDoc) -> Result<()> {
    let vault = open_vault(doc)?;
    let cfg: ReconcileConfig = doc.section("reconcile")?;
    let report = vault.boot(&cfg)?;
    print_json(&report)
}

#[derive(Serialize)]
struct StatusReport {
    config: Option<PathBuf>,
    root: PathBuf,
    uploads_dir: PathBuf,
    database: PathBuf,
    listen_port: u16,
    local_snapshot: Option<String>,
    remote_snapshot: Option<String>,
    #[serde(flatten)]
    stats: docvault::vault::VaultStats,
}

fn cmd_status(doc: &ConfigDoc) -> Result<()> {
    let vault = open_vault(doc)?;
    let server: ServerConfig = doc.section("server")?;
    let layout = vault.layout();
    let local_snapshot = snapshot::load_local(&layout.snapshot_path).map(|s| s.timestamp.to_rfc3339());
    let remote_snapshot = match vault.mirror().read_snapshot() {
        Ok(Some(bytes)) => snapshot::Snapshot::from_bytes(&bytes)
            .map(|s| s.timestamp.to_rfc3339())
            .ok(),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(error = %e, "mirror snapshot unavailable");
            None
        }
    };
    let report = StatusReport {
        config: doc.path.clone(),
        root: layout.root.clone(),
        uploads_dir: layout.uploads_dir.clone(),
        database: layout.db_path.clone(),
        listen_port: server.listen_port()?,
        local_snapshot,
        remote_snapshot,
        stats: vault.stats()?,
    };
    print_json(&report)
}

fn cmd_resolve(doc: &ConfigDoc, filename: &str, out: Option<&Path>) -> Result<()> {
    let vault = open_vault(doc)?;
    let resolved = vault.resolve(filename)?;
    tracing::info!(
        file = filename,
        bytes = resolved.bytes.len(),
        mime = resolved.mime,
        repaired = resolved.repaired,
        "resolved"
    );
    match out {
        Some(path) => docvault::util::atomic_write(path, &resolved.bytes),
        None => {
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&resolved.bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn cmd_commit(
    doc: &ConfigDoc,
    file: &Path,
    title: Option<String>,
    description: Option<String>,
    hidden: bool,
) -> Result<()> {
    let bytes = std::fs::read(file)
        .map_err(|e| Error::from(e).context(format!("failed to read {}", file.display())))?;
    let original_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::validation(format!("{} has no usable file name", file.display())))?;
    let meta = UploadMeta {
        title,
        description,
        is_visible: !hidden,
        ..UploadMeta::named(original_name)
    };
    let vault = open_vault(doc)?;
    print_json(&vault.commit(&bytes, &meta)?)
}

fn cmd_login(doc: &ConfigDoc, username: &str) -> Result<()> {
    let password = std::env::var("DOCVAULT_PASSWORD")
        .map_err(|_| Error::validation("DOCVAULT_PASSWORD is not set"))?;
    let auth_cfg: AuthConfig = doc.section("auth")?;
    let secret = auth_cfg.signing_secret()?;
    let vault = open_vault(doc)?;
    let token = auth::login(
        vault.conn(),
        &secret,
        username,
        &password,
        auth_cfg.token_ttl_secs,
    )?;
    println!("{token}");
    Ok(())
}
