//! `shardvault-client`: the `backup`/`getfile`/`share`/`sync` CLI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use shardvault::cache;
use shardvault::crypto;
use shardvault::dht::Node;
use shardvault::error::AppError;
use shardvault::identifier;
use shardvault::orchestrator::Orchestrator;
use shardvault::watcher;
use sqlx::SqlitePool;

/// Peer-to-peer, end-to-end encrypted file storage: client.
#[derive(Parser, Debug)]
#[command(name = "shardvault-client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload every file under `local_path` to the network.
    Backup(BackupArgs),
    /// Download `filename` and write it to `filedest`.
    Getfile(GetfileArgs),
    /// Grant `share_with_key` access to `filename`.
    Share(ShareArgs),
    /// Continuously mirror `local_path` against the remote transaction log.
    Sync(SyncArgs),
}

#[derive(clap::Args, Debug)]
struct BackupArgs {
    /// Directory to walk and upload.
    #[arg(long)]
    local_path: PathBuf,
    /// `host:port` of a bootstrap peer.
    #[arg(long)]
    peer_addr: String,
    /// PEM path for this user's RSA private key. Generated if missing.
    #[arg(long)]
    self_key: PathBuf,
    /// PEM path, or a saved nickname, for the bootstrap peer's RSA public key.
    #[arg(long)]
    peer_key: String,
}

#[derive(clap::Args, Debug)]
struct GetfileArgs {
    /// Resource path to fetch.
    #[arg(long)]
    filename: String,
    /// Local destination path.
    #[arg(long)]
    filedest: PathBuf,
    #[arg(long)]
    peer_addr: String,
    #[arg(long)]
    self_key: PathBuf,
    /// PEM path, or a saved nickname, for the bootstrap peer's RSA public key.
    #[arg(long)]
    peer_key: String,
}

#[derive(clap::Args, Debug)]
struct ShareArgs {
    /// Resource path to share.
    #[arg(long)]
    filename: String,
    /// PEM path, or a saved nickname, for the recipient's RSA public key.
    #[arg(long)]
    share_with_key: String,
    #[arg(long)]
    peer_addr: String,
    #[arg(long)]
    self_key: PathBuf,
    /// PEM path, or a saved nickname, for the bootstrap peer's RSA public key.
    #[arg(long)]
    peer_key: String,
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    #[arg(long)]
    local_path: PathBuf,
    #[arg(long)]
    peer_addr: String,
    #[arg(long)]
    self_key: PathBuf,
    /// PEM path, or a saved nickname, for the bootstrap peer's RSA public key.
    #[arg(long)]
    peer_key: String,
    /// Poll interval in seconds.
    #[arg(long, default_value_t = 1)]
    poll_interval: u64,
}

fn load_or_generate_self_key(path: &Path) -> Result<RsaPrivateKey, AppError> {
    if path.exists() {
        Ok(crypto::read_private_key_pem(path)?)
    } else {
        log::info!("self_key {} not found, generating a new keypair", path.display());
        let key = crypto::generate_keypair()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        crypto::write_private_key_pem(path, &key)?;
        Ok(key)
    }
}

/// Open (creating if needed) the `.shardvault/cache.db` under `dir`, with
/// migrations applied.
async fn open_cache(dir: &Path) -> Result<SqlitePool, AppError> {
    let cache_dir = dir.join(".shardvault");
    std::fs::create_dir_all(&cache_dir)?;
    let cache_url = format!("sqlite://{}/cache.db?mode=rwc", cache_dir.display());
    let pool = SqlitePool::connect(&cache_url)
        .await
        .map_err(|e| AppError::Storage(e.to_string()))?;
    cache::run_migrations(&pool)
        .await
        .map_err(|e| AppError::Storage(e.to_string()))?;
    Ok(pool)
}

/// Resolve a `peer_key`/`share_with_key` CLI argument to a public key: if it
/// names an existing file, read the PEM from disk and remember it under a
/// nickname derived from the file stem; otherwise treat it as a nickname and
/// look it up in the cache.
async fn resolve_peer_key(pool: &SqlitePool, key_arg: &str) -> Result<RsaPublicKey, AppError> {
    let path = Path::new(key_arg);
    if path.is_file() {
        let pem = std::fs::read_to_string(path)?;
        let public_key = crypto::parse_public_key_pem(&pem)?;
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            cache::save_peer_key(pool, stem, &pem)
                .await
                .map_err(|e| AppError::Storage(e.to_string()))?;
        }
        Ok(public_key)
    } else {
        let pem = cache::lookup_peer_key(pool, key_arg)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "{key_arg} is neither an existing PEM file nor a saved nickname"
                ))
            })?;
        crypto::parse_public_key_pem(&pem).map_err(AppError::from)
    }
}

async fn load_bootstrap(pool: &SqlitePool, peer_addr: &str, peer_key_arg: &str) -> Result<Node, AppError> {
    let public_key = resolve_peer_key(pool, peer_key_arg).await?;
    let public_key_der = identifier::gob_encode_public_key(&public_key)?;
    Ok(Node {
        address: peer_addr.to_string(),
        public_key_der,
    })
}

fn validate_directory(path: &Path) -> Result<(), AppError> {
    if !path.is_dir() {
        return Err(AppError::Validation(format!(
            "local_path {} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Backup(args) => {
            validate_directory(&args.local_path)?;
            let key = load_or_generate_self_key(&args.self_key)?;
            let pool = open_cache(&args.local_path).await?;
            let bootstrap = load_bootstrap(&pool, &args.peer_addr, &args.peer_key).await?;
            let mut orchestrator = Orchestrator::new(key, bootstrap).await?;
            orchestrator.backup(&args.local_path).await
        }
        Command::Getfile(args) => {
            let key = load_or_generate_self_key(&args.self_key)?;
            let self_key_dir = args.self_key.parent().unwrap_or_else(|| Path::new("."));
            let pool = open_cache(self_key_dir).await?;
            let bootstrap = load_bootstrap(&pool, &args.peer_addr, &args.peer_key).await?;
            let mut orchestrator = Orchestrator::new(key, bootstrap).await?;
            orchestrator.getfile(&args.filename, &args.filedest).await
        }
        Command::Share(args) => {
            let key = load_or_generate_self_key(&args.self_key)?;
            let self_key_dir = args.self_key.parent().unwrap_or_else(|| Path::new("."));
            let pool = open_cache(self_key_dir).await?;
            let bootstrap = load_bootstrap(&pool, &args.peer_addr, &args.peer_key).await?;
            let recipient_pub = resolve_peer_key(&pool, &args.share_with_key).await?;
            let mut orchestrator = Orchestrator::new(key, bootstrap).await?;
            orchestrator.share(&args.filename, &recipient_pub).await
        }
        Command::Sync(args) => {
            validate_directory(&args.local_path)?;
            let key = load_or_generate_self_key(&args.self_key)?;
            let pool = open_cache(&args.local_path).await?;
            let bootstrap = load_bootstrap(&pool, &args.peer_addr, &args.peer_key).await?;
            let orchestrator = Orchestrator::new(key, bootstrap).await?;

            watcher::run_sync_loop(
                orchestrator,
                args.local_path,
                Duration::from_secs(args.poll_interval),
                pool,
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("shardvault-client: {e}");
            ExitCode::FAILURE
        }
    }
}
