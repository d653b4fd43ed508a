//! `shardvault-server`: a single ring member serving `GetFile`/`PostFile`/
//! `DeleteFile`/`GetPublicKey`/`PostPublicKey`/`GetSuccessor`/
//! `UserRegistration` over the length-prefixed CBOR wire framing.
//!
//! The ring membership (who else is in the Chord-style keyspace) is static
//! configuration here, not discovered at runtime — the ring-maintenance
//! algorithm itself is out of scope (see crate docs).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rsa::RsaPublicKey;
use shardvault::crypto;
use shardvault::dht::{Node, Ring};
use shardvault::error::AppError;
use shardvault::identifier;
use shardvault::server::{handle_request, ServerState};
use shardvault::wire::{read_frame, write_frame, Request};
use tokio::net::TcpListener;

/// `shardvault` envelope-storage node.
#[derive(Parser, Debug)]
#[command(name = "shardvault-server")]
struct Cli {
    /// Address to listen on, e.g. 127.0.0.1:9001 — also this node's ring address.
    #[arg(long)]
    listen_addr: String,
    /// PEM path for this node's RSA private key. Generated if missing.
    #[arg(long)]
    self_key: PathBuf,
    /// Directory for envelope and public-key blob storage.
    #[arg(long)]
    data_dir: PathBuf,
    /// Another ring member as `address=path/to/public_key.pem`. Repeatable;
    /// this node is always included in the ring automatically.
    #[arg(long = "ring-member")]
    ring_members: Vec<String>,
}

fn load_or_generate_self_key(path: &Path) -> Result<rsa::RsaPrivateKey, AppError> {
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

fn parse_ring(cli: &Cli, self_der: Vec<u8>) -> Result<Ring, AppError> {
    let mut members = vec![Node {
        address: cli.listen_addr.clone(),
        public_key_der: self_der,
    }];
    for spec in &cli.ring_members {
        let (address, key_path) = spec.split_once('=').ok_or_else(|| {
            AppError::Validation(format!(
                "invalid --ring-member {spec:?}, expected address=path/to/public_key.pem"
            ))
        })?;
        let public_key = crypto::read_public_key_pem(Path::new(key_path))?;
        members.push(Node {
            address: address.to_string(),
            public_key_der: identifier::gob_encode_public_key(&public_key)?,
        });
    }
    Ok(Ring::new(members))
}

async fn handle_connection(state: Arc<ServerState>, mut socket: tokio::net::TcpStream, peer: std::net::SocketAddr) {
    loop {
        let request: Request = match read_frame(&mut socket).await {
            Ok(r) => r,
            Err(e) => {
                log::debug!("connection from {peer} closed: {e}");
                break;
            }
        };
        let response = handle_request(&state, request).await;
        if let Err(e) = write_frame(&mut socket, &response).await {
            log::debug!("failed to write response to {peer}: {e}");
            break;
        }
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let private_key = load_or_generate_self_key(&cli.self_key)?;
    let public_key = RsaPublicKey::from(&private_key);
    let self_der = identifier::gob_encode_public_key(&public_key)?;

    let ring = parse_ring(&cli, self_der)?;
    let state = Arc::new(
        ServerState::new(&cli.data_dir, ring)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?,
    );

    let listener = TcpListener::bind(&cli.listen_addr)
        .await
        .map_err(|e| AppError::Storage(format!("failed to bind {}: {e}", cli.listen_addr)))?;
    log::info!("shardvault-server listening on {}", cli.listen_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(handle_connection(state, socket, peer));
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shardvault-server: interrupt received, shutting down");
                return Ok(());
            }
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
            eprintln!("shardvault-server: {e}");
            ExitCode::FAILURE
        }
    }
}
