//! File operation orchestrator: the `backup`, `getfile`, `share`, and `sync`
//! flows, composing the crypto envelope, wire envelope format, DHT routing,
//! and transaction-log modules into the end-user operations.
//!
//! Every operation here follows a single-attempt error policy: a failure for
//! one file is logged and the enclosing walk/sync loop continues, except
//! that the caller decides whether the *first* fetch of the remote
//! transaction log failing should abort a `sync` round (it should not — see
//! `synchronize`).

use crate::clock::LamportClock;
use crate::crypto;
use crate::dht::{DhtClient, Node};
use crate::error::AppError;
use crate::identifier::{self, resource_id, Identifier};
use crate::txlog::{self, Operation, ReconcileAction, TransactionLog, TransactionLogEntity};
use crate::wire::{Method, Request, RequestHeader, SharedOwner};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;

/// Holds everything one client session needs to drive the four CLI flows:
/// its own identity, the configured bootstrap node, and the shared clock.
pub struct Orchestrator {
    pub self_id: Identifier,
    pub txlog_id: Identifier,
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub bootstrap: Node,
    pub dht: DhtClient,
    pub clock: LamportClock,
}

impl Orchestrator {
    /// Build a session and announce this identity to the network with a
    /// `UserRegistration` round-trip against `bootstrap`, per the client's
    /// mandated startup behavior.
    pub async fn new(private_key: RsaPrivateKey, bootstrap: Node) -> Result<Self, AppError> {
        let public_key = RsaPublicKey::from(&private_key);
        let self_id = identifier::user_id(&public_key)?;
        let txlog_id = identifier::txlog_id(&public_key)?;
        let mut orchestrator = Orchestrator {
            self_id,
            txlog_id,
            private_key,
            public_key,
            bootstrap,
            dht: DhtClient::new(self_id),
            clock: LamportClock::new(),
        };
        orchestrator.register().await?;
        Ok(orchestrator)
    }

    /// Send the `UserRegistration` RPC to the bootstrap peer. The server side
    /// of this is ack-only, but the client is required to issue it at startup
    /// regardless of what, if anything, the server does with it.
    async fn register(&mut self) -> Result<(), AppError> {
        let mut stream = self.dht.connect(&self.bootstrap).await?;
        let pub_key_der = identifier::gob_encode_public_key(&self.public_key)?;
        let request = Request {
            header: RequestHeader {
                from: self.self_id,
                key: self.self_id,
                method: Method::UserRegistration,
                pub_key: Some(pub_key_der),
                resource_name: None,
                log: false,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let response = self.dht.round_trip(&mut stream, &request).await?;
        self.clock.observe(response.header.clock);
        if !response.is_success() {
            return Err(AppError::Protocol(
                response
                    .header
                    .message
                    .unwrap_or_else(|| "UserRegistration rejected".into()),
            ));
        }
        Ok(())
    }

    async fn locate_and_open(&self, key: Identifier) -> Result<tokio::net::TcpStream, AppError> {
        let node = self.dht.locate(&self.bootstrap, key).await?;
        let stream = self.dht.connect(&node).await?;
        Ok(stream)
    }

    /// Upload `plaintext` to `key`, reusing the existing session key and IV
    /// if an envelope is already there, or minting a fresh session key
    /// otherwise. Used both for file content (`backup`/`post_file`) and for
    /// the transaction-log blob itself, which is stored as an ordinary
    /// envelope at `txlog_id(user)`.
    async fn upload_content(
        &mut self,
        key: Identifier,
        resource_name: Option<String>,
        plaintext: &[u8],
    ) -> Result<(), AppError> {
        let mut stream = self.locate_and_open(key).await?;

        let get_request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::GetFile,
                pub_key: None,
                resource_name: resource_name.clone(),
                log: false,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let get_response = self.dht.round_trip(&mut stream, &get_request).await?;
        self.clock.observe(get_response.header.clock);

        let (blob, fresh_secret) = if get_response.is_success() {
            let wrapped = get_response
                .header
                .secret
                .clone()
                .ok_or_else(|| AppError::Protocol("GetFile success missing secret".into()))?;
            let session_key = crypto::unwrap_session_key(&self.private_key, &wrapped)?;
            let (iv, _) = crypto::split_iv(&get_response.data)?;
            let ciphertext = crypto::encrypt_with_iv(&session_key, plaintext, iv);
            let mut blob = iv.to_vec();
            blob.extend_from_slice(&ciphertext);
            (blob, None)
        } else {
            let (session_key, wrapped) = crypto::generate_session_key(&self.public_key)?;
            let (iv, ciphertext) = crypto::encrypt(&session_key, plaintext);
            let mut blob = iv.to_vec();
            blob.extend_from_slice(&ciphertext);
            (blob, Some(wrapped))
        };

        let post_request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::PostFile,
                pub_key: None,
                resource_name,
                log: true,
                clock: self.clock.tick(),
                secret: fresh_secret,
                shared_with: vec![],
            },
            data: blob,
        };
        let post_response = self.dht.round_trip(&mut stream, &post_request).await?;
        self.clock.observe(post_response.header.clock);
        if !post_response.is_success() {
            return Err(AppError::Protocol(
                post_response
                    .header
                    .message
                    .unwrap_or_else(|| "PostFile rejected".into()),
            ));
        }
        Ok(())
    }

    /// Fetch and decrypt the plaintext at `key`.
    async fn download_content(&mut self, key: Identifier) -> Result<Vec<u8>, AppError> {
        let mut stream = self.locate_and_open(key).await?;
        let request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::GetFile,
                pub_key: None,
                resource_name: None,
                log: false,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let response = self.dht.round_trip(&mut stream, &request).await?;
        self.clock.observe(response.header.clock);
        if !response.is_success() {
            return Err(AppError::Protocol(
                response
                    .header
                    .message
                    .unwrap_or_else(|| "not found".into()),
            ));
        }
        let wrapped = response
            .header
            .secret
            .ok_or_else(|| AppError::Protocol("GetFile success missing secret".into()))?;
        let session_key = crypto::unwrap_session_key(&self.private_key, &wrapped)?;
        let (iv, ciphertext) = crypto::split_iv(&response.data)?;
        Ok(crypto::decrypt(&session_key, ciphertext, iv))
    }

    /// `backup(local_root)`: walk the tree, uploading every regular file.
    /// Per-file failures are logged and the walk continues.
    pub async fn backup(&mut self, local_root: &Path) -> Result<(), AppError> {
        for rel_path in walk_relative_paths(local_root) {
            let abs = local_root.join(&rel_path);
            let bytes = match std::fs::read(&abs) {
                Ok(b) => b,
                Err(e) => {
                    log::error!("backup: failed to read {rel_path}: {e}");
                    continue;
                }
            };
            let key = resource_id(&rel_path);
            if let Err(e) = self.upload_content(key, Some(rel_path.clone()), &bytes).await {
                log::error!("backup: failed to upload {rel_path}: {e}");
            }
        }
        Ok(())
    }

    /// `getfile(name, dest)`: locate, fetch, decrypt, write to `dest`.
    pub async fn getfile(&mut self, name: &str, dest: &Path) -> Result<(), AppError> {
        let key = resource_id(name);
        let plaintext = self.download_content(key).await?;
        std::fs::write(dest, plaintext)?;
        Ok(())
    }

    /// `share(name, recipient_pub)`: unwrap the session key, rewrap it for
    /// `recipient_pub`, and PostFile with the unchanged ciphertext and a
    /// `shared_with` entry — the server merges the new owner in.
    pub async fn share(&mut self, name: &str, recipient_pub: &RsaPublicKey) -> Result<(), AppError> {
        let key = resource_id(name);
        let mut stream = self.locate_and_open(key).await?;

        let get_request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::GetFile,
                pub_key: None,
                resource_name: Some(name.to_string()),
                log: false,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let get_response = self.dht.round_trip(&mut stream, &get_request).await?;
        self.clock.observe(get_response.header.clock);
        if !get_response.is_success() {
            return Err(AppError::Protocol(
                get_response
                    .header
                    .message
                    .unwrap_or_else(|| "not found".into()),
            ));
        }
        let wrapped = get_response
            .header
            .secret
            .clone()
            .ok_or_else(|| AppError::Protocol("GetFile success missing secret".into()))?;
        let session_key = crypto::unwrap_session_key(&self.private_key, &wrapped)?;
        let wrapped_for_peer = crypto::encrypt_rsa(recipient_pub, &session_key)?;
        let recipient_der = identifier::gob_encode_public_key(recipient_pub)?;
        let recipient_id = Identifier::sha1_of(&recipient_der);

        let post_request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::PostFile,
                pub_key: None,
                resource_name: Some(name.to_string()),
                log: false,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![SharedOwner {
                    id: recipient_id,
                    secret: wrapped_for_peer,
                }],
            },
            data: get_response.data,
        };
        let post_response = self.dht.round_trip(&mut stream, &post_request).await?;
        self.clock.observe(post_response.header.clock);
        if !post_response.is_success() {
            return Err(AppError::Protocol(
                post_response
                    .header
                    .message
                    .unwrap_or_else(|| "share rejected".into()),
            ));
        }
        Ok(())
    }

    async fn fetch_transaction_log(&mut self) -> Result<TransactionLog, AppError> {
        let key = self.txlog_id;
        let bytes = self.download_content(key).await?;
        Ok(txlog::decode(&bytes)?)
    }

    async fn store_transaction_log(&mut self, log: &TransactionLog) -> Result<(), AppError> {
        let key = self.txlog_id;
        let bytes = txlog::encode(log)?;
        self.upload_content(key, Some("transaction-log".into()), &bytes)
            .await
    }

    async fn append_log_entry(&mut self, rel_path: &str, operation: Operation) -> Result<(), AppError> {
        let mut log = match self.fetch_transaction_log().await {
            Ok(l) => l,
            Err(e) => {
                log::warn!(
                    "append_log_entry: treating remote log as empty after fetch failure: {e}"
                );
                TransactionLog::new()
            }
        };
        let entity = log
            .entry(rel_path.to_string())
            .or_insert_with(|| TransactionLogEntity::new(rel_path));
        let timestamp = self.clock.tick();
        entity.append(operation, self.self_id, timestamp);
        self.store_transaction_log(&log).await
    }

    /// `post_file(path)`: upload the content, then append an `Update` entry
    /// to the user's transaction log and PUT it back.
    pub async fn post_file(&mut self, local_root: &Path, rel_path: &str) -> Result<(), AppError> {
        let abs = local_root.join(rel_path);
        let bytes = std::fs::read(&abs)?;
        let key = resource_id(rel_path);
        self.upload_content(key, Some(rel_path.to_string()), &bytes)
            .await?;
        self.append_log_entry(rel_path, Operation::Update).await
    }

    /// `delete_file(path)`: issue `DeleteFile`, then append a `Delete` entry
    /// to the transaction log and PUT it back.
    pub async fn delete_file(&mut self, rel_path: &str) -> Result<(), AppError> {
        let key = resource_id(rel_path);
        let mut stream = self.locate_and_open(key).await?;
        let request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::DeleteFile,
                pub_key: None,
                resource_name: Some(rel_path.to_string()),
                log: true,
                clock: self.clock.tick(),
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let response = self.dht.round_trip(&mut stream, &request).await?;
        self.clock.observe(response.header.clock);
        if !response.is_success() {
            return Err(AppError::Protocol(
                response
                    .header
                    .message
                    .unwrap_or_else(|| "delete rejected".into()),
            ));
        }
        self.append_log_entry(rel_path, Operation::Delete).await
    }

    /// Run one `synchronize` round: fetch the remote log, push every
    /// local file the remote log doesn't know about yet, reconcile every
    /// path the remote log does know about against `prior_log`, and return
    /// the freshest remote log as the next round's `prior_log`.
    pub async fn synchronize(
        &mut self,
        local_root: &Path,
        prior_log: &TransactionLog,
    ) -> TransactionLog {
        let remote_log = match self.fetch_transaction_log().await {
            Ok(l) => l,
            Err(e) => {
                log::warn!("synchronize: fetch of remote log failed, treating as empty: {e}");
                TransactionLog::new()
            }
        };

        for rel_path in walk_relative_paths(local_root) {
            if !remote_log.contains_key(&rel_path) {
                if let Err(e) = self.post_file(local_root, &rel_path).await {
                    log::error!("synchronize: post_file({rel_path}) failed: {e}");
                }
            }
        }

        for (path, entity) in remote_log.iter() {
            let action = txlog::reconcile(entity, prior_log.get(path));
            let result = self.apply_reconcile_action(local_root, path, action).await;
            if let Err(e) = result {
                log::error!("synchronize: reconcile({path}) failed: {e}");
            }
        }

        match self.fetch_transaction_log().await {
            Ok(l) => l,
            Err(e) => {
                log::warn!("synchronize: refetch after reconciliation failed, keeping pre-round log: {e}");
                remote_log
            }
        }
    }

    async fn apply_reconcile_action(
        &mut self,
        local_root: &Path,
        path: &str,
        action: ReconcileAction,
    ) -> Result<(), AppError> {
        match action {
            ReconcileAction::Download | ReconcileAction::DownloadNewer => {
                let dest = local_root.join(path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.getfile(path, &dest).await
            }
            ReconcileAction::RemoveLocal => {
                let dest = local_root.join(path);
                match std::fs::remove_file(&dest) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            ReconcileAction::PushUpdate => self.post_file(local_root, path).await,
            ReconcileAction::PushDelete => self.delete_file(path).await,
            ReconcileAction::NoAction => Ok(()),
        }
    }
}

/// Walk `root` depth-first, returning every regular file's path relative to
/// `root` using forward slashes (stable across platforms, and the form
/// `resource_id` hashes).
fn walk_relative_paths(root: &Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}
