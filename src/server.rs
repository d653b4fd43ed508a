//! Server-side envelope handlers: the GET/POST/DELETE RPCs that read,
//! create, and mutate envelopes under owner-set authorization, plus the
//! pass-through public-key store and the `GetSuccessor` ring lookup.
//!
//! All envelope-mutating handlers acquire a per-key lock for the duration of
//! their read-modify-write (a striped lock table, not one process-wide
//! mutex): cross-key operations proceed fully in parallel, and the critical
//! section for any one key stays small (read a blob, patch an in-memory
//! struct, write a blob).

use crate::clock::LamportClock;
use crate::dht::Ring;
use crate::envelope::{Envelope, OwnerEntry};
use crate::identifier::Identifier;
use crate::wire::{Method, Request, Response};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A key-to-bytes map with atomic replace, backed by the filesystem. The
/// "atomic" part is the rename-after-write idiom: a write lands in a temp
/// file in the same directory, then an atomic rename swaps it into place, so
/// a reader never observes a partially-written blob.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(FsStore { root })
    }

    fn path_for(&self, key: &Identifier) -> PathBuf {
        self.root.join(key.to_hex())
    }

    pub async fn get(&self, key: &Identifier) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, key: &Identifier, bytes: &[u8]) -> Result<(), StoreError> {
        let final_path = self.path_for(key);
        let tmp_path = final_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &Identifier) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A striped table of per-key locks. `lock_for` always returns the same
/// mutex for the same `Identifier`, giving per-key mutual exclusion without
/// a single process-wide critical section.
pub struct KeyLockTable {
    stripes: Vec<Mutex<()>>,
}

impl Default for KeyLockTable {
    fn default() -> Self {
        KeyLockTable {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl KeyLockTable {
    fn stripe_index(&self, key: &Identifier) -> usize {
        let bytes = key.as_bytes();
        let mixed = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (mixed as usize) % self.stripes.len()
    }

    pub async fn lock(&self, key: &Identifier) -> tokio::sync::MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)].lock().await
    }
}

/// All server-side state: the envelope blob store, a separate namespace for
/// opaque public-key blobs, the per-key lock table, the process clock, and
/// the ring this node uses to answer `GetSuccessor`.
pub struct ServerState {
    pub envelopes: FsStore,
    pub public_keys: FsStore,
    pub locks: KeyLockTable,
    pub clock: LamportClock,
    pub ring: Ring,
}

impl ServerState {
    pub async fn new(data_dir: impl AsRef<Path>, ring: Ring) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        Ok(ServerState {
            envelopes: FsStore::new(data_dir.join("envelopes")).await?,
            public_keys: FsStore::new(data_dir.join("pubkeys")).await?,
            locks: KeyLockTable::default(),
            clock: LamportClock::new(),
            ring,
        })
    }
}

/// Dispatch one request to the matching handler. Every path through here
/// observes the request's clock and stamps the response with the result —
/// every handler updates the Lamport clock, win or lose.
pub async fn handle_request(state: &ServerState, request: Request) -> Response {
    let clock = state.clock.observe(request.header.clock);
    let response = match request.header.method {
        Method::GetFile => handle_get_file(state, &request).await,
        Method::PostFile => handle_post_file(state, &request).await,
        Method::DeleteFile => handle_delete_file(state, &request).await,
        Method::GetPublicKey => handle_get_public_key(state, &request).await,
        Method::PostPublicKey => handle_post_public_key(state, &request).await,
        Method::GetSuccessor => handle_get_successor(state, &request).await,
        Method::UserRegistration => Response::success(None, clock, Vec::new()),
    };
    // The handlers above build their response without knowing the final
    // clock value observed above (computed once, up front, so concurrent
    // handlers on other keys can't race it) — patch it in here.
    let mut response = response;
    response.header.clock = clock;
    response
}

async fn handle_get_file(state: &ServerState, request: &Request) -> Response {
    let key = request.header.key;
    let _guard = state.locks.lock(&key).await;
    let Ok(Some(bytes)) = state.envelopes.get(&key).await else {
        return Response::error(0, "not found");
    };
    let Ok(envelope) = Envelope::parse(&bytes) else {
        return Response::error(0, "envelope unreadable");
    };
    match envelope.authorized(&request.header.from) {
        Some(wrapped_key) => {
            Response::success(Some(wrapped_key.to_vec()), 0, envelope.ciphertext.clone())
        }
        None => Response::error(0, "unauthorized"),
    }
}

async fn handle_post_file(state: &ServerState, request: &Request) -> Response {
    let key = request.header.key;
    let _guard = state.locks.lock(&key).await;

    let shared_with: Vec<OwnerEntry> = request
        .header
        .shared_with
        .iter()
        .map(|s| OwnerEntry::new(s.id, s.secret.clone()))
        .collect();

    let envelope = match state.envelopes.get(&key).await {
        Ok(Some(bytes)) => {
            let Ok(mut existing) = Envelope::parse(&bytes) else {
                return Response::error(0, "envelope unreadable");
            };
            if existing.authorized(&request.header.from).is_none() {
                return Response::error(0, "unauthorized");
            }
            existing.ciphertext = request.data.clone();
            existing.merge_owners(shared_with);
            existing
        }
        Ok(None) => {
            let Some(secret) = request.header.secret.clone() else {
                return Response::error(0, "missing secret for new envelope");
            };
            let mut envelope = match Envelope::new(
                vec![OwnerEntry::new(request.header.from, secret)],
                request.data.clone(),
            ) {
                Ok(e) => e,
                Err(e) => return Response::error(0, e.to_string()),
            };
            envelope.merge_owners(shared_with);
            envelope
        }
        Err(e) => return Response::error(0, e.to_string()),
    };

    if let Err(e) = state.envelopes.put(&key, &envelope.to_bytes()).await {
        return Response::error(0, e.to_string());
    }
    Response::success(None, 0, Vec::new())
}

async fn handle_delete_file(state: &ServerState, request: &Request) -> Response {
    let key = request.header.key;
    let _guard = state.locks.lock(&key).await;
    let Ok(Some(bytes)) = state.envelopes.get(&key).await else {
        return Response::error(0, "not found");
    };
    let Ok(envelope) = Envelope::parse(&bytes) else {
        return Response::error(0, "envelope unreadable");
    };
    if envelope.authorized(&request.header.from).is_none() {
        return Response::error(0, "unauthorized");
    }
    match state.envelopes.delete(&key).await {
        Ok(_) => Response::success(None, 0, Vec::new()),
        Err(e) => Response::error(0, e.to_string()),
    }
}

async fn handle_get_public_key(state: &ServerState, request: &Request) -> Response {
    match state.public_keys.get(&request.header.key).await {
        Ok(Some(bytes)) => Response::success(None, 0, bytes),
        Ok(None) => Response::error(0, "not found"),
        Err(e) => Response::error(0, e.to_string()),
    }
}

async fn handle_post_public_key(state: &ServerState, request: &Request) -> Response {
    match state
        .public_keys
        .put(&request.header.key, &request.data)
        .await
    {
        Ok(()) => Response::success(None, 0, Vec::new()),
        Err(e) => Response::error(0, e.to_string()),
    }
}

async fn handle_get_successor(state: &ServerState, request: &Request) -> Response {
    match state.ring.successor(&request.header.key) {
        Some(node) => {
            let mut buf = Vec::new();
            if ciborium::into_writer(node, &mut buf).is_err() {
                return Response::error(0, "failed to encode successor");
            }
            Response::success(None, 0, buf)
        }
        None => Response::error(0, "ring is empty"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{RequestHeader, SharedOwner};

    fn request(method: Method, key: Identifier, from: Identifier) -> Request {
        Request {
            header: RequestHeader {
                from,
                key,
                method,
                pub_key: None,
                resource_name: None,
                log: false,
                clock: 0,
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        }
    }

    async fn test_state() -> (ServerState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = ServerState::new(dir.path(), Ring::new(vec![]))
            .await
            .unwrap();
        (state, dir)
    }

    #[tokio::test]
    async fn post_then_get_round_trips_the_ciphertext() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        let from = Identifier::from_bytes([2; 20]);

        let mut post = request(Method::PostFile, key, from);
        post.header.secret = Some(vec![9u8; 256]);
        post.data = b"ciphertext".to_vec();
        let resp = handle_request(&state, post).await;
        assert!(resp.is_success());

        let get = request(Method::GetFile, key, from);
        let resp = handle_request(&state, get).await;
        assert!(resp.is_success());
        assert_eq!(resp.data, b"ciphertext");
        assert_eq!(resp.header.secret, Some(vec![9u8; 256]));
    }

    #[tokio::test]
    async fn get_file_by_unauthorized_user_is_rejected() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        let owner = Identifier::from_bytes([2; 20]);
        let intruder = Identifier::from_bytes([3; 20]);

        let mut post = request(Method::PostFile, key, owner);
        post.header.secret = Some(vec![9u8; 256]);
        handle_request(&state, post).await;

        let get = request(Method::GetFile, key, intruder);
        let resp = handle_request(&state, get).await;
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn post_file_by_non_owner_never_mutates_the_envelope() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        let owner = Identifier::from_bytes([2; 20]);
        let intruder = Identifier::from_bytes([3; 20]);

        let mut post = request(Method::PostFile, key, owner);
        post.header.secret = Some(vec![9u8; 256]);
        post.data = b"original".to_vec();
        handle_request(&state, post).await;

        let mut bad_post = request(Method::PostFile, key, intruder);
        bad_post.header.secret = Some(vec![1u8; 256]);
        bad_post.data = b"overwritten".to_vec();
        let resp = handle_request(&state, bad_post).await;
        assert!(!resp.is_success());

        let get = request(Method::GetFile, key, owner);
        let resp = handle_request(&state, get).await;
        assert_eq!(resp.data, b"original");
    }

    #[tokio::test]
    async fn share_via_post_file_grows_the_owner_table() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        let owner = Identifier::from_bytes([2; 20]);
        let recipient = Identifier::from_bytes([3; 20]);

        let mut post = request(Method::PostFile, key, owner);
        post.header.secret = Some(vec![9u8; 256]);
        post.data = b"hello".to_vec();
        handle_request(&state, post).await;

        let mut share = request(Method::PostFile, key, owner);
        share.data = b"hello".to_vec();
        share.header.shared_with = vec![SharedOwner {
            id: recipient,
            secret: vec![5u8; 256],
        }];
        let resp = handle_request(&state, share).await;
        assert!(resp.is_success());

        let get = request(Method::GetFile, key, recipient);
        let resp = handle_request(&state, get).await;
        assert!(resp.is_success());
        assert_eq!(resp.header.secret, Some(vec![5u8; 256]));
    }

    #[tokio::test]
    async fn delete_removes_the_blob_entirely() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        let owner = Identifier::from_bytes([2; 20]);

        let mut post = request(Method::PostFile, key, owner);
        post.header.secret = Some(vec![9u8; 256]);
        handle_request(&state, post).await;

        let delete = request(Method::DeleteFile, key, owner);
        let resp = handle_request(&state, delete).await;
        assert!(resp.is_success());

        let get = request(Method::GetFile, key, owner);
        let resp = handle_request(&state, get).await;
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn corrupted_envelope_never_exposes_partial_reads() {
        let (state, _dir) = test_state().await;
        let key = Identifier::from_bytes([1; 20]);
        // owner_count = 3 but the store only holds two full owner records'
        // worth of bytes after the header byte.
        let mut corrupt = vec![3u8];
        corrupt.extend(std::iter::repeat(0u8).take((20 + 256) * 2));
        state.envelopes.put(&key, &corrupt).await.unwrap();

        let get = request(Method::GetFile, key, Identifier::from_bytes([2; 20]));
        let resp = handle_request(&state, get).await;
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn user_registration_only_bumps_the_clock() {
        let (state, _dir) = test_state().await;
        let req = request(
            Method::UserRegistration,
            Identifier::from_bytes([0; 20]),
            Identifier::from_bytes([1; 20]),
        );
        let resp = handle_request(&state, req).await;
        assert!(resp.is_success());
    }
}
