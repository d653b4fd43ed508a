//! `shardvault`: a peer-to-peer, end-to-end encrypted file storage network.
//!
//! Users hold RSA keypairs; files are distributed across nodes via a
//! Chord-style DHT and encrypted client-side under a per-file AES session
//! key wrapped under the public keys of authorized owners. A per-user
//! transaction log, itself stored in the DHT, is the synchronization
//! substrate that lets a local directory mirror remote state and vice versa.
//!
//! Module map:
//! - [`identifier`] — 160-bit identifiers and their derivation rules.
//! - [`clock`] — the process-wide Lamport logical clock.
//! - [`crypto`] — RSA keypairs, session-key wrap/unwrap, AES envelope crypto.
//! - [`envelope`] — the on-disk/on-wire owner-table + ciphertext byte layout.
//! - [`wire`] — request/response message types and CBOR framing.
//! - [`dht`] — routing client and the static-ring `successor()` black box.
//! - [`txlog`] — transaction-log data model and the reconciliation algorithm.
//! - [`orchestrator`] — the `backup`/`getfile`/`share`/`sync` flows.
//! - [`server`] — server-side envelope handlers and the filesystem blob store.
//! - [`cache`] — client-side SQLite read-through cache.
//! - [`watcher`] — filesystem watcher and the sync-mode main loop.
//! - [`error`] — the crate-level error aggregate.

pub mod cache;
pub mod clock;
pub mod crypto;
pub mod dht;
pub mod envelope;
pub mod error;
pub mod identifier;
pub mod orchestrator;
pub mod server;
pub mod txlog;
pub mod watcher;
pub mod wire;

pub use error::AppError;
pub use identifier::Identifier;
