//! Transaction-log data model and the pure reconciliation algorithm that
//! drives directory synchronization.
//!
//! A transaction log is a per-user mapping from relative path to an
//! append-only list of `(operation, client_id, timestamp)` entries. It is
//! itself stored as an ordinary envelope in the DHT (see `crate::orchestrator`
//! for the network plumbing); this module owns only the data shapes and the
//! decision logic, kept free of I/O so the reconciliation rules can be
//! exercised directly in tests.

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub operation: Operation,
    pub client_id: Identifier,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntity {
    pub resource_name: String,
    pub resource_id: Identifier,
    pub entries: Vec<TransactionEntry>,
}

impl TransactionLogEntity {
    pub fn new(resource_name: impl Into<String>) -> Self {
        let resource_name = resource_name.into();
        let resource_id = crate::identifier::resource_id(&resource_name);
        TransactionLogEntity {
            resource_name,
            resource_id,
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, operation: Operation, client_id: Identifier, timestamp: u64) {
        self.entries.push(TransactionEntry {
            operation,
            client_id,
            timestamp,
        });
    }

    /// The entry with the maximum timestamp. Ties are broken by keeping the
    /// later-in-list entry (the literal source iterates and prefers `>=`).
    pub fn last_entry(&self) -> Option<&TransactionEntry> {
        let mut best: Option<&TransactionEntry> = None;
        for entry in &self.entries {
            match best {
                None => best = Some(entry),
                Some(current) if entry.timestamp >= current.timestamp => best = Some(entry),
                Some(_) => {}
            }
        }
        best
    }
}

/// Per-user mapping from relative path to its transaction-log entity.
pub type TransactionLog = HashMap<String, TransactionLogEntity>;

#[derive(Debug, Error)]
pub enum TxLogError {
    #[error("cbor encode error: {0}")]
    Encode(String),
    #[error("cbor decode error: {0}")]
    Decode(String),
}

pub fn encode(log: &TransactionLog) -> Result<Vec<u8>, TxLogError> {
    let mut buf = Vec::new();
    ciborium::into_writer(log, &mut buf).map_err(|e| TxLogError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<TransactionLog, TxLogError> {
    ciborium::from_reader(bytes).map_err(|e| TxLogError::Decode(e.to_string()))
}

/// The action `synchronize` should take for one path known in `remote_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// `path` was never seen by a prior round: materialize it locally
    /// regardless of the remote entry's operation kind.
    Download,
    /// Remote is newer and its last entry is a delete: remove the local file.
    RemoveLocal,
    /// Remote is newer and its last entry is an update: download.
    DownloadNewer,
    /// Equal timestamps: nothing to do.
    NoAction,
    /// Local is newer and the local entry was a delete: push the delete.
    PushDelete,
    /// Local is newer and the local entry was an update: push the file.
    PushUpdate,
}

/// Decide the reconciliation action for one `(path, remote_entity)` pair,
/// given the entity as it appeared in the prior round's log (`None` if this
/// round is the first time the client has seen `path`).
pub fn reconcile(
    remote_entity: &TransactionLogEntity,
    prior_entity: Option<&TransactionLogEntity>,
) -> ReconcileAction {
    let Some(remote_last) = remote_entity.last_entry() else {
        return ReconcileAction::NoAction;
    };

    let Some(prior_entity) = prior_entity else {
        return ReconcileAction::Download;
    };

    let Some(local_last) = prior_entity.last_entry() else {
        return ReconcileAction::Download;
    };

    if local_last.timestamp < remote_last.timestamp {
        match remote_last.operation {
            Operation::Delete => ReconcileAction::RemoveLocal,
            Operation::Update => ReconcileAction::DownloadNewer,
        }
    } else if local_last.timestamp > remote_last.timestamp {
        match local_last.operation {
            Operation::Delete => ReconcileAction::PushDelete,
            Operation::Update => ReconcileAction::PushUpdate,
        }
    } else {
        ReconcileAction::NoAction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 20])
    }

    fn entity_with(op: Operation, ts: u64) -> TransactionLogEntity {
        let mut e = TransactionLogEntity::new("r.txt");
        e.append(op, client(1), ts);
        e
    }

    #[test]
    fn last_entry_prefers_the_later_on_ties() {
        let mut e = TransactionLogEntity::new("r.txt");
        e.append(Operation::Update, client(1), 5);
        e.append(Operation::Delete, client(2), 5);
        let last = e.last_entry().unwrap();
        assert_eq!(last.client_id, client(2));
    }

    #[test]
    fn unseen_path_downloads_regardless_of_operation() {
        let remote = entity_with(Operation::Delete, 10);
        assert_eq!(reconcile(&remote, None), ReconcileAction::Download);
    }

    #[test]
    fn remote_newer_update_downloads() {
        let remote = entity_with(Operation::Update, 10);
        let prior = entity_with(Operation::Update, 5);
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::DownloadNewer);
    }

    #[test]
    fn remote_newer_delete_removes_local() {
        let remote = entity_with(Operation::Delete, 10);
        let prior = entity_with(Operation::Update, 5);
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::RemoveLocal);
    }

    #[test]
    fn equal_timestamps_are_a_no_op() {
        let remote = entity_with(Operation::Update, 7);
        let prior = entity_with(Operation::Update, 7);
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::NoAction);
    }

    #[test]
    fn local_newer_update_pushes_update() {
        let remote = entity_with(Operation::Update, 3);
        let prior = entity_with(Operation::Update, 9);
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::PushUpdate);
    }

    #[test]
    fn local_newer_delete_pushes_delete() {
        let remote = entity_with(Operation::Update, 3);
        let prior = entity_with(Operation::Delete, 9);
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::PushDelete);
    }

    #[test]
    fn no_change_between_rounds_appends_nothing() {
        // Simulates invariant 5: two synchronize rounds on an unchanged path
        // converge on NoAction, so the caller never calls post_file/delete_file.
        let remote = entity_with(Operation::Update, 7);
        let prior = remote.clone();
        assert_eq!(reconcile(&remote, Some(&prior)), ReconcileAction::NoAction);
    }

    #[test]
    fn log_encode_decode_roundtrips() {
        let mut log = TransactionLog::new();
        log.insert("r.txt".into(), entity_with(Operation::Update, 1));
        let bytes = encode(&log).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, log);
    }
}
