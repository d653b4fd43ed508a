//! Crate-level error aggregate.
//!
//! Every module defines its own focused `thiserror` enum; `AppError` folds
//! them together via `#[from]` so orchestration code (the CLI binaries,
//! `orchestrator.rs`) can propagate with a single `?` while still being able
//! to match on the originating kind when it matters: validation errors are
//! fatal, most others are logged at the call site and the enclosing driver
//! continues.

use crate::crypto::CryptoError;
use crate::dht::DhtError;
use crate::envelope::EnvelopeError;
use crate::identifier::IdentifierError;
use crate::txlog::TxLogError;
use crate::wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Dht(#[from] DhtError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    TxLog(#[from] TxLogError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("server returned an error: {0}")]
    Protocol(String),
    #[error("unauthorized: {0} is not in the owner table")]
    Auth(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Validation errors terminate the process; everything else is logged
    /// at the call site and the enclosing driver continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Validation(_))
    }
}
