//! On-disk/on-wire envelope format: a fixed-width owner table followed by an
//! opaque ciphertext blob (`iv || aes_output`).
//!
//! ```text
//! offset  size              field
//! 0       1                 owner_count N     (0 ≤ N ≤ 255)
//! 1       N*(20+256)        owner_table: N records of {id:20, wrapped_key:256}
//! 1+...   *                 ciphertext: iv || aes_output
//! ```
//!
//! This is genuinely simple fixed-width byte slicing, so it is implemented by
//! hand rather than run through a general serde codec.

use crate::crypto::WRAPPED_KEY_LEN;
use crate::identifier::{Identifier, IDENTIFIER_LEN};
use thiserror::Error;

const OWNER_RECORD_LEN: usize = IDENTIFIER_LEN + WRAPPED_KEY_LEN;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope truncated: owner_count={owner_count} implies {expected} header bytes, got {got}")]
    Truncated {
        owner_count: usize,
        expected: usize,
        got: usize,
    },
    #[error("owner_count exceeds the single-byte maximum of 255")]
    TooManyOwners,
}

/// One `(user_id, wrapped_session_key)` record in the owner table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEntry {
    pub id: Identifier,
    pub wrapped_key: Vec<u8>,
}

impl OwnerEntry {
    pub fn new(id: Identifier, wrapped_key: Vec<u8>) -> Self {
        OwnerEntry { id, wrapped_key }
    }
}

/// A fully parsed envelope: owner table plus the ciphertext blob (`iv || aes_output`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub owners: Vec<OwnerEntry>,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn new(owners: Vec<OwnerEntry>, ciphertext: Vec<u8>) -> Result<Self, EnvelopeError> {
        if owners.len() > 255 {
            return Err(EnvelopeError::TooManyOwners);
        }
        Ok(Envelope { owners, ciphertext })
    }

    /// Linear scan for `from_id`'s wrapped key. First match wins; nothing
    /// requires (or forbids) dedup at read time, only that inserts dedup on
    /// write (see `merge_owners`).
    pub fn authorized(&self, from_id: &Identifier) -> Option<&[u8]> {
        self.owners
            .iter()
            .find(|o| &o.id == from_id)
            .map(|o| o.wrapped_key.as_slice())
    }

    /// Serialize to the exact wire/disk byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.owners.len() * OWNER_RECORD_LEN + self.ciphertext.len());
        out.push(self.owners.len() as u8);
        for owner in &self.owners {
            out.extend_from_slice(owner.id.as_bytes());
            debug_assert_eq!(owner.wrapped_key.len(), WRAPPED_KEY_LEN);
            out.extend_from_slice(&owner.wrapped_key);
        }
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the exact wire/disk byte layout. A blob with fewer trailing
    /// bytes than `owner_count` implies is a parse error.
    pub fn parse(data: &[u8]) -> Result<Self, EnvelopeError> {
        let owner_count = *data.first().unwrap_or(&0) as usize;
        let header_len = 1 + owner_count * OWNER_RECORD_LEN;
        if data.len() < header_len {
            return Err(EnvelopeError::Truncated {
                owner_count,
                expected: header_len,
                got: data.len(),
            });
        }

        let mut owners = Vec::with_capacity(owner_count);
        let mut cursor = 1;
        for _ in 0..owner_count {
            let id_bytes: [u8; IDENTIFIER_LEN] = data[cursor..cursor + IDENTIFIER_LEN]
                .try_into()
                .expect("slice length matches IDENTIFIER_LEN");
            cursor += IDENTIFIER_LEN;
            let wrapped_key = data[cursor..cursor + WRAPPED_KEY_LEN].to_vec();
            cursor += WRAPPED_KEY_LEN;
            owners.push(OwnerEntry::new(Identifier::from_bytes(id_bytes), wrapped_key));
        }

        let ciphertext = data[cursor..].to_vec();
        Ok(Envelope { owners, ciphertext })
    }

    /// Append `new_owners`, deduplicating on id against the existing table
    /// (an id already present keeps its existing wrapped key).
    pub fn merge_owners(&mut self, new_owners: impl IntoIterator<Item = OwnerEntry>) {
        for owner in new_owners {
            if !self.owners.iter().any(|existing| existing.id == owner.id) {
                self.owners.push(owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(byte: u8) -> OwnerEntry {
        OwnerEntry::new(Identifier::from_bytes([byte; IDENTIFIER_LEN]), vec![byte; WRAPPED_KEY_LEN])
    }

    #[test]
    fn roundtrips_through_bytes() {
        let envelope = Envelope::new(vec![owner(1), owner(2)], b"iv||ciphertext".to_vec()).unwrap();
        let bytes = envelope.to_bytes();
        let parsed = Envelope::parse(&bytes).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn zero_owner_envelope_parses_but_authorizes_nobody() {
        let envelope = Envelope::new(vec![], b"ciphertext".to_vec()).unwrap();
        let bytes = envelope.to_bytes();
        let parsed = Envelope::parse(&bytes).unwrap();
        assert!(parsed.owners.is_empty());
        assert!(parsed.authorized(&Identifier::from_bytes([9; IDENTIFIER_LEN])).is_none());
    }

    #[test]
    fn truncated_owner_table_is_a_parse_error() {
        let envelope = Envelope::new(vec![owner(1), owner(2)], b"ciphertext".to_vec()).unwrap();
        let mut bytes = envelope.to_bytes();
        bytes.truncate(bytes.len() - 10); // lop off part of the second owner record
        assert!(Envelope::parse(&bytes).is_err());
    }

    #[test]
    fn authorized_returns_the_matching_wrapped_key() {
        let envelope = Envelope::new(vec![owner(1), owner(2)], b"ciphertext".to_vec()).unwrap();
        let id = Identifier::from_bytes([2; IDENTIFIER_LEN]);
        assert_eq!(envelope.authorized(&id), Some(vec![2u8; WRAPPED_KEY_LEN].as_slice()));
    }

    #[test]
    fn authorized_rejects_unknown_id() {
        let envelope = Envelope::new(vec![owner(1)], b"ciphertext".to_vec()).unwrap();
        let id = Identifier::from_bytes([99; IDENTIFIER_LEN]);
        assert!(envelope.authorized(&id).is_none());
    }

    #[test]
    fn merge_owners_dedups_on_id() {
        let mut envelope = Envelope::new(vec![owner(1)], b"ciphertext".to_vec()).unwrap();
        envelope.merge_owners(vec![owner(1), owner(2)]);
        assert_eq!(envelope.owners.len(), 2);
    }

    #[test]
    fn max_owner_count_of_255_is_accepted() {
        let owners: Vec<OwnerEntry> = (0..255u16).map(|i| owner((i % 256) as u8)).collect();
        assert!(Envelope::new(owners, vec![]).is_ok());
    }

    #[test]
    fn owner_count_above_255_is_rejected() {
        let owners: Vec<OwnerEntry> = (0..256u16).map(|i| owner((i % 256) as u8)).collect();
        assert!(Envelope::new(owners, vec![]).is_err());
    }
}
