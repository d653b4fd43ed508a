//! DHT resource routing: the thin protocol glue that turns a resource
//! identifier into an open, authenticated connection to the node currently
//! responsible for it.
//!
//! The Chord ring-maintenance algorithm itself (finger tables, stabilization,
//! joins/leaves) is out of scope and treated as a black box. What this module
//! gives `GetSuccessor` real behavior against is a static, consistently-hashed
//! ring: every server process is configured at startup with the full list of
//! ring members (including itself), and computes a key's successor by
//! picking the nearest member at-or-after the key, wrapping around. That is
//! deliberately not a full Chord implementation.

use crate::identifier::Identifier;
use crate::wire::{read_frame, write_frame, Method, Request, RequestHeader, Response, WireError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long a single request/response round-trip is allowed to take before
/// it's treated as a routing failure.
pub const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(30);

/// `{ address, public_key }` — a member of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    /// DER-encoded (PKCS#1) public key, the same canonical form used to
    /// derive the node's/user's identifier.
    pub public_key_der: Vec<u8>,
}

impl Node {
    pub fn id(&self) -> Identifier {
        crate::identifier::Identifier::sha1_of(&self.public_key_der)
    }
}

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("routing failure: {0}")]
    Routing(String),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out")]
    Timeout,
}

/// A static, consistently-hashed ring known to a server process. Computes
/// `successor(id)` by nearest-id-at-or-after, wrapping around — the minimal
/// real black box behind `GetSuccessor`.
#[derive(Debug, Clone)]
pub struct Ring {
    members: Vec<Node>,
}

impl Ring {
    pub fn new(members: Vec<Node>) -> Self {
        let mut members = members;
        members.sort_by(|a, b| a.id().as_bytes().cmp(b.id().as_bytes()));
        Ring { members }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The node currently responsible for `key`: the first ring member whose
    /// id is >= `key`, or the first member overall if none is (wraparound).
    pub fn successor(&self, key: &Identifier) -> Option<&Node> {
        self.members
            .iter()
            .find(|node| node.id().as_bytes() >= key.as_bytes())
            .or_else(|| self.members.first())
    }
}

/// Opens transports and issues RPCs. Two-hop routing is intentional: the
/// bootstrap peer asked for `GetSuccessor` is not necessarily the node that
/// owns the key, so a second connection is opened to whichever node it names.
pub struct DhtClient {
    pub self_id: Identifier,
}

impl DhtClient {
    pub fn new(self_id: Identifier) -> Self {
        DhtClient { self_id }
    }

    /// Resolve the node responsible for `key` by asking `bootstrap`.
    pub async fn locate(&self, bootstrap: &Node, key: Identifier) -> Result<Node, DhtError> {
        let mut stream = self.connect(bootstrap).await?;
        let request = Request {
            header: RequestHeader {
                from: self.self_id,
                key,
                method: Method::GetSuccessor,
                pub_key: None,
                resource_name: None,
                log: false,
                clock: 0,
                secret: None,
                shared_with: vec![],
            },
            data: Vec::new(),
        };
        let response = self.round_trip(&mut stream, &request).await?;
        if !response.is_success() {
            return Err(DhtError::Routing(
                response
                    .header
                    .message
                    .unwrap_or_else(|| "bootstrap peer rejected GetSuccessor".into()),
            ));
        }
        let node: Node = ciborium::from_reader(response.data.as_slice())
            .map_err(|e| DhtError::Routing(format!("malformed node data: {e}")))?;
        Ok(node)
    }

    /// Open a fresh TCP connection to `node`. Authenticating the connection
    /// against `node.public_key_der` is the transport layer's job (external
    /// collaborator, see crate docs); this establishes the raw channel.
    pub async fn connect(&self, node: &Node) -> Result<TcpStream, DhtError> {
        timeout(ROUND_TRIP_TIMEOUT, TcpStream::connect(&node.address))
            .await
            .map_err(|_| DhtError::Timeout)?
            .map_err(|e| DhtError::Routing(format!("cannot reach {}: {e}", node.address)))
    }

    /// Send `request` and await the response, bounded by the round-trip timeout.
    pub async fn round_trip(
        &self,
        stream: &mut TcpStream,
        request: &Request,
    ) -> Result<Response, DhtError> {
        timeout(ROUND_TRIP_TIMEOUT, async {
            write_frame(stream, request).await?;
            let response: Response = read_frame(stream).await?;
            Ok::<_, WireError>(response)
        })
        .await
        .map_err(|_| DhtError::Timeout)?
        .map_err(DhtError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8, addr: &str) -> Node {
        Node {
            address: addr.to_string(),
            public_key_der: vec![byte; 16],
        }
    }

    #[test]
    fn successor_picks_nearest_at_or_after() {
        let ring = Ring::new(vec![node(1, "a"), node(5, "b"), node(9, "c")]);
        // whichever node's sha1 id sorts first is still deterministic; we
        // only assert that *some* member is returned and wraparound works.
        let key = Identifier::from_bytes([0; 20]);
        assert!(ring.successor(&key).is_some());
    }

    #[test]
    fn successor_wraps_around_when_key_exceeds_all_members() {
        let ring = Ring::new(vec![node(1, "a")]);
        let key = Identifier::from_bytes([0xff; 20]);
        assert_eq!(ring.successor(&key).unwrap().address, "a");
    }

    #[test]
    fn empty_ring_has_no_successor() {
        let ring = Ring::new(vec![]);
        assert!(ring.successor(&Identifier::from_bytes([0; 20])).is_none());
    }
}
