//! Request/response message types and the length-prefixed CBOR framing used
//! to carry them over a plain TCP stream.
//!
//! The transport itself — authentication, confidentiality, retries — is an
//! external collaborator (see crate docs); this module is the minimal
//! concrete channel needed to actually drive the protocol end to end: each
//! message is CBOR-encoded and prefixed with a 4-byte big-endian length.

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// RPC methods exposed by a `shardvault` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    UserRegistration,
    GetSuccessor,
    GetFile,
    PostFile,
    DeleteFile,
    GetPublicKey,
    PostPublicKey,
}

/// A `(recipient_id, wrapped_session_key)` pair carried on a `PostFile` to
/// grow the owner table, or on a `share` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedOwner {
    pub id: Identifier,
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub from: Identifier,
    pub key: Identifier,
    pub method: Method,
    pub pub_key: Option<Vec<u8>>,
    pub resource_name: Option<String>,
    pub log: bool,
    pub clock: u64,
    pub secret: Option<Vec<u8>>,
    pub shared_with: Vec<SharedOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub header: RequestHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub secret: Option<Vec<u8>>,
    pub clock: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub header: ResponseHeader,
    pub data: Vec<u8>,
}

impl Response {
    pub fn success(secret: Option<Vec<u8>>, clock: u64, data: Vec<u8>) -> Self {
        Response {
            status: Status::Success,
            header: ResponseHeader {
                secret,
                clock,
                message: None,
            },
            data,
        }
    }

    pub fn error(clock: u64, message: impl Into<String>) -> Self {
        Response {
            status: Status::Error,
            header: ResponseHeader {
                secret: None,
                clock,
                message: Some(message.into()),
            },
            data: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("cbor encode error: {0}")]
    Encode(String),
    #[error("cbor decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Generous but finite — guards against a malformed/hostile length prefix
/// turning into an unbounded allocation.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Write a single length-prefixed CBOR frame to `stream`.
pub async fn write_frame<T, S>(stream: &mut S, value: &T) -> Result<(), WireError>
where
    T: Serialize,
    S: AsyncWriteExt + Unpin,
{
    let payload = encode_cbor(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a single length-prefixed CBOR frame from `stream`.
pub async fn read_frame<T, S>(stream: &mut S) -> Result<T, WireError>
where
    T: for<'de> Deserialize<'de>,
    S: AsyncReadExt + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    decode_cbor(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrips_over_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = Request {
            header: RequestHeader {
                from: Identifier::from_bytes([1; 20]),
                key: Identifier::from_bytes([2; 20]),
                method: Method::GetFile,
                pub_key: None,
                resource_name: Some("x.txt".into()),
                log: true,
                clock: 5,
                secret: None,
                shared_with: vec![],
            },
            data: vec![1, 2, 3],
        };
        write_frame(&mut a, &req).await.unwrap();
        let received: Request = read_frame(&mut b).await.unwrap();
        assert_eq!(received.header.resource_name, req.header.resource_name);
        assert_eq!(received.data, req.data);
    }

    #[test]
    fn response_success_and_error_round_trip_status() {
        let ok = Response::success(Some(vec![1]), 3, vec![9]);
        assert!(ok.is_success());
        let err = Response::error(4, "not found");
        assert!(!err.is_success());
        assert_eq!(err.header.message.as_deref(), Some("not found"));
    }
}
