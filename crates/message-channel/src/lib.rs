//! Structured-message channels used to reach privileged coordinator
//! services.
//!
//! Two channel shapes exist, mirroring the two kinds of coordinator:
//!
//! - [`MessagePort`]: a one-shot synchronous request/reply port with
//!   explicit send and receive timeouts. Outcomes carry a raw status code
//!   alongside any reply payload; classification into the closed
//!   [`PortFailure`] set is the caller's job.
//! - [`MessageConnection`]: a connection-oriented channel exchanging JSON
//!   documents. Unsolicited invalidation/interruption notices from the far
//!   side are swallowed by the implementation.
//!
//! Unix-socket implementations live in [`unix`]; in-memory loopbacks for
//! tests live in [`memory`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod unix;

pub use memory::{InMemoryConnection, InMemoryPort};
pub use unix::{UnixMessageConnection, UnixMessagePort};

/// Raw port statuses, numbered after the message-port constants of the
/// coordinator side.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const SEND_TIMEOUT: i32 = -1;
    pub const RECEIVE_TIMEOUT: i32 = -2;
    pub const ENDPOINT_INVALID: i32 = -3;
    pub const TRANSPORT_FAILURE: i32 = -4;
    pub const BECAME_INVALID: i32 = -5;
}

/// Classified failure of a message-port exchange.
///
/// `Unknown` covers every status outside the known failure set, including
/// success; a port exchange only counts as successful when the status
/// classifies as `Unknown` *and* a reply payload is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortFailure {
    #[error("send timed out")]
    SendTimeout,
    #[error("receive timed out")]
    ReceiveTimeout,
    #[error("endpoint is invalid")]
    EndpointInvalid,
    #[error("transport failure")]
    TransportFailure,
    #[error("endpoint became invalid")]
    EndpointBecameInvalid,
    #[error("reply was empty")]
    EmptyReply,
    #[error("unknown port status")]
    Unknown,
}

impl PortFailure {
    pub fn from_status(code: i32) -> Self {
        match code {
            status::SEND_TIMEOUT => Self::SendTimeout,
            status::RECEIVE_TIMEOUT => Self::ReceiveTimeout,
            status::ENDPOINT_INVALID => Self::EndpointInvalid,
            status::TRANSPORT_FAILURE => Self::TransportFailure,
            status::BECAME_INVALID => Self::EndpointBecameInvalid,
            _ => Self::Unknown,
        }
    }
}

/// Outcome of one port round-trip: the raw status plus the reply, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReply {
    pub status: i32,
    pub payload: Option<Vec<u8>>,
}

impl PortReply {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: status::SUCCESS,
            payload: Some(payload),
        }
    }

    pub fn failed(status: i32) -> Self {
        Self {
            status,
            payload: None,
        }
    }
}

/// One-shot request/reply port.
#[async_trait]
pub trait MessagePort: Send + Sync {
    /// Performs a single bounded round-trip. Never panics; all failure
    /// modes are reported through the reply status.
    async fn request(
        &self,
        payload: &[u8],
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> PortReply;

    /// Tears the port down. Idempotent; must be called on every exit path
    /// of an exchange.
    fn invalidate(&self);
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to reach endpoint: {0}")]
    Connect(String),
    #[error("call timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Connection-oriented structured-message channel.
#[async_trait]
pub trait MessageConnection: Send + Sync {
    /// Sends one document and awaits its reply, bounded by `timeout`.
    async fn call(&self, message: Value, timeout: Duration) -> Result<Value, ConnectionError>;

    /// Cancels the connection. Idempotent. Implementations may allow a
    /// later call to re-establish the connection.
    fn cancel(&self);
}

/// Key under which coordinators deliver out-of-band channel notices
/// (invalidation, interruption). Frames carrying it are not replies and
/// are silently dropped by connection implementations.
pub const NOTICE_KEY: &str = "channelNotice";

pub(crate) fn is_notice(message: &Value) -> bool {
    message
        .as_object()
        .is_some_and(|map| map.contains_key(NOTICE_KEY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_classify_into_closed_set() {
        assert_eq!(
            PortFailure::from_status(status::SEND_TIMEOUT),
            PortFailure::SendTimeout
        );
        assert_eq!(
            PortFailure::from_status(status::RECEIVE_TIMEOUT),
            PortFailure::ReceiveTimeout
        );
        assert_eq!(
            PortFailure::from_status(status::ENDPOINT_INVALID),
            PortFailure::EndpointInvalid
        );
        assert_eq!(
            PortFailure::from_status(status::TRANSPORT_FAILURE),
            PortFailure::TransportFailure
        );
        assert_eq!(
            PortFailure::from_status(status::BECAME_INVALID),
            PortFailure::EndpointBecameInvalid
        );
    }

    #[test]
    fn success_and_unrecognized_statuses_are_unknown() {
        assert_eq!(PortFailure::from_status(status::SUCCESS), PortFailure::Unknown);
        assert_eq!(PortFailure::from_status(7), PortFailure::Unknown);
        assert_eq!(PortFailure::from_status(-99), PortFailure::Unknown);
    }

    #[test]
    fn notices_are_recognized() {
        assert!(is_notice(&json!({ NOTICE_KEY: "invalidated" })));
        assert!(!is_notice(&json!({ "returnCode": 0 })));
        assert!(!is_notice(&json!("plain string")));
    }
}
