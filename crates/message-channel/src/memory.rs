//! In-memory loopback channels for tests and non-transport contexts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ConnectionError, MessageConnection, MessagePort, PortReply};

type PortHandler = dyn Fn(&[u8]) -> PortReply + Send + Sync;
type ConnectionHandler = dyn Fn(Value) -> Result<Value, ConnectionError> + Send + Sync;

/// Handler-backed [`MessagePort`]; each request is answered synchronously
/// by the supplied closure.
pub struct InMemoryPort {
    handler: Box<PortHandler>,
    invalidations: AtomicUsize,
}

impl InMemoryPort {
    pub fn new(handler: impl Fn(&[u8]) -> PortReply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            invalidations: AtomicUsize::new(0),
        }
    }

    /// A port that fails every exchange with the given status.
    pub fn failing(status: i32) -> Self {
        Self::new(move |_| PortReply::failed(status))
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePort for InMemoryPort {
    async fn request(
        &self,
        payload: &[u8],
        _send_timeout: Duration,
        _recv_timeout: Duration,
    ) -> PortReply {
        (self.handler)(payload)
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handler-backed [`MessageConnection`] tracking cancellations.
pub struct InMemoryConnection {
    handler: Box<ConnectionHandler>,
    cancellations: AtomicUsize,
}

impl InMemoryConnection {
    pub fn new(
        handler: impl Fn(Value) -> Result<Value, ConnectionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            cancellations: AtomicUsize::new(0),
        }
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageConnection for InMemoryConnection {
    async fn call(&self, message: Value, _timeout: Duration) -> Result<Value, ConnectionError> {
        (self.handler)(message)
    }

    fn cancel(&self) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
}
