//! Unix-domain-socket channel implementations.
//!
//! Endpoints are socket paths; frames are a 4-byte big-endian length prefix
//! followed by one JSON document.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::{is_notice, status, ConnectionError, MessageConnection, MessagePort, PortReply};

pub(crate) async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

pub(crate) async fn read_frame(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// One-shot request/reply port over a unix socket. A fresh stream is opened
/// per request and torn down when the exchange ends.
pub struct UnixMessagePort {
    socket: PathBuf,
    invalidated: AtomicBool,
}

impl UnixMessagePort {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            invalidated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessagePort for UnixMessagePort {
    async fn request(
        &self,
        payload: &[u8],
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> PortReply {
        if self.invalidated.load(Ordering::SeqCst) {
            return PortReply::failed(status::ENDPOINT_INVALID);
        }

        let mut stream = match UnixStream::connect(&self.socket).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(socket = %self.socket.display(), %err, "port endpoint unreachable");
                return PortReply::failed(status::ENDPOINT_INVALID);
            }
        };

        match timeout(send_timeout, write_frame(&mut stream, payload)).await {
            Err(_) => return PortReply::failed(status::SEND_TIMEOUT),
            Ok(Err(err)) => {
                debug!(%err, "port send failed");
                return PortReply::failed(status::TRANSPORT_FAILURE);
            }
            Ok(Ok(())) => {}
        }

        match timeout(recv_timeout, read_frame(&mut stream)).await {
            Err(_) => PortReply::failed(status::RECEIVE_TIMEOUT),
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                PortReply::failed(status::BECAME_INVALID)
            }
            Ok(Err(err)) => {
                debug!(%err, "port receive failed");
                PortReply::failed(status::TRANSPORT_FAILURE)
            }
            Ok(Ok(frame)) if frame.is_empty() => PortReply {
                status: status::SUCCESS,
                payload: None,
            },
            Ok(Ok(frame)) => PortReply::success(frame),
        }
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }
}

/// Connection-oriented channel over a unix socket.
///
/// Connects lazily on the first call and re-connects after a cancel, so one
/// handle can serve several paired exchanges. At most one call may be in
/// flight at a time.
pub struct UnixMessageConnection {
    socket: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl UnixMessageConnection {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            stream: Mutex::new(None),
        }
    }
}

fn io_error(err: io::Error) -> ConnectionError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ConnectionError::Closed
    } else {
        ConnectionError::Transport(err.to_string())
    }
}

#[async_trait]
impl MessageConnection for UnixMessageConnection {
    async fn call(&self, message: Value, deadline: Duration) -> Result<Value, ConnectionError> {
        let existing = self
            .stream
            .lock()
            .expect("connection lock poisoned")
            .take();
        let mut stream = match existing {
            Some(stream) => stream,
            None => UnixStream::connect(&self.socket)
                .await
                .map_err(|err| ConnectionError::Connect(err.to_string()))?,
        };

        let exchange = async {
            let bytes = serde_json::to_vec(&message)?;
            write_frame(&mut stream, &bytes).await.map_err(io_error)?;
            loop {
                let frame = read_frame(&mut stream).await.map_err(io_error)?;
                let value: Value = serde_json::from_slice(&frame)?;
                if is_notice(&value) {
                    trace!("dropping channel notice");
                    continue;
                }
                return Ok(value);
            }
        };

        match timeout(deadline, exchange).await {
            // The stream is dropped on timeout; a later call reconnects.
            Err(_) => Err(ConnectionError::Timeout),
            Ok(Err(err)) => Err(err),
            Ok(Ok(value)) => {
                self.stream
                    .lock()
                    .expect("connection lock poisoned")
                    .replace(stream);
                Ok(value)
            }
        }
    }

    fn cancel(&self) {
        if let Ok(mut guard) = self.stream.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    const SHORT: Duration = Duration::from_millis(200);
    const LONG: Duration = Duration::from_secs(5);

    fn socket_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    async fn spawn_replier(listener: UnixListener, frames: Vec<Option<Vec<u8>>>) {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _request = read_frame(&mut stream).await.expect("read request");
            for frame in frames {
                match frame {
                    Some(bytes) => write_frame(&mut stream, &bytes).await.expect("write"),
                    // Hold the connection open without replying.
                    None => tokio::time::sleep(Duration::from_secs(30)).await,
                }
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
    }

    #[tokio::test]
    async fn port_round_trip_over_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir, "broker.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_replier(listener, vec![Some(b"granted".to_vec())]).await;

        let port = UnixMessagePort::new(&path);
        let reply = port.request(b"hello", LONG, LONG).await;
        assert_eq!(reply.status, status::SUCCESS);
        assert_eq!(reply.payload.as_deref(), Some(&b"granted"[..]));
    }

    #[tokio::test]
    async fn missing_endpoint_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = UnixMessagePort::new(socket_path(&dir, "absent.sock"));
        let reply = port.request(b"hello", SHORT, SHORT).await;
        assert_eq!(reply.status, status::ENDPOINT_INVALID);
    }

    #[tokio::test]
    async fn silent_endpoint_times_out_on_receive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir, "mute.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_replier(listener, vec![None]).await;

        let port = UnixMessagePort::new(&path);
        let reply = port.request(b"hello", LONG, SHORT).await;
        assert_eq!(reply.status, status::RECEIVE_TIMEOUT);
    }

    #[tokio::test]
    async fn invalidated_port_refuses_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = UnixMessagePort::new(socket_path(&dir, "any.sock"));
        port.invalidate();
        let reply = port.request(b"hello", LONG, LONG).await;
        assert_eq!(reply.status, status::ENDPOINT_INVALID);
    }

    #[tokio::test]
    async fn connection_skips_notices_before_reply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir, "coordinator.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let notice = serde_json::to_vec(&json!({ crate::NOTICE_KEY: "interrupted" })).unwrap();
        let reply = serde_json::to_vec(&json!({ "returnCode": 0 })).unwrap();
        spawn_replier(listener, vec![Some(notice), Some(reply)]).await;

        let connection = UnixMessageConnection::new(&path);
        let value = connection
            .call(json!({ "arguments": {} }), LONG)
            .await
            .expect("call ok");
        assert_eq!(value["returnCode"], 0);
    }

    #[tokio::test]
    async fn connection_call_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir, "slow.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_replier(listener, vec![None]).await;

        let connection = UnixMessageConnection::new(&path);
        let err = connection
            .call(json!({}), SHORT)
            .await
            .expect_err("should time out");
        assert!(matches!(err, ConnectionError::Timeout));
    }
}
