//! Stage B: the resource-coordinator client.
//!
//! Synthesizes a scene descriptor referencing the real target path, issues
//! a local read extension so the coordinator can verify it, then asks the
//! coordinator to grant a filesystem capability for the embedded path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use message_channel::{ConnectionError, MessageConnection};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::broker::FsBroker;
use crate::descriptor::{self, DescriptorError, ScratchDir};
use crate::sandbox::{SandboxAuthority, SandboxError};
use crate::token::CapabilityToken;

/// Explicit per-call bound; the transport default is not inherited.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed identifier marking a url record as such.
pub const URL_RECORD_MAGIC: &str = "c3853dcc-9776-4114-b6c1-fd9f51944a6d";

#[derive(Debug, Error)]
pub enum ResourcesError {
    #[error("coordinator returned status {0}")]
    NonZeroStatus(u64),
    #[error("coordinator granted an unexpected extension set")]
    UnknownExtensions,
    #[error("descriptor location is not an absolute path")]
    InvalidLocation,
    #[error("coordinator channel failure: {0}")]
    Channel(#[from] ConnectionError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Fixed-shape record carrying an absolute file URL and a null base.
fn url_record(path: &Path) -> Result<Value, ResourcesError> {
    let url = url::Url::from_file_path(path).map_err(|_| ResourcesError::InvalidLocation)?;
    Ok(json!({
        "com.apple.CFURL.magic": URL_RECORD_MAGIC,
        "com.apple.CFURL.string": url.as_str(),
        "com.apple.CFURL.base": Value::Null,
    }))
}

#[derive(Debug, Deserialize)]
struct CoordinatorReply {
    #[serde(rename = "returnCode", default)]
    return_code: u64,
    #[serde(default)]
    arguments: ReplyArguments,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyArguments {
    #[serde(default)]
    extensions: Vec<GrantedExtension>,
}

#[derive(Debug, Deserialize)]
struct GrantedExtension {
    extension: String,
}

pub struct ResourcesClient {
    connection: Arc<dyn MessageConnection>,
    authority: Arc<dyn SandboxAuthority>,
}

impl ResourcesClient {
    pub fn new(
        connection: Arc<dyn MessageConnection>,
        authority: Arc<dyn SandboxAuthority>,
    ) -> Self {
        Self {
            connection,
            authority,
        }
    }

    fn validate(reply: Value) -> Result<CapabilityToken, ResourcesError> {
        let reply: CoordinatorReply =
            serde_json::from_value(reply).map_err(ConnectionError::Codec)?;
        if reply.return_code != 0 {
            return Err(ResourcesError::NonZeroStatus(reply.return_code));
        }
        // Exactly one granted extension: zero means nothing was granted,
        // more than one is ambiguous and rejected rather than guessed at.
        let mut extensions = reply.arguments.extensions;
        if extensions.len() != 1 {
            return Err(ResourcesError::UnknownExtensions);
        }
        let granted = extensions.remove(0);
        Ok(CapabilityToken::new(granted.extension))
    }
}

#[async_trait]
impl FsBroker for ResourcesClient {
    async fn request_fs_capability(
        &self,
        real_path: &Path,
        scratch: &ScratchDir,
    ) -> Result<CapabilityToken, ResourcesError> {
        let scene_path = descriptor::write_scene_document(scratch, real_path)?;
        // The coordinator runs under a different identity and cannot read
        // our scratch space without an extension covering the descriptor.
        let descriptor_token = self.authority.issue_for_path(&scene_path)?;
        info!(path = %real_path.display(), "requesting filesystem capability");

        // A directory scope of "/" is deliberately permissive; the
        // coordinator grants only what the descriptor's reference asks for.
        let request = json!({
            "arguments": {
                "assetDirectoryURLs": [url_record(Path::new("/"))?],
                "extension": descriptor_token.as_str(),
                "url": url_record(&scene_path)?,
            }
        });

        let reply = self.connection.call(request, CALL_TIMEOUT).await;
        self.connection.cancel();
        Self::validate(reply?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::LocalExtensionToken;
    use message_channel::InMemoryConnection;
    use std::sync::Mutex;

    struct StubAuthority {
        issued: Mutex<Vec<String>>,
    }

    impl StubAuthority {
        fn new() -> Self {
            Self {
                issued: Mutex::new(Vec::new()),
            }
        }
    }

    impl SandboxAuthority for StubAuthority {
        fn issue_for_path(&self, path: &Path) -> Result<LocalExtensionToken, SandboxError> {
            self.issued
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(LocalExtensionToken::new("local-ext"))
        }

        fn consume_mach_token(&self, _: &CapabilityToken) -> Result<(), SandboxError> {
            Ok(())
        }

        fn consume_fs_token(&self, _: &CapabilityToken) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn scratch() -> (tempfile::TempDir, ScratchDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = ScratchDir::create(dir.path()).expect("scratch");
        (dir, scratch)
    }

    fn reply_with_extensions(extensions: Vec<Value>) -> Value {
        json!({
            "returnCode": 0,
            "arguments": { "extensions": extensions }
        })
    }

    #[tokio::test]
    async fn single_granted_extension_is_returned_and_channel_cancelled_once() {
        let connection = Arc::new(InMemoryConnection::new(|request| {
            let arguments = &request["arguments"];
            assert_eq!(arguments["extension"], "local-ext");
            assert_eq!(
                arguments["assetDirectoryURLs"][0]["com.apple.CFURL.string"],
                "file:///"
            );
            assert!(arguments["url"]["com.apple.CFURL.base"].is_null());
            Ok(reply_with_extensions(vec![json!({
                "url": {},
                "type": "image",
                "extension": "ext-123",
            })]))
        }));
        let client = ResourcesClient::new(connection.clone(), Arc::new(StubAuthority::new()));
        let (_dir, scratch) = scratch();

        let token = client
            .request_fs_capability(Path::new("/var/cache/siphoned.dat"), &scratch)
            .await
            .expect("granted");
        assert_eq!(token.as_str(), "ext-123");
        assert_eq!(connection.cancellations(), 1);
    }

    #[tokio::test]
    async fn zero_extensions_is_rejected() {
        let connection = Arc::new(InMemoryConnection::new(|_| {
            Ok(reply_with_extensions(vec![]))
        }));
        let client = ResourcesClient::new(connection.clone(), Arc::new(StubAuthority::new()));
        let (_dir, scratch) = scratch();

        let err = client
            .request_fs_capability(Path::new("/var/cache/siphoned.dat"), &scratch)
            .await
            .expect_err("must reject");
        assert!(matches!(err, ResourcesError::UnknownExtensions));
        assert_eq!(connection.cancellations(), 1);
    }

    #[tokio::test]
    async fn multiple_extensions_are_ambiguous() {
        let connection = Arc::new(InMemoryConnection::new(|_| {
            Ok(reply_with_extensions(vec![
                json!({ "extension": "ext-1" }),
                json!({ "extension": "ext-2" }),
            ]))
        }));
        let client = ResourcesClient::new(connection, Arc::new(StubAuthority::new()));
        let (_dir, scratch) = scratch();

        let err = client
            .request_fs_capability(Path::new("/var/cache/siphoned.dat"), &scratch)
            .await
            .expect_err("must reject");
        assert!(matches!(err, ResourcesError::UnknownExtensions));
    }

    #[tokio::test]
    async fn nonzero_status_is_surfaced() {
        let connection = Arc::new(InMemoryConnection::new(|_| {
            Ok(json!({ "returnCode": 22, "arguments": { "extensions": [] } }))
        }));
        let client = ResourcesClient::new(connection, Arc::new(StubAuthority::new()));
        let (_dir, scratch) = scratch();

        let err = client
            .request_fs_capability(Path::new("/var/cache/siphoned.dat"), &scratch)
            .await
            .expect_err("must reject");
        assert!(matches!(err, ResourcesError::NonZeroStatus(22)));
    }

    #[tokio::test]
    async fn descriptor_extension_is_issued_before_request() {
        let authority = Arc::new(StubAuthority::new());
        let connection = Arc::new(InMemoryConnection::new(|_| {
            Ok(reply_with_extensions(vec![json!({ "extension": "ext-9" })]))
        }));
        let client = ResourcesClient::new(connection, authority.clone());
        let (_dir, scratch) = scratch();

        client
            .request_fs_capability(Path::new("/var/cache/siphoned.dat"), &scratch)
            .await
            .expect("granted");
        let issued = authority.issued.lock().unwrap();
        assert_eq!(issued.len(), 1);
        assert!(issued[0].ends_with("faux.dae"));
    }
}
