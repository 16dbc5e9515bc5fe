//! Stage A: the launch-broker client.
//!
//! Synthesizes a faux extension bundle on disk, then asks the launch broker
//! over its message port to grant a mach capability token scoped to the
//! bundle's declared connection name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use message_channel::{MessagePort, PortFailure};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::broker::MachBroker;
use crate::config::ServiceId;
use crate::descriptor::{self, DescriptorError, ExtensionBundle, ScratchDir};
use crate::token::CapabilityToken;

/// Timeouts must be generous enough for a cold-launch broker.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("launch broker request failed: {0}")]
    BrokerRequestFailed(PortFailure),
    #[error("malformed launch broker reply: {0}")]
    InvalidReply(#[from] serde_json::Error),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Serialize)]
struct LauncherRequest<'a> {
    #[serde(rename = "executablePath")]
    executable_path: &'a str,
    #[serde(rename = "bundleIdentifier")]
    bundle_identifier: &'a str,
    #[serde(rename = "needsSandboxExtension")]
    needs_sandbox_extension: bool,
    #[serde(rename = "isExtension")]
    is_extension: bool,
}

#[derive(Debug, Deserialize)]
struct LauncherReply {
    #[serde(rename = "launchStatus", default)]
    launch_status: i64,
    #[serde(rename = "sandboxToken")]
    sandbox_token: String,
}

pub struct LauncherClient {
    port: Arc<dyn MessagePort>,
}

impl LauncherClient {
    pub fn new(port: Arc<dyn MessagePort>) -> Self {
        Self { port }
    }

    fn decode(reply: Option<Vec<u8>>) -> Result<CapabilityToken, LauncherError> {
        let payload = match reply {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(LauncherError::BrokerRequestFailed(PortFailure::EmptyReply)),
        };
        let decoded: LauncherReply = serde_json::from_slice(&payload)?;
        debug!(launch_status = decoded.launch_status, "launch broker replied");
        // A present-but-empty token is a decline, not a grant.
        if decoded.sandbox_token.is_empty() {
            return Err(LauncherError::BrokerRequestFailed(PortFailure::EmptyReply));
        }
        Ok(CapabilityToken::new(decoded.sandbox_token))
    }
}

#[async_trait]
impl MachBroker for LauncherClient {
    async fn request_mach_capability(
        &self,
        target_service: &ServiceId,
        bundle: &ExtensionBundle,
        scratch: &ScratchDir,
    ) -> Result<CapabilityToken, LauncherError> {
        let bundle_path = descriptor::write_extension_manifest(scratch, bundle, target_service)?;
        info!(service = %target_service, "requesting mach capability");

        // Both flags must be true: the broker silently declines to grant a
        // token if either is omitted.
        let executable_path = bundle_path.to_string_lossy();
        let request = LauncherRequest {
            executable_path: &executable_path,
            bundle_identifier: &bundle.identifier,
            needs_sandbox_extension: true,
            is_extension: true,
        };
        let payload = serde_json::to_vec(&request)?;

        let reply = self
            .port
            .request(&payload, SEND_TIMEOUT, RECEIVE_TIMEOUT)
            .await;

        // An unclassifiable status with a present reply is the success
        // shape; everything else is fatal for this attempt, no retry.
        let outcome = match PortFailure::from_status(reply.status) {
            PortFailure::Unknown => Self::decode(reply.payload),
            failure => Err(LauncherError::BrokerRequestFailed(failure)),
        };

        self.port.invalidate();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_channel::{InMemoryPort, PortReply, status};
    use serde_json::{Value, json};

    fn scratch() -> (tempfile::TempDir, ScratchDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = ScratchDir::create(dir.path()).expect("scratch");
        (dir, scratch)
    }

    #[tokio::test]
    async fn grants_token_on_success_reply() {
        let port = Arc::new(InMemoryPort::new(|payload| {
            let request: Value = serde_json::from_slice(payload).expect("request decodes");
            assert_eq!(request["needsSandboxExtension"], true);
            assert_eq!(request["isExtension"], true);
            assert_eq!(request["bundleIdentifier"], "com.apple.inputmethod.Korean");
            let reply = json!({ "launchStatus": 0, "sandboxToken": "tok-A" });
            PortReply::success(serde_json::to_vec(&reply).unwrap())
        }));
        let client = LauncherClient::new(port.clone());
        let (_dir, scratch) = scratch();

        let token = client
            .request_mach_capability(
                &ServiceId::new("com.example.transfer"),
                &ExtensionBundle::korean(),
                &scratch,
            )
            .await
            .expect("token granted");
        assert_eq!(token.as_str(), "tok-A");
        assert_eq!(port.invalidations(), 1);
    }

    #[tokio::test]
    async fn classified_failure_is_fatal_and_invalidates() {
        let port = Arc::new(InMemoryPort::failing(status::SEND_TIMEOUT));
        let client = LauncherClient::new(port.clone());
        let (_dir, scratch) = scratch();

        let err = client
            .request_mach_capability(
                &ServiceId::new("com.example.transfer"),
                &ExtensionBundle::korean(),
                &scratch,
            )
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            LauncherError::BrokerRequestFailed(PortFailure::SendTimeout)
        ));
        assert_eq!(port.invalidations(), 1);
    }

    #[tokio::test]
    async fn absent_reply_is_empty_reply_failure() {
        let port = Arc::new(InMemoryPort::new(|_| PortReply {
            status: status::SUCCESS,
            payload: None,
        }));
        let client = LauncherClient::new(port.clone());
        let (_dir, scratch) = scratch();

        let err = client
            .request_mach_capability(
                &ServiceId::new("com.example.transfer"),
                &ExtensionBundle::tcim(),
                &scratch,
            )
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            LauncherError::BrokerRequestFailed(PortFailure::EmptyReply)
        ));
        assert_eq!(port.invalidations(), 1);
    }

    #[tokio::test]
    async fn never_returns_empty_token_as_success() {
        let port = Arc::new(InMemoryPort::new(|_| {
            PortReply::success(serde_json::to_vec(&json!({ "launchStatus": 0 })).unwrap())
        }));
        let client = LauncherClient::new(port);
        let (_dir, scratch) = scratch();

        // A reply missing the token field is a decode error, not an empty
        // token marked as success.
        let err = client
            .request_mach_capability(
                &ServiceId::new("com.example.transfer"),
                &ExtensionBundle::korean(),
                &scratch,
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, LauncherError::InvalidReply(_)));
    }

    #[tokio::test]
    async fn present_but_empty_token_is_a_failure() {
        let port = Arc::new(InMemoryPort::new(|_| {
            let reply = json!({ "launchStatus": 0, "sandboxToken": "" });
            PortReply::success(serde_json::to_vec(&reply).unwrap())
        }));
        let client = LauncherClient::new(port.clone());
        let (_dir, scratch) = scratch();

        let err = client
            .request_mach_capability(
                &ServiceId::new("com.example.transfer"),
                &ExtensionBundle::korean(),
                &scratch,
            )
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            LauncherError::BrokerRequestFailed(PortFailure::EmptyReply)
        ));
        assert_eq!(port.invalidations(), 1);
    }
}
