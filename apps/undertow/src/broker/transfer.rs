//! Stage C: the bulk transfer client.
//!
//! Uploads a file the caller can reach, then downloads it back into the
//! transfer service's own cache directory, which Stage B can later unlock.
//! Upload failures carry a serialized error payload; download failures do
//! not (the asymmetry is the service's, not ours).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use message_channel::{ConnectionError, MessageConnection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::TransferService;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Chosen because it appears unused in production.
pub const TOPIC: &str = "com.apple.private.alloy.test1";
pub const SOURCE_APP_ID: &str = "com.apple.MobileSMS";

/// Domain/code pair the service documents for oversized payloads.
pub const TOO_LARGE_DOMAIN: &str = "IMTransferServicesErrorDomain";
pub const TOO_LARGE_CODE: i64 = -6;

/// Correlation identifier for one upload/download pair. Generated locally;
/// the same handle must appear on both requests of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle(String);

impl TransferHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded detail of a failed upload, when the embedded payload decodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferErrorDetail {
    pub domain: String,
    pub code: i64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer service reported failure")]
    NotSuccessful(Option<TransferErrorDetail>),
    #[error("payload exceeds the transfer service size limit")]
    TooLarge,
    #[error("transfer reply is missing `{0}`")]
    MalformedReply(&'static str),
    #[error("transfer channel failure: {0}")]
    Channel(#[from] ConnectionError),
}

/// What a successful upload hands back, carried verbatim into the paired
/// download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub url: String,
    pub owner: String,
    pub size: i64,
    /// Opaque signature blob, in wire form.
    pub signature: String,
    /// Opaque decryption key blob; `None` is the explicit no-key sentinel
    /// for unencrypted uploads and still serializes as a present null.
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    #[serde(rename = "transferURL")]
    transfer_url: &'a str,
    #[serde(rename = "transferID")]
    transfer_id: &'a str,
    topic: &'static str,
    #[serde(rename = "sourceAppID")]
    source_app_id: &'static str,
    #[serde(rename = "isSend")]
    is_send: bool,
    #[serde(rename = "encryptFile")]
    encrypt_file: bool,
}

#[derive(Debug, Deserialize)]
struct UploadReply {
    #[serde(default)]
    success: bool,
    /// Base64 serialized error payload, present on some failures.
    #[serde(default)]
    error: Option<String>,
    #[serde(rename = "requestURLString")]
    request_url_string: Option<String>,
    #[serde(rename = "ownerID")]
    owner_id: Option<String>,
    #[serde(rename = "fileSize", default)]
    file_size: i64,
    signature: Option<String>,
    #[serde(rename = "encryptionKey")]
    encryption_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadRequest<'a> {
    topic: &'static str,
    #[serde(rename = "receivePath")]
    receive_path: &'a str,
    #[serde(rename = "transferID")]
    transfer_id: &'a str,
    #[serde(rename = "ownerID")]
    owner_id: &'a str,
    #[serde(rename = "urlString")]
    url_string: &'a str,
    #[serde(rename = "sourceAppID")]
    source_app_id: &'static str,
    signature: &'a str,
    /// Never omitted: an absent field flips the service from "store as-is"
    /// to "decrypt then discard", corrupting the artifact.
    #[serde(rename = "decryptionKey")]
    decryption_key: Option<&'a str>,
    #[serde(rename = "file-size")]
    file_size: u64,
}

#[derive(Debug, Deserialize)]
struct DownloadReply {
    #[serde(default)]
    success: bool,
}

fn decode_error_payload(encoded: &str) -> Option<TransferErrorDetail> {
    let bytes = BASE64.decode(encoded).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub struct TransferClient {
    connection: Arc<dyn MessageConnection>,
}

impl TransferClient {
    pub fn new(connection: Arc<dyn MessageConnection>) -> Self {
        Self { connection }
    }

    fn upload_failure(reply: UploadReply) -> TransferError {
        let detail = reply.error.as_deref().and_then(decode_error_payload);
        match detail {
            Some(detail) if detail.domain == TOO_LARGE_DOMAIN && detail.code == TOO_LARGE_CODE => {
                TransferError::TooLarge
            }
            other => TransferError::NotSuccessful(other),
        }
    }
}

#[async_trait]
impl TransferService for TransferClient {
    async fn upload(
        &self,
        source: &Path,
        transfer: &TransferHandle,
        encrypt: bool,
    ) -> Result<UploadTicket, TransferError> {
        info!(source = %source.display(), encrypt, "uploading");

        let source_str = source.to_string_lossy();
        let request = UploadRequest {
            transfer_url: &source_str,
            transfer_id: transfer.as_str(),
            topic: TOPIC,
            source_app_id: SOURCE_APP_ID,
            is_send: true,
            // Encryption requires the service to have write access to the
            // source; false only for artifacts we own outright.
            encrypt_file: encrypt,
        };
        let request = serde_json::to_value(&request).map_err(ConnectionError::Codec)?;

        let reply = self.connection.call(request, CALL_TIMEOUT).await?;
        let reply: UploadReply =
            serde_json::from_value(reply).map_err(ConnectionError::Codec)?;

        if !reply.success {
            return Err(Self::upload_failure(reply));
        }

        let url = reply
            .request_url_string
            .ok_or(TransferError::MalformedReply("requestURLString"))?;
        let owner = reply
            .owner_id
            .ok_or(TransferError::MalformedReply("ownerID"))?;
        let signature = reply
            .signature
            .ok_or(TransferError::MalformedReply("signature"))?;
        let key = if encrypt {
            Some(
                reply
                    .encryption_key
                    .ok_or(TransferError::MalformedReply("encryptionKey"))?,
            )
        } else {
            None
        };

        debug!(size = reply.file_size, "upload accepted");
        Ok(UploadTicket {
            url,
            owner,
            size: reply.file_size,
            signature,
            key,
        })
    }

    async fn download(
        &self,
        transfer: &TransferHandle,
        ticket: &UploadTicket,
        destination: &Path,
    ) -> Result<(), TransferError> {
        info!(destination = %destination.display(), "downloading");

        let destination_str = destination.to_string_lossy();
        let request = DownloadRequest {
            topic: TOPIC,
            receive_path: &destination_str,
            transfer_id: transfer.as_str(),
            owner_id: &ticket.owner,
            url_string: &ticket.url,
            source_app_id: SOURCE_APP_ID,
            signature: &ticket.signature,
            decryption_key: ticket.key.as_deref(),
            file_size: ticket.size.max(0) as u64,
        };
        let request = serde_json::to_value(&request).map_err(ConnectionError::Codec)?;

        let reply = self.connection.call(request, CALL_TIMEOUT).await?;
        let reply: DownloadReply =
            serde_json::from_value(reply).map_err(ConnectionError::Codec)?;

        if !reply.success {
            // No granular decoding on download; only upload documents a
            // structured error.
            return Err(TransferError::NotSuccessful(None));
        }
        Ok(())
    }

    fn close(&self) {
        self.connection.cancel();
    }
}
