//! Capability broker clients, one per coordinator service.
//!
//! Each stage of the pipeline talks to a different privileged coordinator
//! over a different channel shape. The orchestrator depends only on the
//! traits here; the concrete clients adapt each coordinator's wire format
//! and failure taxonomy.

use std::path::Path;

use async_trait::async_trait;

use crate::config::ServiceId;
use crate::descriptor::{ExtensionBundle, ScratchDir};
use crate::token::CapabilityToken;

pub mod launcher;
pub mod resources;
pub mod transfer;

pub use launcher::{LauncherClient, LauncherError};
pub use resources::{ResourcesClient, ResourcesError};
pub use transfer::{TransferClient, TransferError, TransferHandle, UploadTicket};

/// Stage A: brokers a mach capability scoped to a named target service.
#[async_trait]
pub trait MachBroker: Send + Sync {
    async fn request_mach_capability(
        &self,
        target_service: &ServiceId,
        bundle: &ExtensionBundle,
        scratch: &ScratchDir,
    ) -> Result<CapabilityToken, LauncherError>;
}

/// Stage B: brokers a filesystem capability scoped to a real path.
#[async_trait]
pub trait FsBroker: Send + Sync {
    async fn request_fs_capability(
        &self,
        real_path: &Path,
        scratch: &ScratchDir,
    ) -> Result<CapabilityToken, ResourcesError>;
}

/// Stage C: the bulk transfer service. One connection serves one paired
/// upload/download exchange; `close` ends it, success or failure.
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn upload(
        &self,
        source: &Path,
        transfer: &TransferHandle,
        encrypt: bool,
    ) -> Result<UploadTicket, TransferError>;

    async fn download(
        &self,
        transfer: &TransferHandle,
        ticket: &UploadTicket,
        destination: &Path,
    ) -> Result<(), TransferError>;

    fn close(&self);
}
