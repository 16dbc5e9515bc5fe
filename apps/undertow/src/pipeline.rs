//! The pipeline orchestrator: sequences the three broker stages and the
//! redemptions between them.
//!
//! Order matters and cannot be relaxed: the transfer service is only
//! reachable once Stage A's token is redeemed, and a downloaded artifact is
//! only visible once Stage B's token is redeemed. Stages run strictly
//! sequentially; nothing is retried.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{
    FsBroker, LauncherClient, LauncherError, MachBroker, ResourcesClient, ResourcesError,
    TransferClient, TransferError, TransferHandle, TransferService,
};
use crate::config::Config;
use crate::descriptor::{DescriptorError, ScratchDir};
use crate::extract::{self, ExtractError};
use crate::sandbox::{DylibAuthority, SandboxAuthority, SandboxError};
use message_channel::{UnixMessageConnection, UnixMessagePort};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Launcher(#[from] LauncherError),
    #[error(transparent)]
    Resources(#[from] ResourcesError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("failed to stage artifact: {0}")]
    Staging(#[from] io::Error),
}

/// Outcome counts for one completed run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub extracted: usize,
    pub skipped: usize,
}

pub struct Pipeline {
    authority: Arc<dyn SandboxAuthority>,
    launcher: Arc<dyn MachBroker>,
    resources: Arc<dyn FsBroker>,
    transfer: Arc<dyn TransferService>,
    config: Config,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wires the real channels and authority. Authority resolution happens
    /// here, before any channel is touched; a missing module fails the
    /// whole run up front.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let authority: Arc<dyn SandboxAuthority> =
            Arc::new(DylibAuthority::resolve(&config.authority_module)?);

        let port = Arc::new(UnixMessagePort::new(
            config.socket_path(&config.launch_broker),
        ));
        let launcher = Arc::new(LauncherClient::new(port));

        let coordinator = Arc::new(UnixMessageConnection::new(
            config.socket_path(&config.resource_coordinator),
        ));
        let resources = Arc::new(ResourcesClient::new(coordinator, authority.clone()));

        let transfer = Arc::new(TransferClient::new(Arc::new(UnixMessageConnection::new(
            config.socket_path(&config.transfer_service),
        ))));

        Ok(Self::with_components(
            config, authority, launcher, resources, transfer,
        ))
    }

    /// Injection constructor; integration tests drive the pipeline over
    /// in-memory channels through this.
    pub fn with_components(
        config: Config,
        authority: Arc<dyn SandboxAuthority>,
        launcher: Arc<dyn MachBroker>,
        resources: Arc<dyn FsBroker>,
        transfer: Arc<dyn TransferService>,
    ) -> Self {
        Self {
            authority,
            launcher,
            resources,
            transfer,
            config,
        }
    }

    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let scratch = ScratchDir::create(&self.config.scratch_dir)?;
        // One cache artifact per run, named by a random identifier.
        let cache_path = self
            .config
            .transfer_cache_dir
            .join(format!("{}.dat", Uuid::new_v4()));

        info!(service = %self.config.transfer_service, "stage A: obtaining mach capability");
        let mach_token = self
            .launcher
            .request_mach_capability(
                &self.config.transfer_service,
                &self.config.extension_bundle,
                &scratch,
            )
            .await?;
        self.authority.consume_mach_token(&mach_token)?;
        info!("stage A: capability redeemed");

        // Bootstrap with an artifact we own outright: the transfer service
        // cannot read our scratch space for encryption, so this one goes up
        // unencrypted, and its download seeds the cache path Stage B needs.
        info!("staging dummy artifact for the bootstrap transfer");
        let dummy = stage_dummy_artifact(&scratch)?;
        self.siphon(&dummy, &cache_path, false).await?;

        let fs_token = self
            .resources
            .request_fs_capability(&cache_path, &scratch)
            .await?;
        self.authority.consume_fs_token(&fs_token)?;
        info!("stage B: cache path unlocked");

        let mut report = RunReport::default();
        for target in &self.config.targets {
            info!(path = %target.path.display(), "siphoning target");
            match self.siphon(&target.path, &cache_path, true).await {
                Ok(()) => {}
                Err(PipelineError::Transfer(TransferError::TooLarge)) => {
                    // The only tolerated partial failure: move on to the
                    // next target instead of aborting the run.
                    warn!(path = %target.path.display(), "target too large, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(other) => return Err(other),
            }

            let fs_token = self
                .resources
                .request_fs_capability(&cache_path, &scratch)
                .await?;
            self.authority.consume_fs_token(&fs_token)?;

            extract::read_artifact(&scratch, &cache_path, target.extractor)?;
            report.extracted += 1;
        }

        info!(
            extracted = report.extracted,
            skipped = report.skipped,
            "run complete"
        );
        Ok(report)
    }

    /// One paired upload/download exchange; the connection is closed when
    /// the pair completes or fails.
    async fn siphon(
        &self,
        source: &Path,
        destination: &Path,
        encrypt: bool,
    ) -> Result<(), PipelineError> {
        let handle = TransferHandle::new();
        let outcome = async {
            let ticket = self.transfer.upload(source, &handle, encrypt).await?;
            self.transfer.download(&handle, &ticket, destination).await
        }
        .await;
        self.transfer.close();
        outcome.map_err(PipelineError::from)
    }
}

// A 1x1 transparent PNG; any owned readable file works for the bootstrap.
const DUMMY_ARTIFACT: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0x63, 0x64,
    0x60, 0xf8, 0x5f, 0x0f, 0x00, 0x02, 0x87, 0x01, 0x80, 0xeb, 0x47, 0xba, 0x92, 0x00, 0x00,
    0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Copies the bundled dummy artifact into scratch and returns its path.
pub fn stage_dummy_artifact(scratch: &ScratchDir) -> Result<PathBuf, PipelineError> {
    let path = scratch.stage("dummy.png")?;
    fs::write(&path, DUMMY_ARTIFACT)?;
    Ok(path)
}
