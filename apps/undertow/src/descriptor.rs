//! Disposable on-disk descriptors: minimal documents manufactured solely so
//! a coordinator's verification logic accepts a request referencing them.
//! Written fresh per request, never read back by us.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::ServiceId;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("scratch io failure: {0}")]
    Io(#[from] io::Error),
}

/// Handle to the scratch directory used for descriptors and staged
/// artifacts. Scoped to one pipeline run; concurrent runs must not share
/// one (names are fixed and overwritten by delete).
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, DescriptorError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path for `name`, deleting any stale file or directory of
    /// the same name first.
    pub fn stage(&self, name: &str) -> Result<PathBuf, DescriptorError> {
        let path = self.root.join(name);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(path)
    }
}

/// A real extension-bundle identity the launch broker already knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionBundle {
    /// Filename the faux bundle takes on disk.
    pub filename: String,
    /// The bundle identifier declared inside it.
    pub identifier: String,
}

impl ExtensionBundle {
    pub fn korean() -> Self {
        Self {
            filename: "KIM_Extension.appex".into(),
            identifier: "com.apple.inputmethod.Korean".into(),
        }
    }

    pub fn tcim() -> Self {
        Self {
            filename: "TCIM_Extension.appex".into(),
            identifier: "com.apple.inputmethod.TCIM".into(),
        }
    }
}

/// Writes the capability-manifest descriptor: a faux extension bundle whose
/// manifest declares a known identifier and names `connection` as its
/// connection endpoint. The broker grants the token for that connection
/// name. Returns the bundle's location.
pub fn write_extension_manifest(
    scratch: &ScratchDir,
    bundle: &ExtensionBundle,
    connection: &ServiceId,
) -> Result<PathBuf, DescriptorError> {
    let bundle_path = scratch.stage(&bundle.filename)?;
    let contents = bundle_path.join("Contents");
    fs::create_dir_all(&contents)?;

    let manifest = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>CFBundleIdentifier</key>
	<string>{identifier}</string>
	<key>InputMethodConnectionName</key>
	<string>{connection}</string>
</dict>
</plist>
"#,
        identifier = bundle.identifier,
        connection = connection.as_str(),
    );
    fs::write(contents.join("Info.plist"), manifest)?;

    debug!(bundle = %bundle_path.display(), "wrote capability manifest");
    Ok(bundle_path)
}

/// Writes the asset-scene descriptor: a scene document whose single
/// embedded resource reference is `real_path` verbatim. No escaping beyond
/// what the format requires; a malformed path simply produces a
/// coordinator-side parse failure.
pub fn write_scene_document(
    scratch: &ScratchDir,
    real_path: &Path,
) -> Result<PathBuf, DescriptorError> {
    let scene_path = scratch.stage("faux.dae")?;
    let document = format!(
        r##"<?xml version="1.0"?>
<COLLADA xmlns="http://www.collada.org/2005/11/COLLADASchema" version="1.4.1">
    <library_images>
        <image id="technique" name="technique">
            <init_from>{path}</init_from>
        </image>
    </library_images>
    <scene>
        <instance_visual_scene url="#Scene"/>
    </scene>
</COLLADA>
"##,
        path = real_path.display(),
    );
    fs::write(&scene_path, document)?;

    debug!(scene = %scene_path.display(), "wrote scene descriptor");
    Ok(scene_path)
}
