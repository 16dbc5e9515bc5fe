//! The token consumption primitive: a local, privileged, non-linkable
//! authorization interface that both issues and consumes extension tokens.
//!
//! The interface cannot be linked against directly, so its three entry
//! points are resolved by name at startup. Resolution failure is fatal to
//! the whole pipeline and is reported once, before any channel activity.

use std::ffi::{CStr, CString, NulError, c_char, c_int};
use std::path::Path;

use libloading::Library;
use thiserror::Error;
use tracing::warn;

use crate::token::{CapabilityToken, LocalExtensionToken};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to resolve authorization interface: {0}")]
    Resolve(String),
    #[error("authorization call returned status {0}")]
    ConsumptionFailed(i32),
    #[error("authorization interface reported success but returned no token")]
    NoTokenReturned,
    #[error("path contains an interior nul byte")]
    BadPath(#[from] NulError),
}

/// The three operations higher layers use. Redemption is idempotent in its
/// error reporting: any non-zero status yields `ConsumptionFailed`,
/// whichever operation was invoked.
pub trait SandboxAuthority: Send + Sync {
    /// Issues a read extension for one of our own on-disk descriptors, so a
    /// coordinator running under a different identity can read it.
    fn issue_for_path(&self, path: &Path) -> Result<LocalExtensionToken, SandboxError>;

    /// Redeems a mach capability token, unlocking process-to-process
    /// connectivity to the named service.
    fn consume_mach_token(&self, token: &CapabilityToken) -> Result<(), SandboxError>;

    /// Redeems a filesystem capability token, unlocking visibility of the
    /// granted path.
    fn consume_fs_token(&self, token: &CapabilityToken) -> Result<(), SandboxError>;
}

// int sandbox_consume_mach_extension(const char *ext_token, const char **name)
// int sandbox_consume_fs_extension(const char *ext_token, char **path)
type ConsumeFn = unsafe extern "C" fn(*const c_char, *mut *mut c_char) -> c_int;
// int sandbox_issue_fs_extension(const char *path, uint64_t flags, const char **ext_token)
type IssueFn = unsafe extern "C" fn(*const c_char, u64, *mut *mut c_char) -> c_int;

// 0x1 selects path-based issuance, 0x4 grants read.
const ISSUE_FLAGS: u64 = 0x5;

/// Authority backed by the real authorization module, resolved with
/// dlopen/dlsym semantics.
pub struct DylibAuthority {
    consume_mach: ConsumeFn,
    issue_fs: IssueFn,
    consume_fs: ConsumeFn,
    // Keeps the resolved symbols valid.
    _module: Library,
}

impl DylibAuthority {
    pub fn resolve(module_path: &Path) -> Result<Self, SandboxError> {
        let resolve_err = |err: libloading::Error| SandboxError::Resolve(err.to_string());
        // SAFETY: loading the fixed authorization module runs no untrusted
        // initialization; the symbol signatures below match its C ABI.
        unsafe {
            let module = Library::new(module_path).map_err(resolve_err)?;
            let consume_mach = *module
                .get::<ConsumeFn>(b"sandbox_consume_mach_extension\0")
                .map_err(resolve_err)?;
            let issue_fs = *module
                .get::<IssueFn>(b"sandbox_issue_fs_extension\0")
                .map_err(resolve_err)?;
            let consume_fs = *module
                .get::<ConsumeFn>(b"sandbox_consume_fs_extension\0")
                .map_err(resolve_err)?;
            Ok(Self {
                consume_mach,
                issue_fs,
                consume_fs,
                _module: module,
            })
        }
    }
}

fn check(status: c_int) -> Result<(), SandboxError> {
    if status == 0 {
        Ok(())
    } else {
        Err(SandboxError::ConsumptionFailed(status))
    }
}

impl SandboxAuthority for DylibAuthority {
    fn issue_for_path(&self, path: &Path) -> Result<LocalExtensionToken, SandboxError> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
        let mut issued: *mut c_char = std::ptr::null_mut();
        // SAFETY: c_path outlives the call; issued is written only on
        // success and read back below.
        let status = unsafe { (self.issue_fs)(c_path.as_ptr(), ISSUE_FLAGS, &mut issued) };
        check(status)?;

        if issued.is_null() {
            warn!("issue_for_path returned status 0 with a null token");
            return Err(SandboxError::NoTokenReturned);
        }
        // SAFETY: non-null, nul-terminated string owned by the module.
        let token = unsafe { CStr::from_ptr(issued) }
            .to_string_lossy()
            .into_owned();
        if token.is_empty() {
            warn!("issue_for_path returned status 0 with an empty token");
            return Err(SandboxError::NoTokenReturned);
        }
        Ok(LocalExtensionToken::new(token))
    }

    fn consume_mach_token(&self, token: &CapabilityToken) -> Result<(), SandboxError> {
        let c_token = CString::new(token.as_str())?;
        // The out parameter is unused by the interface in practice.
        let status = unsafe { (self.consume_mach)(c_token.as_ptr(), std::ptr::null_mut()) };
        check(status)
    }

    fn consume_fs_token(&self, token: &CapabilityToken) -> Result<(), SandboxError> {
        let c_token = CString::new(token.as_str())?;
        let status = unsafe { (self.consume_fs)(c_token.as_ptr(), std::ptr::null_mut()) };
        check(status)
    }
}
