//! Opaque token types passed between brokers and the local authorization
//! primitive.

use std::fmt;

/// A capability token granted by a remote coordinator. Single-use: it must
/// be redeemed through the consumption primitive exactly once, and is held
/// only for the duration of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are secrets; keep log output to a prefix.
        let shown = self.0.chars().take(8).collect::<String>();
        write!(f, "{shown}...")
    }
}

/// An extension token issued by this process itself, granting a downstream
/// coordinator temporary read access to one of our on-disk descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExtensionToken(String);

impl LocalExtensionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_token_material() {
        let token = CapabilityToken::new("tok-secret-material-beyond-prefix");
        let shown = token.to_string();
        assert!(shown.starts_with("tok-secr"));
        assert!(!shown.contains("beyond"));
    }
}
