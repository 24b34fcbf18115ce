//! Version information for pipemux.

use crate::bridge::protocol::PROTOCOL_VERSION;

/// Crate version from Cargo.toml, reported by the worker in `ready`.
pub const PIPEMUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versions of one end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub pipemux: String,
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            pipemux: PIPEMUX_VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    /// Versions of this build.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipemux(mut self, version: impl Into<String>) -> Self {
        self.pipemux = version.into();
        self
    }

    pub fn with_protocol(mut self, version: u32) -> Self {
        self.protocol = version;
        self
    }

    /// Whether the two ends can talk to each other.
    pub fn is_compatible_with(&self, other: &VersionInfo) -> bool {
        self.protocol == other.protocol
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipemux {} (protocol {})", self.pipemux, self.protocol)
    }
}
