//! Error types for vplsd.
//!
//! Only configuration failures are fatal. Topology, decode and control-plane
//! errors are scoped to the tunnel, frame or RPC that produced them and are
//! logged by the caller.

use std::io;
use thiserror::Error;

/// Result type alias for vplsd operations.
pub type Result<T> = std::result::Result<T, VplsError>;

/// Errors produced while decoding control frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer shorter than the fixed header layout.
    #[error("truncated {header} header: need {needed} bytes, got {actual}")]
    Truncated {
        /// Header being decoded.
        header: &'static str,
        /// Required length in bytes.
        needed: usize,
        /// Length actually available.
        actual: usize,
    },
}

impl DecodeError {
    pub fn truncated(header: &'static str, needed: usize, actual: usize) -> Self {
        Self::Truncated {
            header,
            needed,
            actual,
        }
    }
}

/// Errors that can occur in the VPLS controller.
#[derive(Debug, Error)]
pub enum VplsError {
    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Topology query could not be answered (unknown node, missing adjacency).
    #[error("Topology error: {0}")]
    Topology(String),

    /// A forwarding-control call failed on a switch.
    #[error("Control plane call '{operation}' failed on {switch}: {message}")]
    ControlPlane {
        /// Switch the call was issued to.
        switch: String,
        /// Operation name (e.g. "table_add").
        operation: String,
        /// Error message reported by the switch or transport.
        message: String,
    },

    /// Control frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Raw frame capture failed.
    #[error("Capture error on {interface}: {message}")]
    Capture {
        /// Capture interface name.
        interface: String,
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl VplsError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a topology error.
    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology(message.into())
    }

    /// Creates a control-plane error.
    pub fn control_plane(
        switch: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ControlPlane {
            switch: switch.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a capture error.
    pub fn capture(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capture {
            interface: interface.into(),
            message: message.into(),
        }
    }
}
