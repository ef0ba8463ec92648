//! Error types for the Storage Pool Agent
//!
//! Provides structured error types for pool provisioning, covering
//! configuration, host device management, external tooling and the
//! SPDK JSON-RPC storage engine.

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error code SPDK returns for a missing bdev or lvstore (`-ENODEV`)
pub const SPDK_ENODEV: i64 = -19;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Not-Found Sentinels
    // =========================================================================
    #[error("Volume group not found: {name}")]
    VgNotFound { name: String },

    #[error("No such device: {name}")]
    NoSuchDevice { name: String },

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Device error on {path}: {reason}")]
    Device { path: String, reason: String },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("External tool {tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    // =========================================================================
    // Storage Engine RPC Errors
    // =========================================================================
    #[error("RPC {method} failed: code {code}, {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("RPC {method} returned false for {target}")]
    RpcRejected { method: String, target: String },

    #[error("RPC transport error: {0}")]
    RpcTransport(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller should take when a provisioning attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Run the whole provisioning again on the next cycle
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for a configuration change
    NoRequeue,
}

impl Error {
    /// Build a `Device` error
    pub fn device(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Device {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build an `ExternalTool` error
    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Configuration(_) | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // Drivers may still be settling after a rebind
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if re-running provisioning may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// True for the "volume group not found" sentinel
    pub fn is_not_found_vg(&self) -> bool {
        matches!(self, Error::VgNotFound { .. })
    }

    /// True for the storage engine's "no such device" sentinel
    pub fn is_not_found_device(&self) -> bool {
        matches!(self, Error::NoSuchDevice { .. })
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
