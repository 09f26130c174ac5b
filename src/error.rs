//! Failure values shared by every fallible operation in the plugin.
//!
//! Each variant carries a short message and a detail string embedding the
//! offending value, and maps onto the CNI error response on the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds surfaced by the plugin
#[derive(Debug, Error)]
pub enum CniError {
    /// Text that is not `a.b.c.d/len`
    #[error("Invalid CIDR: {reason}")]
    InvalidCidr { text: String, reason: String },

    /// File read/write or device open failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Negative acknowledgement from rtnetlink or nf_tables
    #[error("{context}: {reason}")]
    KernelRejected { context: String, reason: String },

    /// setns() into or out of a container namespace failed
    #[error("{context}: {source}")]
    NamespaceSwitchFailed {
        context: String,
        target: String,
        #[source]
        source: nix::Error,
    },

    #[error("Unknown CNI command: {0}")]
    UnknownCommand(String),

    /// Network configuration on stdin was rejected
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),

    /// A required CNI_* environment variable was not set
    #[error("{0} not found in environment")]
    MissingEnvironment(String),
}

pub type Result<T> = std::result::Result<T, CniError>;

impl CniError {
    pub fn invalid_cidr(text: impl Into<String>, reason: impl Into<String>) -> Self {
        CniError::InvalidCidr {
            text: text.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, target: impl Into<String>, source: std::io::Error) -> Self {
        CniError::Io {
            context: context.into(),
            target: target.into(),
            source,
        }
    }

    pub fn kernel(context: impl Into<String>, reason: impl ToString) -> Self {
        CniError::KernelRejected {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn namespace(context: impl Into<String>, target: impl Into<String>, source: nix::Error) -> Self {
        CniError::NamespaceSwitchFailed {
            context: context.into(),
            target: target.into(),
            source,
        }
    }

    /// Numeric code reported in the CNI error response
    pub fn code(&self) -> u32 {
        match self {
            CniError::MissingEnvironment(_) => 4,
            CniError::Io { .. } => 5,
            CniError::InvalidCidr { .. } | CniError::InvalidConfig(_) => 7,
            CniError::KernelRejected { .. } => 100,
            CniError::NamespaceSwitchFailed { .. } => 101,
            CniError::UnknownCommand(_) => 102,
        }
    }

    /// Short, value-free description of the failure
    pub fn message(&self) -> String {
        match self {
            CniError::InvalidCidr { .. } => "Invalid CIDR".to_string(),
            CniError::Io { context, .. } => context.clone(),
            CniError::KernelRejected { context, .. } => context.clone(),
            CniError::NamespaceSwitchFailed { context, .. } => context.clone(),
            CniError::UnknownCommand(_) => "Unknown CNI command".to_string(),
            CniError::InvalidConfig(_) => "Invalid network configuration".to_string(),
            CniError::MissingEnvironment(_) => "Missing CNI environment variable".to_string(),
        }
    }

    /// Formatted detail embedding the offending value and system reason
    pub fn details(&self) -> String {
        match self {
            CniError::InvalidCidr { text, reason } => format!("'{}': {}", text, reason),
            CniError::Io { target, source, .. } => format!("{}: {}", target, source),
            CniError::KernelRejected { reason, .. } => reason.clone(),
            CniError::NamespaceSwitchFailed { target, source, .. } => {
                format!("{}: {}", target, source.desc())
            }
            CniError::UnknownCommand(cmd) => cmd.clone(),
            CniError::InvalidConfig(reason) => reason.clone(),
            CniError::MissingEnvironment(var) => var.clone(),
        }
    }

    /// Whether the kernel reported the target device as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            CniError::KernelRejected { reason, .. } => {
                reason.contains("No such device") || reason.contains("not found")
            }
            _ => false,
        }
    }

    /// Render into the CNI error response contract
    pub fn to_response(&self, cni_version: &str) -> ErrorResponse {
        ErrorResponse {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.message(),
            details: self.details(),
        }
    }
}

/// CNI error result, printed on stdout when a command fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    pub details: String,
}
