//! Error types for address reconciliation.

use std::io;

use crate::address::AddressFamily;

/// Result type for address operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling link addresses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from a collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format, or a message the engine has no contract for.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// The per-link or per-network address limit was reached.
    #[error("too many addresses (limit {limit})")]
    TooManyAddresses {
        /// The configured limit.
        limit: usize,
    },

    /// No free subnet is left in the address pools.
    #[error("address pool exhausted for {family}/{prefixlen}")]
    PoolExhausted {
        /// Requested family.
        family: AddressFamily,
        /// Requested prefix length.
        prefixlen: u8,
    },

    /// Link is not known to the manager.
    #[error("link not found: ifindex {ifindex}")]
    LinkNotFound {
        /// Interface index.
        ifindex: u32,
    },

    /// Address is not known on the link.
    #[error("no such address: {address}")]
    NoSuchAddress {
        /// Address in `addr/prefixlen` form.
        address: String,
    },

    /// A configuration value was rejected.
    #[error("invalid {key}=: {reason}")]
    InvalidConfig {
        /// Configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Request could not be handed to the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Firewall rule could not be changed.
    #[error("firewall error: {0}")]
    Firewall(String),
}

impl Error {
    /// Create a kernel error from an errno value as found in a netlink error
    /// payload (negative).
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a kernel error with operation context.
    pub fn from_errno_with_context(errno: i32, operation: impl Into<String>) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::KernelWithContext {
            operation: operation.into(),
            errno: -errno,
            message,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, etc.).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, libc::ENOENT | libc::ENODEV)
            }
            Self::LinkNotFound { .. } | Self::NoSuchAddress { .. } => true,
            _ => false,
        }
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// Check if the kernel no longer has the address (EADDRNOTAVAIL).
    pub fn is_address_not_available(&self) -> bool {
        self.errno() == Some(libc::EADDRNOTAVAIL)
    }

    /// Check if this is a "device busy" error (EBUSY) or an exhausted pool.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            _ => self.errno() == Some(libc::EBUSY),
        }
    }

    /// Check if a resource limit was hit (E2BIG class).
    pub fn is_too_big(&self) -> bool {
        match self {
            Self::TooManyAddresses { .. } => true,
            _ => self.errno() == Some(libc::E2BIG),
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
