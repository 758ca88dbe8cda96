//! Error types for ioio-core
//!
//! One error type is shared by the resource allocator, the connection
//! lifecycle, the ICSP wrapper and the programmer so that `ConnectionLost`
//! can travel unchanged from the lowest layer to the driver loop.

use crate::resource::Capability;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// The link to the board dropped, or the handle belongs to a connection
    /// that no longer exists
    #[error("Connection lost")]
    ConnectionLost,

    /// The (pin, capability) pair is already held by a valid handle
    #[error("Pin {pin} is busy (requested as {capability})")]
    ResourceBusy {
        /// First pin found claimed
        pin: u8,
        /// Capability that was requested
        capability: Capability,
    },

    /// The request cannot be routed on this hardware
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// All instances of a bounded peripheral module are in use
    #[error("Out of {0} resources")]
    OutOfResource(Capability),

    /// The board runs firmware speaking an unsupported interface version
    #[error("Incompatible board firmware: {0}")]
    Incompatible(String),

    /// The firmware image is corrupt or unreadable
    #[error("Image format error: {0}")]
    Format(String),

    /// A programmed block did not read back as written
    #[error("Verification mismatch at address 0x{address:06X}")]
    VerifyMismatch {
        /// Start address of the failing block
        address: u32,
    },

    /// Unclassified ICSP failure reported by the target
    #[error("ICSP error: {0}")]
    Icsp(String),

    /// File access error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the link is gone
    ///
    /// Connection loss is never handled locally; callers use this to decide
    /// whether to propagate instead of falling back.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost)
    }
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
