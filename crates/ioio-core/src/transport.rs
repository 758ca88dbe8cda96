//! Board transport abstraction
//!
//! A transport owns the physical link to one board and frames the IOIO
//! protocol over it. The connection lifecycle drives it; client code never
//! calls it directly.

use crate::error::Result;
use crate::icsp::IcspChannel;

/// Interface version this library speaks
pub const INTERFACE_ID: &str = "IOIO0005";

/// Identification sent by the board when a connection is established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Hardware revision, e.g. "SPRK0020"
    pub hardware_id: String,
    /// Bootloader version
    pub bootloader_id: String,
    /// Application firmware version
    pub firmware_id: String,
}

/// Link to a board
pub trait Transport: Send {
    /// Open the link and wait for the board's handshake
    fn establish(&mut self) -> Result<HardwareInfo>;

    /// Ask the board whether it supports `interface_id`
    fn check_interface(&mut self, interface_id: &str) -> Result<bool>;

    /// Return the board to its initial state without dropping the link
    fn soft_reset(&mut self) -> Result<()>;

    /// Reboot the board; the link is gone afterwards
    fn hard_reset(&mut self) -> Result<()>;

    /// Close the link
    fn close(&mut self);

    /// Create the ICSP channel for the current link
    fn icsp_channel(&mut self) -> Result<Box<dyn IcspChannel>>;
}
