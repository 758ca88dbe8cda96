//! ICSP channel abstraction
//!
//! `IcspChannel` is what a board backend provides: blocking primitives that
//! talk to the target chip. `IcspMaster` is what client code holds: the
//! channel bound to a claimed peripheral handle, so every call fails fast
//! once the connection it was opened on is gone.

use crate::connection::{Board, PeripheralHandle};
use crate::error::{Error, Result};
use crate::image::Block;

/// Low-level programming primitives for a PIC24 target
///
/// Every method blocks until the board answers. Any of them may fail with
/// `Error::ConnectionLost`.
pub trait IcspChannel: Send {
    /// Put the target into programming mode
    fn enter_programming(&mut self) -> Result<()>;

    /// Release the target from programming mode
    fn exit_programming(&mut self) -> Result<()>;

    /// Read the target device id (0xFFFF when nothing answers)
    fn read_device_id(&mut self) -> Result<u16>;

    /// Bulk-erase the target's program memory
    fn erase_chip(&mut self) -> Result<()>;

    /// Program one block
    fn write_block(&mut self, block: &Block<'_>) -> Result<()>;

    /// Read one block back and compare; `Ok(false)` on mismatch
    fn verify_block(&mut self, block: &Block<'_>) -> Result<bool>;
}

impl<C: IcspChannel + ?Sized> IcspChannel for Box<C> {
    fn enter_programming(&mut self) -> Result<()> {
        (**self).enter_programming()
    }

    fn exit_programming(&mut self) -> Result<()> {
        (**self).exit_programming()
    }

    fn read_device_id(&mut self) -> Result<u16> {
        (**self).read_device_id()
    }

    fn erase_chip(&mut self) -> Result<()> {
        (**self).erase_chip()
    }

    fn write_block(&mut self, block: &Block<'_>) -> Result<()> {
        (**self).write_block(block)
    }

    fn verify_block(&mut self, block: &Block<'_>) -> Result<bool> {
        (**self).verify_block(block)
    }
}

/// ICSP master opened on a board
///
/// Holds the claim on the ICSP pins for as long as it lives.
pub struct IcspMaster {
    handle: PeripheralHandle,
    channel: Box<dyn IcspChannel>,
    board: Board,
}

impl IcspMaster {
    pub(crate) fn new(handle: PeripheralHandle, channel: Box<dyn IcspChannel>, board: Board) -> Self {
        Self {
            handle,
            channel,
            board,
        }
    }

    /// The underlying peripheral handle
    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Release the ICSP pins
    pub fn close(&mut self) {
        self.handle.close();
    }

    fn call<T>(&mut self, op: impl FnOnce(&mut dyn IcspChannel) -> Result<T>) -> Result<T> {
        self.handle.check()?;
        op(self.channel.as_mut()).map_err(|e| {
            if e.is_connection_lost() {
                self.board.link_lost();
            }
            e
        })
    }
}

impl IcspChannel for IcspMaster {
    fn enter_programming(&mut self) -> Result<()> {
        self.call(|c| c.enter_programming())
    }

    fn exit_programming(&mut self) -> Result<()> {
        self.call(|c| c.exit_programming())
    }

    fn read_device_id(&mut self) -> Result<u16> {
        self.call(|c| c.read_device_id())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.call(|c| c.erase_chip())
    }

    fn write_block(&mut self, block: &Block<'_>) -> Result<()> {
        self.call(|c| c.write_block(block))
    }

    fn verify_block(&mut self, block: &Block<'_>) -> Result<bool> {
        self.call(|c| c.verify_block(block))
    }
}

/// Scoped programming mode
///
/// Entering returns a guard; dropping the guard exits programming mode on
/// every path, including early returns and errors. Exit failures are logged
/// and otherwise ignored.
pub struct ProgrammingMode<'a> {
    channel: &'a mut dyn IcspChannel,
}

impl<'a> ProgrammingMode<'a> {
    /// Enter programming mode on `channel`
    pub fn enter(channel: &'a mut dyn IcspChannel) -> Result<Self> {
        channel.enter_programming()?;
        Ok(Self { channel })
    }

    /// The channel, for issuing commands while in programming mode
    pub fn channel(&mut self) -> &mut dyn IcspChannel {
        &mut *self.channel
    }
}

impl Drop for ProgrammingMode<'_> {
    fn drop(&mut self) {
        match self.channel.exit_programming() {
            Ok(()) => {}
            // Nothing left to release on a dead link
            Err(Error::ConnectionLost) => {}
            Err(e) => log::warn!("Failed to exit programming mode: {}", e),
        }
    }
}
