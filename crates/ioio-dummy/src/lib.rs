//! ioio-dummy - Emulated IOIO board and PIC24 target for testing
//!
//! This crate provides a board transport whose ICSP channel talks to a PIC24
//! program memory held in RAM. It's useful for exercising the connection
//! lifecycle and the programmer without real hardware, and it can inject the
//! failures a real bench produces: the link dropping mid-run, a block that
//! does not program, an erase that times out, a board that never answers.

use ioio_core::chip::NO_TARGET_ID;
use ioio_core::error::{Error, Result};
use ioio_core::icsp::IcspChannel;
use ioio_core::image::{Block, BLOCK_DATA_SIZE};
use ioio_core::transport::{HardwareInfo, Transport};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Program address units covered by one image block
///
/// PIC24 addresses count 16-bit words; a 24-bit instruction takes two
/// address units and three bytes of image data.
pub const BLOCK_ADDRESS_SPAN: u32 = (BLOCK_DATA_SIZE as u32 / 3) * 2;

/// Configuration for the dummy board
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Hardware id reported in the handshake
    pub hardware_id: String,
    /// Bootloader id reported in the handshake
    pub bootloader_id: String,
    /// Firmware id reported in the handshake
    pub firmware_id: String,
    /// Whether the firmware accepts our interface version
    pub compatible: bool,
    /// Device id the attached target reports (`0xFFFF` for none)
    pub device_id: u16,
    /// Target program memory size in bytes
    pub flash_size: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            hardware_id: "SPRK0020".into(),
            bootloader_id: "IOIO0400".into(),
            firmware_id: "IOIO0500".into(),
            compatible: true,
            device_id: 0x4109, // PIC24FJ128DA106
            flash_size: 0x2_0000 / 2 * 3,
        }
    }
}

/// One operation seen by the emulated board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Handshake
    Establish,
    /// Soft reset
    SoftReset,
    /// Hard reset
    HardReset,
    /// Link closed
    Close,
    /// Target entered programming mode
    EnterProgramming,
    /// Target left programming mode
    ExitProgramming,
    /// Device id read
    ReadId,
    /// Chip erase
    Erase,
    /// Block written at the given address
    Write(u32),
    /// Block verified at the given address
    Verify(u32),
}

#[derive(Debug)]
struct TargetState {
    device_id: u16,
    flash: Vec<u8>,
    programming: bool,
    link_up: bool,
    ops: Vec<Op>,
    /// ICSP operations left before the link drops
    link_budget: Option<usize>,
    corrupt: HashSet<u32>,
    fail_erase: bool,
    refuse_connect: bool,
}

/// Shared view of the emulated target
///
/// Cloned handles see the same state, so a test can keep one while the
/// board it belongs to is owned by a `Board`.
#[derive(Debug, Clone)]
pub struct DummyTarget {
    state: Arc<Mutex<TargetState>>,
}

impl DummyTarget {
    fn new(device_id: u16, flash_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState {
                device_id,
                flash: vec![0xFF; flash_size],
                programming: false,
                link_up: false,
                ops: Vec::new(),
                link_budget: None,
                corrupt: HashSet::new(),
                fail_erase: false,
                refuse_connect: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a target with `device_id`, or detach with `0xFFFF`
    pub fn set_device_id(&self, device_id: u16) {
        self.lock().device_id = device_id;
    }

    /// Read program memory; `address` is a program address
    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        let start = byte_offset(address).min(state.flash.len());
        let end = (start + len).min(state.flash.len());
        state.flash[start..end].to_vec()
    }

    /// Whether the target is in programming mode
    pub fn in_programming(&self) -> bool {
        self.lock().programming
    }

    /// Whether the board link is up
    pub fn link_up(&self) -> bool {
        self.lock().link_up
    }

    /// Every operation seen so far, oldest first
    pub fn operations(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Drop the link after `n` more ICSP operations succeed
    pub fn fail_link_after(&self, n: usize) {
        self.lock().link_budget = Some(n);
    }

    /// Make the block at `address` read back wrong after programming
    pub fn corrupt_block(&self, address: u32) {
        self.lock().corrupt.insert(address);
    }

    /// Make every chip erase fail without dropping the link
    pub fn fail_erase(&self) {
        self.lock().fail_erase = true;
    }

    /// Make every handshake fail
    pub fn refuse_connect(&self) {
        self.lock().refuse_connect = true;
    }
}

fn byte_offset(address: u32) -> usize {
    address as usize / 2 * 3
}

impl TargetState {
    /// Account for one ICSP operation, dropping the link when the budget
    /// runs out
    fn icsp_op(&mut self, op: Op) -> Result<()> {
        if !self.link_up {
            return Err(Error::ConnectionLost);
        }
        match self.link_budget {
            Some(0) => {
                log::debug!("Dummy link dropped before {:?}", op);
                self.link_budget = None;
                self.link_up = false;
                self.programming = false;
                return Err(Error::ConnectionLost);
            }
            Some(n) => self.link_budget = Some(n - 1),
            None => {}
        }
        self.ops.push(op);
        Ok(())
    }

    fn require_programming(&self) -> Result<()> {
        if self.programming {
            Ok(())
        } else {
            Err(Error::Icsp("target not in programming mode".into()))
        }
    }

    fn region(&self, block: &Block<'_>) -> Result<core::ops::Range<usize>> {
        let start = byte_offset(block.address);
        let end = start + block.data.len();
        if end > self.flash.len() {
            return Err(Error::Icsp(format!(
                "block at 0x{:06X} outside program memory",
                block.address
            )));
        }
        Ok(start..end)
    }
}

/// Emulated IOIO board
pub struct DummyBoard {
    config: DummyConfig,
    target: DummyTarget,
}

impl DummyBoard {
    /// Create a board with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let target = DummyTarget::new(config.device_id, config.flash_size);
        Self { config, target }
    }

    /// Create a board with default configuration (IOIO-OTG, PIC24FJ128DA106)
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Shared handle to the emulated target
    pub fn target(&self) -> DummyTarget {
        self.target.clone()
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }
}

impl Transport for DummyBoard {
    fn establish(&mut self) -> Result<HardwareInfo> {
        let mut state = self.target.lock();
        if state.refuse_connect {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "dummy board refused the connection",
            )));
        }
        state.ops.push(Op::Establish);
        state.link_up = true;
        state.programming = false;
        Ok(HardwareInfo {
            hardware_id: self.config.hardware_id.clone(),
            bootloader_id: self.config.bootloader_id.clone(),
            firmware_id: self.config.firmware_id.clone(),
        })
    }

    fn check_interface(&mut self, interface_id: &str) -> Result<bool> {
        log::debug!("Dummy interface check for {}", interface_id);
        Ok(self.config.compatible)
    }

    fn soft_reset(&mut self) -> Result<()> {
        let mut state = self.target.lock();
        if !state.link_up {
            return Err(Error::ConnectionLost);
        }
        state.ops.push(Op::SoftReset);
        state.programming = false;
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<()> {
        let mut state = self.target.lock();
        if !state.link_up {
            return Err(Error::ConnectionLost);
        }
        state.ops.push(Op::HardReset);
        state.link_up = false;
        state.programming = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.target.lock();
        state.ops.push(Op::Close);
        state.link_up = false;
        state.programming = false;
    }

    fn icsp_channel(&mut self) -> Result<Box<dyn IcspChannel>> {
        Ok(Box::new(DummyIcsp {
            target: self.target.clone(),
        }))
    }
}

/// ICSP channel to the emulated target
struct DummyIcsp {
    target: DummyTarget,
}

impl IcspChannel for DummyIcsp {
    fn enter_programming(&mut self) -> Result<()> {
        let mut state = self.target.lock();
        state.icsp_op(Op::EnterProgramming)?;
        state.programming = true;
        Ok(())
    }

    fn exit_programming(&mut self) -> Result<()> {
        let mut state = self.target.lock();
        state.icsp_op(Op::ExitProgramming)?;
        state.programming = false;
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<u16> {
        let mut state = self.target.lock();
        state.icsp_op(Op::ReadId)?;
        if !state.programming {
            // Nothing answers outside programming mode
            return Ok(NO_TARGET_ID);
        }
        Ok(state.device_id)
    }

    fn erase_chip(&mut self) -> Result<()> {
        let mut state = self.target.lock();
        state.icsp_op(Op::Erase)?;
        state.require_programming()?;
        if state.fail_erase {
            return Err(Error::Icsp("erase did not complete".into()));
        }
        state.flash.fill(0xFF);
        Ok(())
    }

    fn write_block(&mut self, block: &Block<'_>) -> Result<()> {
        let mut state = self.target.lock();
        state.icsp_op(Op::Write(block.address))?;
        state.require_programming()?;
        let range = state.region(block)?;
        let corrupt = state.corrupt.contains(&block.address);
        let cells = &mut state.flash[range];
        for (cell, byte) in cells.iter_mut().zip(block.data) {
            *cell &= *byte;
        }
        if corrupt && !cells.is_empty() {
            cells[0] = !block.data[0];
        }
        Ok(())
    }

    fn verify_block(&mut self, block: &Block<'_>) -> Result<bool> {
        let mut state = self.target.lock();
        state.icsp_op(Op::Verify(block.address))?;
        state.require_programming()?;
        let range = state.region(block)?;
        Ok(state.flash[range] == *block.data)
    }
}
