//! ioio-core - Core library for IOIO boards and ICSP firmware programming
//!
//! This crate provides two things:
//!
//! - A resource API for claiming exclusive peripherals (pins, PWM, UART,
//!   SPI, TWI, ICSP) on a connected IOIO board, with every handle tied to
//!   the lifetime of the connection it was opened on.
//! - A programming state machine that drives the ICSP channel to detect,
//!   erase, program and verify a PIC24 target block by block.
//!
//! The byte transport, the bit-level ICSP master and the image cursor are
//! consumed through traits (`Transport`, `IcspChannel`, `ImageSource`).
//!
//! # Example
//!
//! ```ignore
//! use ioio_core::connection::Board;
//! use ioio_core::programmer::{Driver, Programmer, ProgrammerConfig};
//!
//! let board = Board::new(transport);
//! let programmer = Programmer::new(ProgrammerConfig::default());
//! programmer.request_erase();
//! Driver::new(board.clone(), programmer.clone()).run();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod chip;
pub mod connection;
pub mod error;
pub mod icsp;
pub mod image;
pub mod progress;
pub mod programmer;
pub mod resource;
pub mod transport;

pub use error::{Error, Result};
