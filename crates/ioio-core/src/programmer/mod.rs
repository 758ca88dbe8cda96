//! ICSP firmware programmer
//!
//! [`Programmer`] is the state machine: it detects the target, and runs
//! erase or erase-program-verify sequences on request. [`Driver`] ties it to
//! a [`Board`](crate::connection::Board), reconnecting and ticking until the
//! programmer asks to quit.

mod driver;
mod machine;
mod state;

pub use driver::Driver;
pub use machine::{ImageLoader, Programmer, ProgrammerConfig};
pub use state::{ProgrammerState, RunOutcome};
