//! Progress reporting for programming runs
//!
//! Listener methods are called with the programmer's session lock held, in
//! the same critical section as the state change they report. They must not
//! call back into the `Programmer`.

use crate::chip::Chip;
use crate::programmer::{ProgrammerState, RunOutcome};

/// Receives state changes and per-block progress
pub trait ProgressListener: Send {
    /// The machine entered `state`; `target` is the detected chip, if any
    fn state_changed(&mut self, _state: ProgrammerState, _target: Option<Chip>) {}

    /// One more block finished in the current pass
    fn block_done(&mut self, _pass: ProgrammerState, _done: usize, _total: usize) {}

    /// A run ended
    fn run_finished(&mut self, _outcome: &RunOutcome) {}
}

/// Listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressListener for NoProgress {}
