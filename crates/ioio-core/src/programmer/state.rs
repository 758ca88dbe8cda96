//! Programmer states and run outcomes

use core::fmt;

/// State of the programming state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgrammerState {
    /// No board connection (initial)
    IoioDisconnected,
    /// Board connected, no target answering
    IoioConnected,
    /// A known target chip is attached
    TargetConnected,
    /// Something answered with an unrecognized device id
    UnknownTargetConnected,
    /// Board firmware speaks an unsupported interface version
    IoioIncompatible,
    /// Erase requested, about to start
    EraseStart,
    /// Chip erase running
    EraseInProgress,
    /// Program run requested, about to start
    ProgramStart,
    /// Writing blocks
    ProgramInProgress,
    /// Reading blocks back
    VerifyInProgress,
}

impl ProgrammerState {
    /// Whether an erase or program run owns the machine
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::EraseStart
                | Self::EraseInProgress
                | Self::ProgramStart
                | Self::ProgramInProgress
                | Self::VerifyInProgress
        )
    }

    /// Whether the machine is idle on a live board and probing for a target
    pub fn is_detecting(self) -> bool {
        matches!(
            self,
            Self::IoioConnected | Self::TargetConnected | Self::UnknownTargetConnected
        )
    }

    /// Whether `next` may follow `self`
    ///
    /// Stages only move forward one step at a time. Any state may drop back
    /// to disconnected or incompatible, and runs end in `TargetConnected`.
    pub fn can_transition_to(self, next: ProgrammerState) -> bool {
        use ProgrammerState::*;
        match (self, next) {
            (_, IoioDisconnected) | (_, IoioIncompatible) => true,
            (IoioDisconnected | IoioIncompatible, IoioConnected) => true,
            (from, to) if from.is_detecting() && to.is_detecting() => true,
            (TargetConnected, EraseStart | ProgramStart) => true,
            (EraseStart | ProgramStart, EraseInProgress) => true,
            (EraseInProgress, ProgramInProgress | TargetConnected) => true,
            (ProgramInProgress, VerifyInProgress | TargetConnected) => true,
            (VerifyInProgress, TargetConnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProgrammerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IoioDisconnected => "IOIO disconnected",
            Self::IoioConnected => "IOIO connected",
            Self::TargetConnected => "target connected",
            Self::UnknownTargetConnected => "unknown target connected",
            Self::IoioIncompatible => "IOIO incompatible",
            Self::EraseStart => "erase pending",
            Self::EraseInProgress => "erasing",
            Self::ProgramStart => "program pending",
            Self::ProgramInProgress => "programming",
            Self::VerifyInProgress => "verifying",
        };
        f.write_str(text)
    }
}

/// How a run ended
///
/// Connection loss is not an outcome; it propagates as
/// `Error::ConnectionLost` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step completed
    Success,
    /// Operator cancelled; `completed` blocks were done in the current pass
    Aborted {
        /// Blocks completed when the cancel was seen
        completed: usize,
    },
    /// A block did not read back as written; later blocks were not checked
    VerificationFailed {
        /// 1-based position of the failing block
        block: usize,
        /// Start address of the failing block
        address: u32,
    },
    /// The image could not be read
    ImageCorrupt,
    /// Unclassified failure
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Aborted { completed } => write!(f, "aborted after {} blocks", completed),
            Self::VerificationFailed { block, address } => write!(
                f,
                "verification failed at block {} (0x{:06X})",
                block, address
            ),
            Self::ImageCorrupt => write!(f, "image corrupt"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProgrammerState::*;
    use super::*;

    const ALL: [ProgrammerState; 10] = [
        IoioDisconnected,
        IoioConnected,
        TargetConnected,
        UnknownTargetConnected,
        IoioIncompatible,
        EraseStart,
        EraseInProgress,
        ProgramStart,
        ProgramInProgress,
        VerifyInProgress,
    ];

    #[test]
    fn test_any_state_may_fall_back() {
        for state in ALL {
            assert!(state.can_transition_to(IoioDisconnected));
            assert!(state.can_transition_to(IoioIncompatible));
        }
    }

    #[test]
    fn test_no_forward_skips() {
        assert!(!IoioDisconnected.can_transition_to(TargetConnected));
        assert!(!IoioConnected.can_transition_to(ProgramStart));
        assert!(!UnknownTargetConnected.can_transition_to(EraseStart));
        assert!(!ProgramStart.can_transition_to(ProgramInProgress));
        assert!(!EraseInProgress.can_transition_to(VerifyInProgress));
        assert!(!VerifyInProgress.can_transition_to(ProgramInProgress));
    }

    #[test]
    fn test_run_sequence() {
        let run = [
            TargetConnected,
            ProgramStart,
            EraseInProgress,
            ProgramInProgress,
            VerifyInProgress,
            TargetConnected,
        ];
        for pair in run.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(TargetConnected.can_transition_to(EraseStart));
        assert!(EraseStart.can_transition_to(EraseInProgress));
        assert!(EraseInProgress.can_transition_to(TargetConnected));
    }

    #[test]
    fn test_running_and_detecting_are_disjoint() {
        for state in ALL {
            assert!(!(state.is_running() && state.is_detecting()));
        }
    }
}
