//! The programming state machine
//!
//! All shared data lives in one `Session` behind one mutex. The lock is held
//! for every state change and the report that goes with it, and released
//! around each blocking ICSP call so that `cancel()` and the observer
//! callbacks can get in between blocks.

use super::state::{ProgrammerState, RunOutcome};
use crate::chip::{Chip, Detection};
use crate::error::{Error, Result};
use crate::icsp::{IcspChannel, ProgrammingMode};
use crate::image::{ImageSource, IoioFile};
use crate::progress::{NoProgress, ProgressListener};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Programmer configuration
#[derive(Debug, Clone)]
pub struct ProgrammerConfig {
    /// Delay between driver ticks
    pub tick_period: Duration,
    /// Raise the quit flag once an erase or program run ends
    pub quit_after_run: bool,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
            quit_after_run: true,
        }
    }
}

/// Deferred image construction
///
/// The image is only opened once the chip has been erased, so a corrupt
/// file is detected at that point of the run.
pub struct ImageLoader(Box<dyn FnOnce() -> Result<Box<dyn ImageSource>> + Send>);

impl ImageLoader {
    /// Wrap a constructor
    pub fn new<F>(load: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn ImageSource>> + Send + 'static,
    {
        Self(Box::new(load))
    }

    /// Load an `.ioio` file from `path`
    pub fn from_path(path: PathBuf) -> Self {
        Self::new(move || {
            log::info!("Using file {}", path.display());
            Ok(Box::new(IoioFile::open(&path)?) as Box<dyn ImageSource>)
        })
    }

    /// Use an already constructed image
    pub fn from_image(image: impl ImageSource + 'static) -> Self {
        Self::new(move || Ok(Box::new(image) as Box<dyn ImageSource>))
    }

    fn load(self) -> Result<Box<dyn ImageSource>> {
        (self.0)()
    }
}

impl core::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ImageLoader")
    }
}

/// A pending operator request
#[derive(Debug)]
enum Request {
    Erase,
    Program(ImageLoader),
}

impl Request {
    fn start_state(&self) -> ProgrammerState {
        match self {
            Request::Erase => ProgrammerState::EraseStart,
            Request::Program(_) => ProgrammerState::ProgramStart,
        }
    }
}

struct Session {
    state: ProgrammerState,
    request: Option<Request>,
    target: Option<Chip>,
    total_blocks: usize,
    done_blocks: usize,
    cancel: bool,
    quit: bool,
    last_outcome: Option<RunOutcome>,
    listener: Box<dyn ProgressListener>,
}

impl Session {
    /// Move to `next` and report it; illegal edges are refused
    fn set_state(&mut self, next: ProgrammerState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!("Refusing transition from {} to {}", self.state, next);
            return false;
        }
        self.state = next;
        match next {
            ProgrammerState::IoioDisconnected => log::info!("IOIO disconnected"),
            ProgrammerState::IoioConnected => log::info!("IOIO connected"),
            ProgrammerState::IoioIncompatible => log::info!("IOIO incompatible"),
            ProgrammerState::TargetConnected => match self.target {
                Some(chip) => log::info!("Target {} connected", chip),
                None => log::info!("Target connected"),
            },
            ProgrammerState::UnknownTargetConnected => log::info!("Unknown target"),
            other => log::debug!("Programmer state: {}", other),
        }
        self.listener.state_changed(next, self.target);
        true
    }

    /// Leave a run, unless something already knocked us out of it
    fn fall_back(&mut self) {
        if self.state.is_running() {
            self.set_state(ProgrammerState::TargetConnected);
        }
    }
}

struct Inner {
    session: Mutex<Session>,
    quit_changed: Condvar,
    config: ProgrammerConfig,
}

/// Firmware programmer state machine
///
/// Cheap to clone; clones share one session. The driver thread calls
/// [`Programmer::tick`]; any other thread may request runs, cancel, or read
/// the state.
#[derive(Clone)]
pub struct Programmer {
    inner: Arc<Inner>,
}

impl Programmer {
    /// Create a programmer in `IoioDisconnected` with no listener
    pub fn new(config: ProgrammerConfig) -> Self {
        Self::with_listener(config, NoProgress)
    }

    /// Create a programmer reporting to `listener`
    pub fn with_listener(config: ProgrammerConfig, listener: impl ProgressListener + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    state: ProgrammerState::IoioDisconnected,
                    request: None,
                    target: None,
                    total_blocks: 0,
                    done_blocks: 0,
                    cancel: false,
                    quit: false,
                    last_outcome: None,
                    listener: Box::new(listener),
                }),
                quit_changed: Condvar::new(),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration this programmer was built with
    pub fn config(&self) -> &ProgrammerConfig {
        &self.inner.config
    }

    /// Current state
    pub fn state(&self) -> ProgrammerState {
        self.lock().state
    }

    /// Detected target chip
    pub fn target(&self) -> Option<Chip> {
        self.lock().target
    }

    /// Blocks completed in the current pass and total blocks in the image
    pub fn progress(&self) -> (usize, usize) {
        let session = self.lock();
        (session.done_blocks, session.total_blocks)
    }

    /// Outcome of the most recent run
    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.lock().last_outcome.clone()
    }

    /// Schedule a program run; it starts on the first tick that finds a
    /// known target
    pub fn request_program(&self, image: ImageLoader) {
        self.lock().request = Some(Request::Program(image));
    }

    /// Schedule a chip erase
    pub fn request_erase(&self) {
        self.lock().request = Some(Request::Erase);
    }

    /// Cancel the active run at the next block boundary and drop any
    /// pending request
    pub fn cancel(&self) {
        let mut session = self.lock();
        session.request = None;
        if session.state.is_running() {
            session.cancel = true;
        }
    }

    /// Ask the process loop to end, cancelling any run in progress
    pub fn quit(&self) {
        let mut session = self.lock();
        session.request = None;
        session.cancel = true;
        session.quit = true;
        self.inner.quit_changed.notify_all();
    }

    /// Whether the process loop should end
    pub fn should_quit(&self) -> bool {
        self.lock().quit
    }

    /// Wait up to `timeout` for the quit flag; returns its value
    pub fn wait_for_quit(&self, timeout: Duration) -> bool {
        let session = self.lock();
        let (session, _) = self
            .inner
            .quit_changed
            .wait_timeout_while(session, timeout, |s| !s.quit)
            .unwrap_or_else(PoisonError::into_inner);
        session.quit
    }

    /// The board connected
    pub fn connected(&self) {
        let mut session = self.lock();
        if matches!(
            session.state,
            ProgrammerState::IoioDisconnected | ProgrammerState::IoioIncompatible
        ) {
            session.set_state(ProgrammerState::IoioConnected);
        }
    }

    /// The board connection is gone
    pub fn disconnected(&self) {
        let mut session = self.lock();
        if session.state != ProgrammerState::IoioDisconnected {
            session.target = None;
            session.set_state(ProgrammerState::IoioDisconnected);
        }
    }

    /// The board speaks an unsupported interface version
    pub fn incompatible(&self) {
        let mut session = self.lock();
        if session.state != ProgrammerState::IoioIncompatible {
            session.target = None;
            session.set_state(ProgrammerState::IoioIncompatible);
        }
    }

    /// Run one drive cycle
    ///
    /// Returns the outcome if a run ended during this tick. `ConnectionLost`
    /// is returned as an error and never turned into an outcome.
    pub fn tick(&self, icsp: &mut dyn IcspChannel) -> Result<Option<RunOutcome>> {
        let (state, request) = {
            let mut session = self.lock();
            let mut request = None;
            if session.state == ProgrammerState::TargetConnected {
                if let Some(pending) = session.request.take() {
                    session.cancel = false;
                    session.set_state(pending.start_state());
                    request = Some(pending);
                }
            }
            (session.state, request)
        };

        match (state, request) {
            (ProgrammerState::EraseStart, _) => self.run_erase(icsp).map(Some),
            (ProgrammerState::ProgramStart, Some(Request::Program(image))) => {
                self.run_program(icsp, image).map(Some)
            }
            (state, _) if state.is_detecting() => {
                self.detect(icsp)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn detect(&self, icsp: &mut dyn IcspChannel) -> Result<()> {
        let id = {
            let mut mode = ProgrammingMode::enter(icsp)?;
            mode.channel().read_device_id()?
        };
        let detection = Detection::from_device_id(id);

        let mut session = self.lock();
        if !session.state.is_detecting() {
            // Disconnected while we were reading
            return Ok(());
        }
        let (next, target) = match detection {
            Detection::NoTarget => (ProgrammerState::IoioConnected, None),
            Detection::Known(chip) => (ProgrammerState::TargetConnected, Some(chip)),
            Detection::Unknown(id) => {
                if session.state != ProgrammerState::UnknownTargetConnected {
                    log::debug!("Unrecognized device id 0x{:04X}", id);
                }
                (ProgrammerState::UnknownTargetConnected, None)
            }
        };
        if session.state != next || session.target != target {
            session.target = target;
            session.set_state(next);
        }
        Ok(())
    }

    /// Move to the next stage of a run
    ///
    /// Fails with `ConnectionLost` if an observer callback already took the
    /// machine out of the run.
    fn advance(&self, next: ProgrammerState) -> Result<()> {
        let mut session = self.lock();
        if !session.state.is_running() {
            return Err(Error::ConnectionLost);
        }
        session.set_state(next);
        Ok(())
    }

    fn begin_pass(&self, pass: ProgrammerState, total: usize) -> Result<()> {
        let mut session = self.lock();
        if !session.state.is_running() {
            return Err(Error::ConnectionLost);
        }
        session.total_blocks = total;
        session.done_blocks = 0;
        session.set_state(pass);
        Ok(())
    }

    /// Block-boundary check: cancellation or an out-of-band disconnect
    fn checkpoint(&self) -> Result<Option<RunOutcome>> {
        let session = self.lock();
        if !session.state.is_running() {
            return Err(Error::ConnectionLost);
        }
        if session.cancel {
            log::info!("Aborted");
            return Ok(Some(RunOutcome::Aborted {
                completed: session.done_blocks,
            }));
        }
        Ok(None)
    }

    fn block_done(&self) {
        let mut session = self.lock();
        if session.done_blocks < session.total_blocks {
            session.done_blocks += 1;
        }
        let (pass, done, total) = (session.state, session.done_blocks, session.total_blocks);
        log::debug!("Block {} of {} done", done, total);
        session.listener.block_done(pass, done, total);
    }

    fn finish_run(&self, outcome: Option<RunOutcome>) {
        let mut session = self.lock();
        session.cancel = false;
        session.fall_back();
        if let Some(outcome) = outcome {
            session.listener.run_finished(&outcome);
            session.last_outcome = Some(outcome);
        }
        if self.inner.config.quit_after_run {
            session.quit = true;
            self.inner.quit_changed.notify_all();
        }
    }

    fn run_erase(&self, icsp: &mut dyn IcspChannel) -> Result<RunOutcome> {
        let outcome = match self.erase_pass(icsp) {
            Ok(()) => {
                log::info!("Erased successfully");
                RunOutcome::Success
            }
            Err(e) if e.is_connection_lost() => {
                log::error!("Erase failed: {}", e);
                self.finish_run(None);
                return Err(e);
            }
            Err(e) => {
                log::error!("Erase failed: {}", e);
                RunOutcome::Failed
            }
        };
        self.finish_run(Some(outcome.clone()));
        Ok(outcome)
    }

    fn erase_pass(&self, icsp: &mut dyn IcspChannel) -> Result<()> {
        let mut mode = ProgrammingMode::enter(icsp)?;
        self.advance(ProgrammerState::EraseInProgress)?;
        mode.channel().erase_chip()
    }

    fn run_program(&self, icsp: &mut dyn IcspChannel, image: ImageLoader) -> Result<RunOutcome> {
        let outcome = match self.program_passes(icsp, image) {
            Ok(outcome) => outcome,
            Err(e) if e.is_connection_lost() => {
                log::error!("Programming failed: {}", e);
                self.finish_run(None);
                return Err(e);
            }
            Err(Error::VerifyMismatch { address }) => {
                log::error!("File verification failed at 0x{:06X}", address);
                RunOutcome::VerificationFailed {
                    // Blocks before the failing one all verified
                    block: self.progress().0 + 1,
                    address,
                }
            }
            Err(Error::Format(msg)) => {
                log::error!("Image corrupt: {}", msg);
                RunOutcome::ImageCorrupt
            }
            Err(e) => {
                // The cause is not surfaced beyond the log line
                log::error!("Programming failed: {}", e);
                RunOutcome::Failed
            }
        };
        self.finish_run(Some(outcome.clone()));
        Ok(outcome)
    }

    fn program_passes(&self, icsp: &mut dyn IcspChannel, image: ImageLoader) -> Result<RunOutcome> {
        let mut mode = ProgrammingMode::enter(icsp)?;
        self.advance(ProgrammerState::EraseInProgress)?;
        mode.channel().erase_chip()?;

        let mut image = image.load()?;
        let total = image.count_blocks()?;

        self.begin_pass(ProgrammerState::ProgramInProgress, total)?;
        image.rewind();
        while image.next()? {
            if let Some(aborted) = self.checkpoint()? {
                return Ok(aborted);
            }
            mode.channel().write_block(&image.current_block())?;
            self.block_done();
        }

        self.begin_pass(ProgrammerState::VerifyInProgress, total)?;
        image.rewind();
        while image.next()? {
            if let Some(aborted) = self.checkpoint()? {
                return Ok(aborted);
            }
            let block = image.current_block();
            if !mode.channel().verify_block(&block)? {
                return Err(Error::VerifyMismatch {
                    address: block.address,
                });
            }
            self.block_done();
        }

        log::info!("Target programmed successfully");
        Ok(RunOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Block, BLOCK_DATA_SIZE};
    use std::sync::mpsc;

    /// Scripted ICSP channel
    #[derive(Default)]
    struct Script {
        device_id: u16,
        in_programming: bool,
        log: Vec<String>,
        erase_error: Option<fn() -> Error>,
        mismatch_at: Option<u32>,
        lose_link_on_write: Option<usize>,
        cancel_after_writes: Option<(usize, Programmer)>,
        cancel_on_erase: Option<Programmer>,
        writes: usize,
        verifies: usize,
    }

    impl IcspChannel for Script {
        fn enter_programming(&mut self) -> Result<()> {
            self.in_programming = true;
            self.log.push("enter".into());
            Ok(())
        }
        fn exit_programming(&mut self) -> Result<()> {
            self.in_programming = false;
            self.log.push("exit".into());
            Ok(())
        }
        fn read_device_id(&mut self) -> Result<u16> {
            assert!(self.in_programming);
            Ok(self.device_id)
        }
        fn erase_chip(&mut self) -> Result<()> {
            assert!(self.in_programming);
            self.log.push("erase".into());
            if let Some(programmer) = &self.cancel_on_erase {
                programmer.cancel();
            }
            match self.erase_error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
        fn write_block(&mut self, block: &Block<'_>) -> Result<()> {
            assert!(self.in_programming);
            if self.lose_link_on_write == Some(self.writes) {
                return Err(Error::ConnectionLost);
            }
            self.writes += 1;
            self.log.push(format!("write {:04X}", block.address));
            if let Some((after, programmer)) = &self.cancel_after_writes {
                if self.writes == *after {
                    programmer.cancel();
                }
            }
            Ok(())
        }
        fn verify_block(&mut self, block: &Block<'_>) -> Result<bool> {
            assert!(self.in_programming);
            self.verifies += 1;
            self.log.push(format!("verify {:04X}", block.address));
            Ok(self.mismatch_at != Some(block.address))
        }
    }

    fn image(blocks: u32) -> ImageLoader {
        let payload = [0x5Au8; BLOCK_DATA_SIZE];
        let records: Vec<_> = (0..blocks).map(|i| (i * 0x80, &payload[..])).collect();
        ImageLoader::from_image(IoioFile::from_blocks(records))
    }

    fn ready(device_id: u16) -> (Programmer, Script) {
        let programmer = Programmer::new(ProgrammerConfig::default());
        programmer.connected();
        let mut script = Script {
            device_id,
            ..Default::default()
        };
        programmer.tick(&mut script).unwrap();
        (programmer, script)
    }

    #[derive(Clone)]
    struct Recorder(mpsc::Sender<String>);

    impl ProgressListener for Recorder {
        fn state_changed(&mut self, state: ProgrammerState, _target: Option<Chip>) {
            let _ = self.0.send(format!("state {:?}", state));
        }
        fn block_done(&mut self, pass: ProgrammerState, done: usize, total: usize) {
            assert!(done <= total);
            let _ = self.0.send(format!("{:?} {}/{}", pass, done, total));
        }
        fn run_finished(&mut self, outcome: &RunOutcome) {
            let _ = self.0.send(format!("finished {}", outcome));
        }
    }

    #[test]
    fn test_detect_known_target() {
        let (programmer, script) = ready(0x4109);
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert_eq!(programmer.target(), Some(Chip::Pic24fj128da106));
        assert_eq!(script.log, ["enter", "exit"]);
    }

    #[test]
    fn test_detect_unknown_target() {
        let (programmer, _) = ready(0x1234);
        assert_eq!(programmer.state(), ProgrammerState::UnknownTargetConnected);
        assert_eq!(programmer.target(), None);
    }

    #[test]
    fn test_no_target_and_removal() {
        let (programmer, mut script) = ready(0xFFFF);
        assert_eq!(programmer.state(), ProgrammerState::IoioConnected);

        script.device_id = 0x4104;
        programmer.tick(&mut script).unwrap();
        assert_eq!(programmer.target(), Some(Chip::Pic24fj256gb206));

        script.device_id = 0xFFFF;
        programmer.tick(&mut script).unwrap();
        assert_eq!(programmer.state(), ProgrammerState::IoioConnected);
        assert_eq!(programmer.target(), None);
    }

    #[test]
    fn test_no_target_after_program_history() {
        let (programmer, mut script) = ready(0x4109);
        programmer.request_program(image(2));
        assert_eq!(programmer.tick(&mut script).unwrap(), Some(RunOutcome::Success));

        script.device_id = 0xFFFF;
        programmer.tick(&mut script).unwrap();
        assert_eq!(programmer.state(), ProgrammerState::IoioConnected);
    }

    #[test]
    fn test_disconnected_does_not_detect() {
        let programmer = Programmer::new(ProgrammerConfig::default());
        let mut script = Script::default();
        assert_eq!(programmer.tick(&mut script).unwrap(), None);
        assert!(script.log.is_empty());
        assert_eq!(programmer.state(), ProgrammerState::IoioDisconnected);
    }

    #[test]
    fn test_request_waits_for_known_target() {
        let (programmer, mut script) = ready(0x1234);
        programmer.request_erase();
        programmer.tick(&mut script).unwrap();
        assert_eq!(programmer.state(), ProgrammerState::UnknownTargetConnected);
        assert!(!script.log.contains(&"erase".to_string()));

        script.device_id = 0x410D;
        programmer.tick(&mut script).unwrap();
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert_eq!(programmer.tick(&mut script).unwrap(), Some(RunOutcome::Success));
        assert!(script.log.contains(&"erase".to_string()));
    }

    #[test]
    fn test_erase_success() {
        let (programmer, mut script) = ready(0x4109);
        programmer.request_erase();
        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::Success));
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert!(programmer.should_quit());
        assert_eq!(&script.log[2..], ["enter", "erase", "exit"]);
    }

    #[test]
    fn test_erase_generic_failure_falls_back() {
        let (programmer, mut script) = ready(0x4109);
        script.erase_error = Some(|| Error::Icsp("timeout".into()));
        programmer.request_erase();
        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::Failed));
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert!(!script.in_programming);
    }

    #[test]
    fn test_erase_connection_lost_propagates() {
        let (programmer, mut script) = ready(0x4109);
        script.erase_error = Some(|| Error::ConnectionLost);
        programmer.request_erase();
        assert!(matches!(programmer.tick(&mut script), Err(Error::ConnectionLost)));
        assert!(!script.in_programming);
        assert_eq!(programmer.last_outcome(), None);

        programmer.disconnected();
        assert_eq!(programmer.state(), ProgrammerState::IoioDisconnected);
    }

    #[test]
    fn test_program_and_verify() {
        let (tx, rx) = mpsc::channel();
        let programmer =
            Programmer::with_listener(ProgrammerConfig::default(), Recorder(tx));
        programmer.connected();
        let mut script = Script {
            device_id: 0x4109,
            ..Default::default()
        };
        programmer.tick(&mut script).unwrap();
        programmer.request_program(image(3));

        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::Success));
        assert_eq!(script.writes, 3);
        assert_eq!(script.verifies, 3);
        assert_eq!(programmer.progress(), (3, 3));
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert!(!script.in_programming);

        let events: Vec<String> = rx.try_iter().collect();
        let expected = [
            "state IoioConnected",
            "state TargetConnected",
            "state ProgramStart",
            "state EraseInProgress",
            "state ProgramInProgress",
            "ProgramInProgress 1/3",
            "ProgramInProgress 2/3",
            "ProgramInProgress 3/3",
            "state VerifyInProgress",
            "VerifyInProgress 1/3",
            "VerifyInProgress 2/3",
            "VerifyInProgress 3/3",
            "state TargetConnected",
            "finished success",
        ];
        assert_eq!(events, expected);
    }

    #[test]
    fn test_cancel_after_fourth_block() {
        let (programmer, mut script) = ready(0x4109);
        script.cancel_after_writes = Some((4, programmer.clone()));
        programmer.request_program(image(10));

        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::Aborted { completed: 4 }));
        assert_eq!(script.writes, 4);
        assert_eq!(script.verifies, 0);
        assert_eq!(programmer.progress(), (4, 10));
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert_eq!(script.log.last().map(String::as_str), Some("exit"));
    }

    #[test]
    fn test_verify_stops_at_first_mismatch() {
        let (programmer, mut script) = ready(0x4109);
        // Block 7 of 10 starts at 6 * 0x80
        script.mismatch_at = Some(6 * 0x80);
        programmer.request_program(image(10));

        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(
            outcome,
            Some(RunOutcome::VerificationFailed {
                block: 7,
                address: 0x300
            })
        );
        assert_eq!(script.writes, 10);
        assert_eq!(script.verifies, 7);
        assert!(!script.in_programming);
    }

    #[test]
    fn test_corrupt_image() {
        let (programmer, mut script) = ready(0x4109);
        programmer.request_program(ImageLoader::new(|| {
            Ok(Box::new(IoioFile::from_bytes(vec![0u8; 5])?) as Box<dyn ImageSource>)
        }));

        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::ImageCorrupt));
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert_eq!(script.writes, 0);
        // Erase already happened and is not rolled back
        assert!(script.log.contains(&"erase".to_string()));
        assert!(!script.in_programming);
    }

    #[test]
    fn test_connection_lost_mid_program() {
        let (programmer, mut script) = ready(0x4109);
        script.lose_link_on_write = Some(2);
        programmer.request_program(image(5));

        assert!(matches!(programmer.tick(&mut script), Err(Error::ConnectionLost)));
        assert_eq!(script.verifies, 0);
        assert_eq!(programmer.progress(), (2, 5));
        assert!(programmer.should_quit());
    }

    #[test]
    fn test_disconnect_callback_unwinds_run() {
        let (programmer, mut script) = ready(0x4109);
        let other = programmer.clone();
        script.cancel_after_writes = None;
        programmer.request_program(image(4));

        // Simulate the lifecycle observer firing between blocks
        struct Unplug<'a> {
            inner: &'a mut Script,
            programmer: Programmer,
        }
        impl IcspChannel for Unplug<'_> {
            fn enter_programming(&mut self) -> Result<()> {
                self.inner.enter_programming()
            }
            fn exit_programming(&mut self) -> Result<()> {
                self.inner.exit_programming()
            }
            fn read_device_id(&mut self) -> Result<u16> {
                self.inner.read_device_id()
            }
            fn erase_chip(&mut self) -> Result<()> {
                self.inner.erase_chip()
            }
            fn write_block(&mut self, block: &Block<'_>) -> Result<()> {
                self.inner.write_block(block)?;
                if self.inner.writes == 1 {
                    self.programmer.disconnected();
                }
                Ok(())
            }
            fn verify_block(&mut self, block: &Block<'_>) -> Result<bool> {
                self.inner.verify_block(block)
            }
        }

        let mut unplug = Unplug {
            inner: &mut script,
            programmer: other,
        };
        assert!(matches!(programmer.tick(&mut unplug), Err(Error::ConnectionLost)));
        assert_eq!(script.writes, 1);
        assert_eq!(programmer.state(), ProgrammerState::IoioDisconnected);
    }

    #[test]
    fn test_counters_stay_in_range() {
        let (tx, rx) = mpsc::channel();
        let programmer =
            Programmer::with_listener(ProgrammerConfig::default(), Recorder(tx));
        programmer.connected();
        let mut script = Script {
            device_id: 0x4108,
            ..Default::default()
        };
        programmer.tick(&mut script).unwrap();
        programmer.request_program(image(1));
        programmer.tick(&mut script).unwrap();
        let (done, total) = programmer.progress();
        assert!(done <= total);
        // Recorder asserts done <= total on every report
        assert!(rx.try_iter().count() > 0);
    }

    #[test]
    fn test_incompatible_and_reconnect() {
        let programmer = Programmer::new(ProgrammerConfig::default());
        programmer.incompatible();
        assert_eq!(programmer.state(), ProgrammerState::IoioIncompatible);
        programmer.connected();
        assert_eq!(programmer.state(), ProgrammerState::IoioConnected);
    }

    #[test]
    fn test_quit_wakes_waiter() {
        let programmer = Programmer::new(ProgrammerConfig::default());
        assert!(!programmer.wait_for_quit(Duration::from_millis(1)));
        let other = programmer.clone();
        let waiter = std::thread::spawn(move || other.wait_for_quit(Duration::from_secs(10)));
        programmer.quit();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_cancel_clears_pending_request() {
        let (programmer, mut script) = ready(0x4109);
        programmer.request_erase();
        programmer.cancel();
        assert_eq!(programmer.tick(&mut script).unwrap(), None);
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
        assert!(!programmer.should_quit());
    }

    #[test]
    fn test_cancel_once_run_started_is_kept() {
        let (programmer, mut script) = ready(0x4109);
        script.cancel_on_erase = Some(programmer.clone());
        programmer.request_program(image(5));

        let outcome = programmer.tick(&mut script).unwrap();
        assert_eq!(outcome, Some(RunOutcome::Aborted { completed: 0 }));
        assert_eq!(script.writes, 0);
        assert_eq!(script.verifies, 0);
        assert_eq!(programmer.state(), ProgrammerState::TargetConnected);
    }

    #[test]
    fn test_stale_cancel_does_not_abort_next_run() {
        let (programmer, mut script) = ready(0x4109);
        script.cancel_after_writes = Some((1, programmer.clone()));
        programmer.request_program(image(3));
        assert_eq!(
            programmer.tick(&mut script).unwrap(),
            Some(RunOutcome::Aborted { completed: 1 })
        );

        script.cancel_after_writes = None;
        programmer.request_program(image(3));
        assert_eq!(programmer.tick(&mut script).unwrap(), Some(RunOutcome::Success));
    }
}
