//! Connection lifecycle and peripheral handles
//!
//! A [`Board`] owns the single connection to one IOIO board. Every
//! [`PeripheralHandle`] records the connection generation it was opened in;
//! leaving the Connected state bumps the generation and clears the
//! allocator, which invalidates every outstanding handle at once.
//!
//! Lock order: the transport mutex may be held while taking the shared
//! state mutex, never the other way round.

use crate::error::{Error, Result};
use crate::icsp::IcspMaster;
use crate::resource::{
    Capability, Claim, InputMode, OutputMode, Parity, PeripheralSpec, PinMode,
    ResourceAllocator, SpiRate, StopBits, TwiRate,
};
use crate::transport::{HardwareInfo, Transport, INTERFACE_ID};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link (initial)
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Link up, handles usable
    Connected,
    /// Board returning to its initial resource state
    SoftResetting,
    /// Board rebooting
    HardResetting,
}

/// Notification sent to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was established
    Connected(HardwareInfo),
    /// The connection is gone (operator disconnect, reset or link loss)
    Disconnected,
    /// The board answered but speaks an unsupported interface version
    Incompatible,
}

struct Shared {
    state: ConnectionState,
    /// Bumped whenever Connected is left; handles from older generations are dead
    generation: u64,
    /// Bumped on every operator disconnect; aborts pending waits
    epoch: u64,
    allocator: ResourceAllocator,
    hardware: Option<HardwareInfo>,
    observers: Vec<Sender<ConnectionEvent>>,
}

impl Shared {
    fn invalidate(&mut self) {
        self.generation += 1;
        self.allocator.clear();
    }

    fn notify(&mut self, event: ConnectionEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct Inner {
    shared: Mutex<Shared>,
    changed: Condvar,
    transport: Mutex<Box<dyn Transport>>,
}

/// Handle to one board connection
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Board {
    inner: Arc<Inner>,
}

impl Board {
    /// Create a board over `transport`, initially disconnected
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    epoch: 0,
                    allocator: ResourceAllocator::new(),
                    hardware: None,
                    observers: Vec::new(),
                }),
                changed: Condvar::new(),
                transport: Mutex::new(Box::new(transport)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Shared>) -> MutexGuard<'a, Shared> {
        self.inner
            .changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Identification of the connected board
    pub fn hardware(&self) -> Option<HardwareInfo> {
        self.lock().hardware.clone()
    }

    /// Register an observer
    ///
    /// Events are delivered asynchronously; a dropped receiver is removed
    /// on the next event.
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().observers.push(tx);
        rx
    }

    /// Block until the board is connected
    ///
    /// Drives the handshake if nobody else is. Fails with `ConnectionLost`
    /// if `disconnect()` is called while waiting, with `Incompatible` if the
    /// board rejects our interface version, or with whatever the transport
    /// reports if the link cannot be opened.
    pub fn wait_for_connect(&self) -> Result<()> {
        let mut shared = self.lock();
        let epoch = shared.epoch;
        loop {
            if shared.epoch != epoch {
                return Err(Error::ConnectionLost);
            }
            match shared.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => break,
                _ => shared = self.wait(shared),
            }
        }
        shared.state = ConnectionState::Connecting;
        drop(shared);

        let result = self.establish();

        let mut shared = self.lock();
        if shared.epoch != epoch {
            // disconnect() ran during the handshake and already moved us out
            return Err(Error::ConnectionLost);
        }
        let outcome = match result {
            Ok(info) => {
                log::info!(
                    "Connected to board {} (bootloader {}, firmware {})",
                    info.hardware_id,
                    info.bootloader_id,
                    info.firmware_id
                );
                shared.state = ConnectionState::Connected;
                shared.hardware = Some(info.clone());
                shared.notify(ConnectionEvent::Connected(info));
                Ok(())
            }
            Err(e) => {
                shared.state = ConnectionState::Disconnected;
                if matches!(e, Error::Incompatible(_)) {
                    shared.notify(ConnectionEvent::Incompatible);
                }
                Err(e)
            }
        };
        self.inner.changed.notify_all();
        outcome
    }

    fn establish(&self) -> Result<HardwareInfo> {
        let mut transport = self.transport();
        let info = transport.establish()?;
        if !transport.check_interface(INTERFACE_ID)? {
            transport.close();
            return Err(Error::Incompatible(format!(
                "board {} (firmware {}) does not support {}",
                info.hardware_id, info.firmware_id, INTERFACE_ID
            )));
        }
        Ok(info)
    }

    /// Block until the board is disconnected
    pub fn wait_for_disconnect(&self) {
        let mut shared = self.lock();
        while shared.state != ConnectionState::Disconnected {
            shared = self.wait(shared);
        }
    }

    /// Drop the connection from any state
    ///
    /// Invalidates every handle, releases every claim and aborts pending
    /// `wait_for_connect()` calls. Idempotent.
    pub fn disconnect(&self) {
        let mut shared = self.lock();
        shared.epoch += 1;
        let was = shared.state;
        shared.invalidate();
        shared.state = ConnectionState::Disconnected;
        shared.hardware = None;
        if was != ConnectionState::Disconnected {
            log::info!("Disconnecting from board");
            shared.notify(ConnectionEvent::Disconnected);
        }
        self.inner.changed.notify_all();
        drop(shared);

        if was != ConnectionState::Disconnected {
            self.transport().close();
        }
    }

    /// Return the board to its initial resource state, keeping the link
    ///
    /// All handles are invalidated. Fails with `ConnectionLost` (leaving the
    /// board disconnected) if the link drops during the reset.
    pub fn soft_reset(&self) -> Result<()> {
        let mut shared = self.lock();
        if shared.state != ConnectionState::Connected {
            return Err(Error::ConnectionLost);
        }
        shared.state = ConnectionState::SoftResetting;
        shared.invalidate();
        drop(shared);

        let result = self.transport().soft_reset();

        let mut shared = self.lock();
        if shared.state != ConnectionState::SoftResetting {
            // Disconnected underneath us
            return Err(Error::ConnectionLost);
        }
        let outcome = match result {
            Ok(()) => {
                log::debug!("Soft reset complete");
                shared.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                log::error!("Soft reset failed: {}", e);
                shared.state = ConnectionState::Disconnected;
                shared.hardware = None;
                shared.notify(ConnectionEvent::Disconnected);
                Err(Error::ConnectionLost)
            }
        };
        self.inner.changed.notify_all();
        outcome
    }

    /// Reboot the board
    ///
    /// Always ends disconnected; reconnect with `wait_for_connect()`.
    pub fn hard_reset(&self) -> Result<()> {
        let mut shared = self.lock();
        if shared.state != ConnectionState::Connected {
            return Err(Error::ConnectionLost);
        }
        shared.state = ConnectionState::HardResetting;
        shared.invalidate();
        drop(shared);

        let result = {
            let mut transport = self.transport();
            let result = transport.hard_reset();
            transport.close();
            result
        };

        let mut shared = self.lock();
        if shared.state == ConnectionState::HardResetting {
            shared.state = ConnectionState::Disconnected;
            shared.hardware = None;
            shared.notify(ConnectionEvent::Disconnected);
        }
        self.inner.changed.notify_all();
        result.map_err(|e| {
            log::error!("Hard reset failed: {}", e);
            Error::ConnectionLost
        })
    }

    /// Report a link failure detected outside an operator request
    ///
    /// Handles are invalidated before this returns; observers learn about it
    /// through their event channel.
    pub fn link_lost(&self) {
        let mut shared = self.lock();
        match shared.state {
            // Nothing to tear down, or the handshake will fail on its own
            ConnectionState::Disconnected | ConnectionState::Connecting => return,
            _ => {}
        }
        log::warn!("Connection to board lost");
        shared.invalidate();
        shared.state = ConnectionState::Disconnected;
        shared.hardware = None;
        shared.notify(ConnectionEvent::Disconnected);
        self.inner.changed.notify_all();
    }

    /// Claim a peripheral
    pub fn open(&self, spec: &PeripheralSpec) -> Result<PeripheralHandle> {
        let mut shared = self.lock();
        if shared.state != ConnectionState::Connected {
            return Err(Error::ConnectionLost);
        }
        let claim = shared.allocator.open(spec)?;
        Ok(PeripheralHandle {
            board: self.clone(),
            claim,
            generation: shared.generation,
            closed: false,
        })
    }

    /// Open a digital input
    pub fn open_digital_input(&self, pin: u8, mode: InputMode) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::DigitalInput { pin, mode })
    }

    /// Open a digital output
    pub fn open_digital_output(
        &self,
        pin: u8,
        mode: OutputMode,
        start_value: bool,
    ) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::DigitalOutput {
            pin,
            mode,
            start_value,
        })
    }

    /// Open an analog input
    pub fn open_analog_input(&self, pin: u8) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::AnalogInput { pin })
    }

    /// Open a PWM output
    pub fn open_pwm_output(&self, pin: u8, freq_hz: u32) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::Pwm { pin, freq_hz })
    }

    /// Open a UART
    pub fn open_uart(
        &self,
        rx: u8,
        tx: u8,
        baud: u32,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::Uart {
            rx,
            tx,
            baud,
            parity,
            stop_bits,
        })
    }

    /// Open an SPI master
    pub fn open_spi_master(
        &self,
        miso: u8,
        mosi: u8,
        clk: u8,
        slave_select: &[u8],
        rate: SpiRate,
    ) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::Spi {
            miso,
            mosi,
            clk,
            slave_select: slave_select.to_vec(),
            rate,
        })
    }

    /// Open a TWI master on module `num`
    pub fn open_twi_master(&self, num: u8, rate: TwiRate, smbus: bool) -> Result<PeripheralHandle> {
        self.open(&PeripheralSpec::Twi { num, rate, smbus })
    }

    /// Open the ICSP master
    pub fn open_icsp_master(&self) -> Result<IcspMaster> {
        let handle = self.open(&PeripheralSpec::Icsp)?;
        let channel = self.transport().icsp_channel()?;
        Ok(IcspMaster::new(handle, channel, self.clone()))
    }

    /// Mode a pin is currently left in
    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.lock().allocator.pin_mode(pin)
    }
}

/// Exclusive claim on a pin set and capability
///
/// Valid until closed or until the connection it was opened on goes away.
/// Dropping the handle closes it.
pub struct PeripheralHandle {
    board: Board,
    claim: Claim,
    generation: u64,
    closed: bool,
}

impl PeripheralHandle {
    /// Claimed pins
    pub fn pins(&self) -> &[u8] {
        &self.claim.pins
    }

    /// Claimed capability
    pub fn capability(&self) -> Capability {
        self.claim.capability
    }

    /// Module slot for pooled peripherals (PWM, UART, SPI)
    pub fn module(&self) -> Option<usize> {
        self.claim.module
    }

    /// Fail unless the handle can still be used
    ///
    /// Returns `ConnectionLost` once the connection it belongs to has been
    /// reset or dropped.
    pub fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidOperation(format!(
                "{} handle already closed",
                self.claim.capability
            )));
        }
        let shared = self.board.lock();
        if shared.state == ConnectionState::Connected
            && shared.generation == self.generation
            && shared.allocator.is_claimed(self.claim.id)
        {
            Ok(())
        } else {
            Err(Error::ConnectionLost)
        }
    }

    /// Whether the handle can still be used
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Release the claim; a no-op if already closed or invalidated
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut shared = self.board.lock();
        if shared.generation == self.generation {
            shared.allocator.close(self.claim.id);
        }
    }
}

impl Drop for PeripheralHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("capability", &self.claim.capability)
            .field("pins", &self.claim.pins)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icsp::IcspChannel;
    use crate::image::Block;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    struct LoopbackChannel {
        link_up: Arc<AtomicBool>,
    }

    impl LoopbackChannel {
        fn check(&self) -> Result<()> {
            if self.link_up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::ConnectionLost)
            }
        }
    }

    impl IcspChannel for LoopbackChannel {
        fn enter_programming(&mut self) -> Result<()> {
            self.check()
        }
        fn exit_programming(&mut self) -> Result<()> {
            self.check()
        }
        fn read_device_id(&mut self) -> Result<u16> {
            self.check().map(|_| 0x4109)
        }
        fn erase_chip(&mut self) -> Result<()> {
            self.check()
        }
        fn write_block(&mut self, _block: &Block<'_>) -> Result<()> {
            self.check()
        }
        fn verify_block(&mut self, _block: &Block<'_>) -> Result<bool> {
            self.check().map(|_| true)
        }
    }

    struct TestLink {
        compatible: bool,
        fail_soft_reset: bool,
        link_up: Arc<AtomicBool>,
        gate: Option<Receiver<()>>,
    }

    impl TestLink {
        fn new() -> Self {
            Self {
                compatible: true,
                fail_soft_reset: false,
                link_up: Arc::new(AtomicBool::new(false)),
                gate: None,
            }
        }
    }

    impl Transport for TestLink {
        fn establish(&mut self) -> Result<HardwareInfo> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.link_up.store(true, Ordering::SeqCst);
            Ok(HardwareInfo {
                hardware_id: "SPRK0020".into(),
                bootloader_id: "IOIO0400".into(),
                firmware_id: "IOIO0500".into(),
            })
        }
        fn check_interface(&mut self, _interface_id: &str) -> Result<bool> {
            Ok(self.compatible)
        }
        fn soft_reset(&mut self) -> Result<()> {
            if self.fail_soft_reset {
                self.link_up.store(false, Ordering::SeqCst);
                Err(Error::ConnectionLost)
            } else {
                Ok(())
            }
        }
        fn hard_reset(&mut self) -> Result<()> {
            self.link_up.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn close(&mut self) {
            self.link_up.store(false, Ordering::SeqCst);
        }
        fn icsp_channel(&mut self) -> Result<Box<dyn IcspChannel>> {
            Ok(Box::new(LoopbackChannel {
                link_up: self.link_up.clone(),
            }))
        }
    }

    fn connected_board() -> Board {
        let board = Board::new(TestLink::new());
        board.wait_for_connect().unwrap();
        board
    }

    #[test]
    fn test_open_requires_connection() {
        let board = Board::new(TestLink::new());
        assert!(matches!(
            board.open_digital_input(1, InputMode::Floating),
            Err(Error::ConnectionLost)
        ));
    }

    #[test]
    fn test_connect_and_open() {
        let board = connected_board();
        assert_eq!(board.state(), ConnectionState::Connected);
        assert_eq!(board.hardware().unwrap().hardware_id, "SPRK0020");

        let handle = board.open_pwm_output(10, 500).unwrap();
        assert!(handle.is_valid());
        assert_eq!(handle.pins(), &[10]);
        assert_eq!(handle.module(), Some(0));
        assert!(matches!(
            board.open_pwm_output(10, 500),
            Err(Error::ResourceBusy { pin: 10, .. })
        ));
    }

    #[test]
    fn test_drop_closes_and_floats() {
        let board = connected_board();
        {
            let _out = board.open_digital_output(3, OutputMode::Normal, true).unwrap();
            assert_eq!(board.pin_mode(3), Some(PinMode::Output));
        }
        assert_eq!(board.pin_mode(3), Some(PinMode::Floating));
        board.open_digital_input(3, InputMode::PullDown).unwrap();
    }

    #[test]
    fn test_close_twice_is_noop() {
        let board = connected_board();
        let mut handle = board.open_analog_input(33).unwrap();
        handle.close();
        handle.close();
        assert!(matches!(handle.check(), Err(Error::InvalidOperation(_))));
        let _again = board.open_analog_input(33).unwrap();
    }

    #[test]
    fn test_disconnect_invalidates_all_handles() {
        let board = connected_board();
        let events = board.subscribe();
        let a = board.open_digital_input(1, InputMode::PullUp).unwrap();
        let b = board
            .open_uart(3, 4, 115_200, Parity::None, StopBits::One)
            .unwrap();
        let c = board.open_twi_master(2, TwiRate::Rate400K, false).unwrap();

        board.disconnect();
        for handle in [&a, &b, &c] {
            assert!(matches!(handle.check(), Err(Error::ConnectionLost)));
        }
        assert_eq!(events.recv().unwrap(), ConnectionEvent::Disconnected);

        // Idempotent, and no second event
        board.disconnect();
        assert!(events.try_recv().is_err());
        assert_eq!(board.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stale_handle_does_not_release_new_claim() {
        let board = connected_board();
        let mut stale = board.open_digital_input(7, InputMode::Floating).unwrap();
        board.soft_reset().unwrap();

        let fresh = board.open_digital_input(7, InputMode::Floating).unwrap();
        stale.close();
        assert!(fresh.is_valid());
        assert!(matches!(
            board.open_digital_input(7, InputMode::Floating),
            Err(Error::ResourceBusy { .. })
        ));
    }

    #[test]
    fn test_soft_reset_keeps_link() {
        let board = connected_board();
        let handle = board
            .open_spi_master(3, 4, 5, &[6, 7], SpiRate::Rate4M)
            .unwrap();
        board.soft_reset().unwrap();
        assert_eq!(board.state(), ConnectionState::Connected);
        assert!(matches!(handle.check(), Err(Error::ConnectionLost)));
        board
            .open_spi_master(3, 4, 5, &[6, 7], SpiRate::Rate4M)
            .unwrap();
    }

    #[test]
    fn test_soft_reset_link_drop() {
        let mut link = TestLink::new();
        link.fail_soft_reset = true;
        let board = Board::new(link);
        board.wait_for_connect().unwrap();
        let events = board.subscribe();

        assert!(matches!(board.soft_reset(), Err(Error::ConnectionLost)));
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert_eq!(events.recv().unwrap(), ConnectionEvent::Disconnected);
    }

    #[test]
    fn test_hard_reset_ends_disconnected() {
        let board = connected_board();
        let handle = board.open_digital_input(2, InputMode::Floating).unwrap();
        board.hard_reset().unwrap();
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(!handle.is_valid());

        board.wait_for_connect().unwrap();
        assert_eq!(board.state(), ConnectionState::Connected);
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_wait_for_disconnect() {
        let board = connected_board();
        let waiter = {
            let board = board.clone();
            thread::spawn(move || board.wait_for_disconnect())
        };
        board.disconnect();
        waiter.join().unwrap();
        assert_eq!(board.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_incompatible_board() {
        let mut link = TestLink::new();
        link.compatible = false;
        let board = Board::new(link);
        let events = board.subscribe();

        assert!(matches!(board.wait_for_connect(), Err(Error::Incompatible(_))));
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert_eq!(events.recv().unwrap(), ConnectionEvent::Incompatible);
    }

    #[test]
    fn test_disconnect_aborts_wait_for_connect() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let mut link = TestLink::new();
        link.gate = Some(gate_rx);
        let board = Board::new(link);

        let waiter = {
            let board = board.clone();
            thread::spawn(move || board.wait_for_connect())
        };
        while board.state() != ConnectionState::Connecting {
            thread::sleep(Duration::from_millis(1));
        }
        let disconnecter = {
            let board = board.clone();
            thread::spawn(move || board.disconnect())
        };
        while board.state() != ConnectionState::Disconnected {
            thread::sleep(Duration::from_millis(1));
        }
        gate_tx.send(()).unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(Error::ConnectionLost)));
        disconnecter.join().unwrap();
        assert_eq!(board.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_icsp_master_fails_fast_after_disconnect() {
        let board = connected_board();
        let mut icsp = board.open_icsp_master().unwrap();
        assert_eq!(icsp.read_device_id().unwrap(), 0x4109);
        assert!(matches!(board.open_icsp_master(), Err(Error::ResourceBusy { .. })));

        board.disconnect();
        assert!(matches!(icsp.read_device_id(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_icsp_link_failure_reports_loss() {
        let link = TestLink::new();
        let link_up = link.link_up.clone();
        let board = Board::new(link);
        board.wait_for_connect().unwrap();
        let events = board.subscribe();
        let other = board.open_digital_input(1, InputMode::Floating).unwrap();
        let mut icsp = board.open_icsp_master().unwrap();

        link_up.store(false, Ordering::SeqCst);
        assert!(matches!(icsp.erase_chip(), Err(Error::ConnectionLost)));
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(!other.is_valid());
        assert_eq!(events.recv().unwrap(), ConnectionEvent::Disconnected);
    }
}
