//! Background loop driving a programmer on a board

use super::machine::Programmer;
use crate::chip;
use crate::connection::{Board, ConnectionEvent, ConnectionState};
use crate::error::Error;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Connects, ticks and reconnects until the programmer asks to quit
pub struct Driver {
    board: Board,
    programmer: Programmer,
    period: Duration,
}

impl Driver {
    /// Drive `programmer` on `board`, ticking at the programmer's configured
    /// period
    pub fn new(board: Board, programmer: Programmer) -> Self {
        let period = programmer.config().tick_period;
        Self {
            board,
            programmer,
            period,
        }
    }

    /// Run until the programmer's quit flag is set, then disconnect
    pub fn run(&self) {
        let events = self.board.subscribe();
        while !self.programmer.should_quit() {
            match self.board.wait_for_connect() {
                Ok(()) => {}
                Err(Error::Incompatible(msg)) => {
                    log::error!("{}", msg);
                    self.programmer.incompatible();
                    self.programmer.wait_for_quit(self.period);
                    continue;
                }
                Err(e) => {
                    log::debug!("Connect attempt failed: {}", e);
                    self.programmer.disconnected();
                    self.programmer.wait_for_quit(self.period);
                    continue;
                }
            }

            if let Some(info) = self.board.hardware() {
                let board = chip::Board::find_by_name(&info.hardware_id);
                match board.chip() {
                    Some(chip) => log::debug!("Board {} carries a {}", board, chip),
                    None => log::debug!("Unrecognized board {}", info.hardware_id),
                }
            }
            self.programmer.connected();
            self.drive(&events);
            self.programmer.disconnected();
        }
        self.board.disconnect();
    }

    /// Tick while connected
    ///
    /// Returns once the link is gone or quit is requested. Failing to open
    /// the ICSP master is not a disconnect; it is retried every period with
    /// the programmer state left alone.
    fn drive(&self, events: &Receiver<ConnectionEvent>) {
        let mut icsp = None;
        let mut open_failed = false;

        loop {
            if self.link_gone(events) || self.programmer.should_quit() {
                return;
            }
            if icsp.is_none() {
                match self.board.open_icsp_master() {
                    Ok(master) => {
                        if open_failed {
                            log::info!("ICSP available");
                        }
                        icsp = Some(master);
                    }
                    Err(e) if e.is_connection_lost() => return,
                    Err(e) => {
                        if !open_failed {
                            log::error!("Failed to open ICSP: {}", e);
                            open_failed = true;
                        }
                    }
                }
            }
            if let Some(icsp) = icsp.as_mut() {
                match self.programmer.tick(icsp) {
                    Ok(Some(outcome)) => log::debug!("Run finished: {}", outcome),
                    Ok(None) => {}
                    Err(e) if e.is_connection_lost() => return,
                    Err(e) => log::warn!("Tick failed: {}", e),
                }
            }
            if self.programmer.wait_for_quit(self.period) {
                return;
            }
        }
    }

    fn link_gone(&self, events: &Receiver<ConnectionEvent>) -> bool {
        let mut disconnected = false;
        for event in events.try_iter() {
            if event == ConnectionEvent::Disconnected {
                disconnected = true;
            }
        }
        // A stale event from an earlier connection does not count
        disconnected && self.board.state() != ConnectionState::Connected
    }
}
