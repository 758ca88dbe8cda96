//! ioio-programmer - ICSP firmware programmer for IOIO boards
//!
//! Detects the PIC24 attached to an IOIO board acting as ICSP master, and
//! erases it or writes and verifies an `.ioio` image on it.
//!
//! # Architecture
//!
//! Two threads share the programmer:
//! - the **driver** thread connects to the board, ticks the state machine
//!   and reconnects after a link loss
//! - the **console** thread reads stdin and cancels on `q`
//!
//! The main thread waits for the driver to finish, which happens once a run
//! concludes or the operator quits.

mod cli;
mod programmers;
mod progress;

use clap::Parser;
use cli::Cli;
use ioio_core::connection::{Board, ConnectionState};
use ioio_core::programmer::{Driver, ImageLoader, Programmer, ProgrammerConfig, RunOutcome};
use progress::IndicatifProgress;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let board = programmers::open_board(&cli.programmer)?;

    let config = ProgrammerConfig {
        tick_period: Duration::from_millis(cli.tick_ms),
        ..Default::default()
    };
    let programmer = Programmer::with_listener(config, IndicatifProgress::new());

    if cli.erase {
        log::info!("Erase scheduled; waiting for target");
        programmer.request_erase();
    } else if let Some(path) = cli.image {
        log::info!("Programming scheduled; waiting for target");
        programmer.request_program(ImageLoader::from_path(path));
    } else {
        log::info!("No image given, detecting targets only");
    }

    let driver = {
        let driver = Driver::new(board.clone(), programmer.clone());
        thread::Builder::new()
            .name("driver".into())
            .spawn(move || driver.run())?
    };
    spawn_console(board, programmer.clone())?;

    driver.join().map_err(|_| "driver thread panicked")?;

    exit_status(programmer.last_outcome()).map_err(Into::into)
}

/// Map the last run outcome to the process result
///
/// An operator cancel is not a failure.
fn exit_status(outcome: Option<RunOutcome>) -> Result<(), String> {
    match outcome {
        None | Some(RunOutcome::Success) | Some(RunOutcome::Aborted { .. }) => Ok(()),
        Some(outcome) => Err(format!("Run ended: {}", outcome)),
    }
}

/// Read operator commands from stdin
///
/// The thread is detached; it ends with the process.
fn spawn_console(board: Board, programmer: Programmer) -> std::io::Result<()> {
    thread::Builder::new().name("console".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::debug!("stdin: {}", e);
                    break;
                }
            };
            if line.trim() == "q" {
                log::info!("Quitting");
                programmer.quit();
                // Wake a driver blocked on the handshake
                if board.state() != ConnectionState::Connected {
                    board.disconnect();
                }
                break;
            }
        }
        log::debug!("Console input closed");
    })?;
    Ok(())
}
