//! CLI argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Parse a tick period in milliseconds; zero is rejected
fn parse_tick_ms(s: &str) -> Result<u64, String> {
    match s.parse::<u64>() {
        Ok(0) => Err("tick period must be at least 1 ms".to_string()),
        Ok(ms) => Ok(ms),
        Err(e) => Err(format!("Invalid number: {}", e)),
    }
}

#[derive(Parser)]
#[command(name = "ioio-programmer")]
#[command(
    author,
    version,
    about = "ICSP firmware programmer for IOIO boards",
    long_about = "Programs the PIC24 on an IOIO board through a second IOIO acting as \
                  an ICSP master. The run starts as soon as a supported target is \
                  detected. Type 'q' and Enter to cancel and quit."
)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Board backend, optionally with parameters (e.g. dummy:device_id=0x4109)
    #[arg(short, long, default_value = "dummy")]
    pub programmer: String,

    /// Erase the target instead of programming it
    #[arg(long, conflicts_with = "image")]
    pub erase: bool,

    /// Driver tick period in milliseconds
    #[arg(long, default_value_t = 100, value_parser = parse_tick_ms)]
    pub tick_ms: u64,

    /// Firmware image (.ioio) to program
    pub image: Option<PathBuf>,
}
