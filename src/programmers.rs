//! Board backend registration and dispatch
//!
//! Backends are selected with a `name[:key=value,...]` string.

use ioio_core::connection::Board;
#[cfg(feature = "dummy")]
use ioio_dummy::{DummyBoard, DummyConfig};

/// Information about a board backend
pub struct BackendInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// All backends compiled in
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        aliases: &["emulated"],
        description: "Emulated board and PIC24 target (hardware_id=,device_id=,compatible=,flash_size=)",
    });

    backends
}

/// Help text listing all available backends
pub fn backend_help() -> String {
    let mut help = String::from("Available programmers:\n");
    for b in available_backends() {
        help.push_str(&format!("  {:12} - {}\n", b.name, b.description));
    }
    help
}

fn find_backend(name: &str) -> Option<&'static str> {
    available_backends()
        .into_iter()
        .find(|b| b.name == name || b.aliases.contains(&name))
        .map(|b| b.name)
}

/// Open the board described by `programmer`
#[cfg_attr(not(feature = "dummy"), allow(unused_variables))]
pub fn open_board(programmer: &str) -> Result<Board, Box<dyn std::error::Error>> {
    let (name, options) = parse_programmer_string(programmer);

    match find_backend(name) {
        #[cfg(feature = "dummy")]
        Some("dummy") => {
            let config = parse_dummy_options(&options)?;
            log::info!(
                "Opening emulated board {} (target id 0x{:04X})",
                config.hardware_id,
                config.device_id
            );
            Ok(Board::new(DummyBoard::new(config)))
        }
        _ => Err(unknown_backend_error(name)),
    }
}

#[cfg(feature = "dummy")]
fn parse_dummy_options(options: &[(&str, &str)]) -> Result<DummyConfig, String> {
    let mut config = DummyConfig::default();
    for (key, value) in options {
        match *key {
            "hardware_id" => config.hardware_id = value.to_string(),
            "device_id" => {
                let id = parse_hex_u32(value)?;
                config.device_id =
                    u16::try_from(id).map_err(|_| format!("device_id out of range: {}", value))?;
            }
            "compatible" => {
                config.compatible = value
                    .parse()
                    .map_err(|_| format!("compatible must be true or false, got {}", value))?;
            }
            "flash_size" => config.flash_size = parse_hex_u32(value)? as usize,
            other => return Err(format!("Unknown dummy parameter: {}", other)),
        }
    }
    Ok(config)
}

/// Parse a string as a hex or decimal u32
#[cfg(feature = "dummy")]
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a programmer string into name and options
///
/// Format: "name" or "name:option1=value1,option2=value2"
pub fn parse_programmer_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    if let Some((name, opts)) = s.split_once(':') {
        let options: Vec<_> = opts
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .collect();
        (name, options)
    } else {
        (s, Vec::new())
    }
}

fn unknown_backend_error(name: &str) -> Box<dyn std::error::Error> {
    let mut msg = format!("Unknown programmer: {}\n\n", name);
    msg.push_str(&backend_help());
    msg.into()
}
