//! Target chip and board tables
//!
//! Both tables are small and static; lookups are linear scans.

use core::fmt;

/// Device id reported when nothing answers on the ICSP lines
pub const NO_TARGET_ID: u16 = 0xFFFF;

/// PIC24 chips the programmer knows how to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chip {
    /// PIC24FJ128DA106
    Pic24fj128da106,
    /// PIC24FJ128DA206
    Pic24fj128da206,
    /// PIC24FJ256DA106
    Pic24fj256da106,
    /// PIC24FJ256DA206
    Pic24fj256da206,
    /// PIC24FJ256GB206
    Pic24fj256gb206,
}

const CHIPS: &[(Chip, u16, &str)] = &[
    (Chip::Pic24fj128da106, 0x4109, "PIC24FJ128DA106"),
    (Chip::Pic24fj128da206, 0x4108, "PIC24FJ128DA206"),
    (Chip::Pic24fj256da106, 0x410D, "PIC24FJ256DA106"),
    (Chip::Pic24fj256da206, 0x410C, "PIC24FJ256DA206"),
    (Chip::Pic24fj256gb206, 0x4104, "PIC24FJ256GB206"),
];

impl Chip {
    /// All known chips
    pub fn all() -> impl Iterator<Item = Chip> {
        CHIPS.iter().map(|(chip, _, _)| *chip)
    }

    /// Look up a chip by its device id
    pub fn find_by_id(id: u16) -> Option<Chip> {
        CHIPS
            .iter()
            .find(|(_, chip_id, _)| *chip_id == id)
            .map(|(chip, _, _)| *chip)
    }

    fn entry(self) -> &'static (Chip, u16, &'static str) {
        // Every variant has a row in CHIPS
        CHIPS
            .iter()
            .find(|(chip, _, _)| *chip == self)
            .unwrap_or(&CHIPS[0])
    }

    /// Device id reported by this chip
    pub fn id(self) -> u16 {
        self.entry().1
    }

    /// Part name
    pub fn name(self) -> &'static str {
        self.entry().2
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of reading the device id of whatever sits on the ICSP lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Nothing responded (id read back as 0xFFFF)
    NoTarget,
    /// A chip from the table
    Known(Chip),
    /// Something responded with an id we do not recognize
    Unknown(u16),
}

impl Detection {
    /// Classify a raw device id
    pub fn from_device_id(id: u16) -> Self {
        if id == NO_TARGET_ID {
            return Detection::NoTarget;
        }
        match Chip::find_by_id(id) {
            Some(chip) => Detection::Known(chip),
            None => Detection::Unknown(id),
        }
    }
}

/// IOIO board revisions, identified by their hardware id string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Board {
    /// Hardware id not in the table
    Unknown,
    /// SPRK0010
    Sprk0010,
    /// SPRK0011
    Sprk0011,
    /// SPRK0012
    Sprk0012,
    /// SPRK0013
    Sprk0013,
    /// SPRK0014
    Sprk0014,
    /// SPRK0015
    Sprk0015,
    /// SPRK0016
    Sprk0016,
    /// MINT0010
    Mint0010,
    /// SPRK0020 (IOIO-OTG)
    Sprk0020,
}

const BOARDS: &[(Board, &str, Chip)] = &[
    (Board::Sprk0010, "SPRK0010", Chip::Pic24fj128da106),
    (Board::Sprk0011, "SPRK0011", Chip::Pic24fj128da106),
    (Board::Sprk0012, "SPRK0012", Chip::Pic24fj128da106),
    (Board::Sprk0013, "SPRK0013", Chip::Pic24fj128da206),
    (Board::Sprk0014, "SPRK0014", Chip::Pic24fj128da206),
    (Board::Sprk0015, "SPRK0015", Chip::Pic24fj128da206),
    (Board::Sprk0016, "SPRK0016", Chip::Pic24fj256da206),
    (Board::Mint0010, "MINT0010", Chip::Pic24fj256da206),
    (Board::Sprk0020, "SPRK0020", Chip::Pic24fj256gb206),
];

impl Board {
    /// Look up a board by hardware id; unrecognized names map to `Unknown`
    pub fn find_by_name(name: &str) -> Board {
        BOARDS
            .iter()
            .find(|(_, board_name, _)| *board_name == name)
            .map(|(board, _, _)| *board)
            .unwrap_or(Board::Unknown)
    }

    /// Chip mounted on this board, if known
    pub fn chip(self) -> Option<Chip> {
        BOARDS
            .iter()
            .find(|(board, _, _)| *board == self)
            .map(|(_, _, chip)| *chip)
    }

    /// Hardware id string
    pub fn name(self) -> &'static str {
        BOARDS
            .iter()
            .find(|(board, _, _)| *board == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
