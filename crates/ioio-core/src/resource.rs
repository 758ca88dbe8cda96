//! Pin routing and exclusive resource allocation
//!
//! The allocator is pure bookkeeping: it knows which pin can be routed to
//! which peripheral, which pins and module slots are claimed, and what mode
//! every pin is left in. It never talks to the board; the connection layer
//! owns one allocator per live connection and clears it on invalidation.

use crate::error::{Error, Result};
use bitflags::bitflags;
use core::fmt;
use std::collections::HashMap;

/// Highest pin number on the board (pin 0 is the status LED)
pub const MAX_PIN: u8 = 48;

const NUM_PINS: usize = MAX_PIN as usize + 1;

/// Number of PWM output modules
pub const NUM_PWM_MODULES: usize = 9;
/// Number of UART modules
pub const NUM_UART_MODULES: usize = 4;
/// Number of SPI master modules
pub const NUM_SPI_MODULES: usize = 3;

/// Fixed (sda, scl) pins of each TWI module
pub const TWI_PINS: [(u8, u8); 3] = [(4, 5), (47, 48), (26, 25)];

/// Fixed ICSP pins: (MCLR, PGD, PGC)
pub const ICSP_PINS: [u8; 3] = [36, 37, 38];

bitflags! {
    /// Hardware routes available on a pin
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PinCaps: u8 {
        /// General purpose input/output
        const DIGITAL        = 1 << 0;
        /// Connected to the ADC
        const ANALOG         = 1 << 1;
        /// Remappable peripheral input (UART rx, SPI miso)
        const PERIPHERAL_IN  = 1 << 2;
        /// Remappable peripheral output (PWM, UART tx, SPI mosi/clk/ss)
        const PERIPHERAL_OUT = 1 << 3;
        /// Dedicated TWI line
        const TWI            = 1 << 4;
        /// Dedicated ICSP line
        const ICSP           = 1 << 5;

        /// Both peripheral directions
        const PERIPHERAL = Self::PERIPHERAL_IN.bits() | Self::PERIPHERAL_OUT.bits();
    }
}

const PERIPHERAL_PINS: &[u8] = &[
    3, 4, 5, 6, 7, 10, 11, 12, 13, 14, 27, 28, 29, 30, 31, 32, 34, 35, 36, 37, 38, 39, 40, 45,
    46, 47, 48,
];

/// Routes available on `pin`, or `None` if the pin does not exist
pub fn pin_caps(pin: u8) -> Option<PinCaps> {
    if pin > MAX_PIN {
        return None;
    }
    let mut caps = PinCaps::DIGITAL;
    if (31..=46).contains(&pin) {
        caps |= PinCaps::ANALOG;
    }
    if PERIPHERAL_PINS.contains(&pin) {
        caps |= PinCaps::PERIPHERAL;
    }
    if TWI_PINS.iter().any(|&(sda, scl)| pin == sda || pin == scl) {
        caps |= PinCaps::TWI;
    }
    if ICSP_PINS.contains(&pin) {
        caps |= PinCaps::ICSP;
    }
    Some(caps)
}

/// Kind of peripheral a handle grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Digital input
    DigitalInput,
    /// Digital output
    DigitalOutput,
    /// Analog input
    AnalogInput,
    /// PWM output
    Pwm,
    /// UART
    Uart,
    /// SPI master
    Spi,
    /// TWI (I2C) master
    Twi,
    /// In-circuit serial programming master
    Icsp,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::DigitalInput => "digital input",
            Capability::DigitalOutput => "digital output",
            Capability::AnalogInput => "analog input",
            Capability::Pwm => "PWM",
            Capability::Uart => "UART",
            Capability::Spi => "SPI",
            Capability::Twi => "TWI",
            Capability::Icsp => "ICSP",
        };
        f.write_str(name)
    }
}

/// Electrical state a pin is left in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinMode {
    /// High impedance, nothing attached (reset state)
    #[default]
    Floating,
    /// Input with internal pull-up
    PullUp,
    /// Input with internal pull-down
    PullDown,
    /// Push-pull output
    Output,
    /// Open-drain output
    OpenDrain,
    /// Routed to the ADC
    Analog,
    /// Routed to a peripheral module
    Peripheral,
}

/// Digital input electrical mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// No pull resistor
    #[default]
    Floating,
    /// Internal pull-up
    PullUp,
    /// Internal pull-down
    PullDown,
}

/// Digital output electrical mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Push-pull
    #[default]
    Normal,
    /// Open drain
    OpenDrain,
}

/// UART parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// UART stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// One stop bit
    #[default]
    One,
    /// Two stop bits
    Two,
}

/// SPI clock rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiRate {
    /// 31.25 kHz
    Rate31K,
    /// 125 kHz
    Rate125K,
    /// 1 MHz
    #[default]
    Rate1M,
    /// 4 MHz
    Rate4M,
    /// 8 MHz
    Rate8M,
}

/// TWI clock rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TwiRate {
    /// 100 kHz
    #[default]
    Rate100K,
    /// 400 kHz
    Rate400K,
    /// 1 MHz
    Rate1M,
}

/// A request for a peripheral: which pins, which capability, which options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralSpec {
    /// Digital input on one pin
    DigitalInput {
        /// Pin number
        pin: u8,
        /// Pull configuration
        mode: InputMode,
    },
    /// Digital output on one pin
    DigitalOutput {
        /// Pin number
        pin: u8,
        /// Driver configuration
        mode: OutputMode,
        /// Initial level
        start_value: bool,
    },
    /// Analog input on one pin
    AnalogInput {
        /// Pin number
        pin: u8,
    },
    /// PWM output on one pin
    Pwm {
        /// Pin number
        pin: u8,
        /// Output frequency
        freq_hz: u32,
    },
    /// UART on an rx/tx pin pair
    Uart {
        /// Receive pin
        rx: u8,
        /// Transmit pin
        tx: u8,
        /// Baud rate
        baud: u32,
        /// Parity
        parity: Parity,
        /// Stop bits
        stop_bits: StopBits,
    },
    /// SPI master
    Spi {
        /// Data in
        miso: u8,
        /// Data out
        mosi: u8,
        /// Clock
        clk: u8,
        /// One slave-select pin per slave
        slave_select: Vec<u8>,
        /// Clock rate
        rate: SpiRate,
    },
    /// TWI master on one of the fixed pin pairs
    Twi {
        /// Module number (0..=2)
        num: u8,
        /// Clock rate
        rate: TwiRate,
        /// SMBus voltage levels
        smbus: bool,
    },
    /// ICSP master on the fixed programming pins
    Icsp,
}

impl PeripheralSpec {
    /// Capability this request claims
    pub fn capability(&self) -> Capability {
        match self {
            PeripheralSpec::DigitalInput { .. } => Capability::DigitalInput,
            PeripheralSpec::DigitalOutput { .. } => Capability::DigitalOutput,
            PeripheralSpec::AnalogInput { .. } => Capability::AnalogInput,
            PeripheralSpec::Pwm { .. } => Capability::Pwm,
            PeripheralSpec::Uart { .. } => Capability::Uart,
            PeripheralSpec::Spi { .. } => Capability::Spi,
            PeripheralSpec::Twi { .. } => Capability::Twi,
            PeripheralSpec::Icsp => Capability::Icsp,
        }
    }

    /// Pins this request claims, each with the route it needs and the mode
    /// it leaves the pin in
    fn routes(&self) -> Result<Vec<(u8, PinCaps, PinMode)>> {
        let routes = match self {
            PeripheralSpec::DigitalInput { pin, mode } => {
                let pin_mode = match mode {
                    InputMode::Floating => PinMode::Floating,
                    InputMode::PullUp => PinMode::PullUp,
                    InputMode::PullDown => PinMode::PullDown,
                };
                vec![(*pin, PinCaps::DIGITAL, pin_mode)]
            }
            PeripheralSpec::DigitalOutput { pin, mode, .. } => {
                let pin_mode = match mode {
                    OutputMode::Normal => PinMode::Output,
                    OutputMode::OpenDrain => PinMode::OpenDrain,
                };
                vec![(*pin, PinCaps::DIGITAL, pin_mode)]
            }
            PeripheralSpec::AnalogInput { pin } => vec![(*pin, PinCaps::ANALOG, PinMode::Analog)],
            PeripheralSpec::Pwm { pin, freq_hz } => {
                if *freq_hz == 0 {
                    return Err(Error::InvalidOperation(
                        "PWM frequency must be non-zero".into(),
                    ));
                }
                vec![(*pin, PinCaps::PERIPHERAL_OUT, PinMode::Peripheral)]
            }
            PeripheralSpec::Uart { rx, tx, baud, .. } => {
                if *baud == 0 {
                    return Err(Error::InvalidOperation("UART baud rate must be non-zero".into()));
                }
                vec![
                    (*rx, PinCaps::PERIPHERAL_IN, PinMode::Peripheral),
                    (*tx, PinCaps::PERIPHERAL_OUT, PinMode::Peripheral),
                ]
            }
            PeripheralSpec::Spi {
                miso,
                mosi,
                clk,
                slave_select,
                ..
            } => {
                if slave_select.is_empty() {
                    return Err(Error::InvalidOperation(
                        "SPI master needs at least one slave-select pin".into(),
                    ));
                }
                let mut routes = vec![
                    (*miso, PinCaps::PERIPHERAL_IN, PinMode::Peripheral),
                    (*mosi, PinCaps::PERIPHERAL_OUT, PinMode::Peripheral),
                    (*clk, PinCaps::PERIPHERAL_OUT, PinMode::Peripheral),
                ];
                routes.extend(
                    slave_select
                        .iter()
                        .map(|&ss| (ss, PinCaps::DIGITAL, PinMode::Output)),
                );
                routes
            }
            PeripheralSpec::Twi { num, .. } => {
                let (sda, scl) = *TWI_PINS.get(*num as usize).ok_or_else(|| {
                    Error::InvalidOperation(format!("no TWI module {}", num))
                })?;
                vec![
                    (sda, PinCaps::TWI, PinMode::Peripheral),
                    (scl, PinCaps::TWI, PinMode::Peripheral),
                ]
            }
            PeripheralSpec::Icsp => ICSP_PINS
                .iter()
                .map(|&pin| (pin, PinCaps::ICSP, PinMode::Peripheral))
                .collect(),
        };
        Ok(routes)
    }

    /// Size of the module pool this capability draws from, if bounded
    fn pool_size(&self) -> Option<usize> {
        match self {
            PeripheralSpec::Pwm { .. } => Some(NUM_PWM_MODULES),
            PeripheralSpec::Uart { .. } => Some(NUM_UART_MODULES),
            PeripheralSpec::Spi { .. } => Some(NUM_SPI_MODULES),
            _ => None,
        }
    }
}

/// Identifier of a granted claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimId(u64);

/// A granted claim, as returned by [`ResourceAllocator::open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Claim identifier, used to release it
    pub id: ClaimId,
    /// Claimed pins, in request order
    pub pins: Vec<u8>,
    /// Claimed capability
    pub capability: Capability,
    /// Module slot for pooled capabilities
    pub module: Option<usize>,
}

/// Tracks exclusive ownership of pins and peripheral module slots
#[derive(Debug)]
pub struct ResourceAllocator {
    next_id: u64,
    claims: HashMap<ClaimId, Claim>,
    pin_owner: [Option<ClaimId>; NUM_PINS],
    pin_mode: [PinMode; NUM_PINS],
    modules: HashMap<Capability, Vec<bool>>,
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceAllocator {
    /// Create an allocator with every pin floating and every module free
    pub fn new() -> Self {
        Self {
            next_id: 0,
            claims: HashMap::new(),
            pin_owner: [None; NUM_PINS],
            pin_mode: [PinMode::Floating; NUM_PINS],
            modules: HashMap::new(),
        }
    }

    /// Claim the resources described by `spec`
    ///
    /// On failure nothing changes.
    pub fn open(&mut self, spec: &PeripheralSpec) -> Result<Claim> {
        let capability = spec.capability();
        let routes = spec.routes()?;

        // Validate everything before touching any state
        for (i, &(pin, needed, _)) in routes.iter().enumerate() {
            let caps = pin_caps(pin)
                .ok_or_else(|| Error::InvalidOperation(format!("no such pin: {}", pin)))?;
            if !caps.contains(needed) {
                return Err(Error::InvalidOperation(format!(
                    "pin {} cannot be used as {}",
                    pin, capability
                )));
            }
            if routes[..i].iter().any(|&(other, _, _)| other == pin) {
                return Err(Error::InvalidOperation(format!(
                    "pin {} requested twice",
                    pin
                )));
            }
        }
        if let Some(&(pin, _, _)) = routes
            .iter()
            .find(|(pin, _, _)| self.pin_owner[*pin as usize].is_some())
        {
            return Err(Error::ResourceBusy { pin, capability });
        }
        let module = match spec.pool_size() {
            Some(size) => {
                let slots = self
                    .modules
                    .entry(capability)
                    .or_insert_with(|| vec![false; size]);
                let free = slots
                    .iter()
                    .position(|used| !used)
                    .ok_or(Error::OutOfResource(capability))?;
                slots[free] = true;
                Some(free)
            }
            None => None,
        };

        let id = ClaimId(self.next_id);
        self.next_id += 1;
        for &(pin, _, mode) in &routes {
            self.pin_owner[pin as usize] = Some(id);
            self.pin_mode[pin as usize] = mode;
        }
        let claim = Claim {
            id,
            pins: routes.iter().map(|&(pin, _, _)| pin).collect(),
            capability,
            module,
        };
        log::trace!("Claimed {} on pins {:?}", capability, claim.pins);
        self.claims.insert(id, claim.clone());
        Ok(claim)
    }

    /// Release a claim, returning its pins to floating
    ///
    /// Releasing an unknown claim is a no-op. Returns whether anything was
    /// released.
    pub fn close(&mut self, id: ClaimId) -> bool {
        let Some(claim) = self.claims.remove(&id) else {
            return false;
        };
        for &pin in &claim.pins {
            self.pin_owner[pin as usize] = None;
            self.pin_mode[pin as usize] = PinMode::Floating;
        }
        if let (Some(slot), Some(slots)) = (claim.module, self.modules.get_mut(&claim.capability))
        {
            slots[slot] = false;
        }
        log::trace!("Released {} on pins {:?}", claim.capability, claim.pins);
        true
    }

    /// Drop every claim and float every pin
    pub fn clear(&mut self) {
        self.claims.clear();
        self.pin_owner = [None; NUM_PINS];
        self.pin_mode = [PinMode::Floating; NUM_PINS];
        self.modules.clear();
    }

    /// Whether `id` is currently held
    pub fn is_claimed(&self, id: ClaimId) -> bool {
        self.claims.contains_key(&id)
    }

    /// Current mode of a pin
    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.pin_mode.get(pin as usize).copied()
    }

    /// Number of live claims
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether nothing is claimed
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
