//! # Earbud Identities and Link Addresses
//!
//! The case talks to exactly two peers. They are used as array indices
//! throughout the stack, never as a general collection.
//!
//! ```text
//! 2-bit DEST field:   0 = case   1 = right   2 = left   3 = broadcast
//! ```

/// Number of earbuds served by the case
pub const NO_OF_EARBUDS: usize = 2;

/// One of the two earbuds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Earbud {
    Left = 0,
    Right = 1,
}

impl Earbud {
    /// Both earbuds in service order (left first)
    pub const ALL: [Earbud; NO_OF_EARBUDS] = [Earbud::Left, Earbud::Right];

    /// Array index for per-earbud tables
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The opposite earbud
    pub const fn other(self) -> Earbud {
        match self {
            Earbud::Left => Earbud::Right,
            Earbud::Right => Earbud::Left,
        }
    }

    /// Display letter used in log and command output
    pub const fn letter(self) -> char {
        match self {
            Earbud::Left => 'L',
            Earbud::Right => 'R',
        }
    }
}

/// Where an outgoing frame is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Destination {
    Left,
    Right,
    Broadcast,
}

/// Address carried by frames travelling from an earbud to the case
pub const ADDRESS_CASE: u8 = 0;

impl Destination {
    /// Value of the 2-bit DEST header field
    pub const fn address(self) -> u8 {
        match self {
            Destination::Right => 1,
            Destination::Left => 2,
            Destination::Broadcast => 3,
        }
    }

    /// Inverse of [`Destination::address`]; the case address has no destination.
    pub const fn from_address(address: u8) -> Option<Destination> {
        match address & 0x03 {
            1 => Some(Destination::Right),
            2 => Some(Destination::Left),
            3 => Some(Destination::Broadcast),
            _ => None,
        }
    }

    /// The addressed earbud, or `None` for a broadcast
    pub const fn earbud(self) -> Option<Earbud> {
        match self {
            Destination::Left => Some(Earbud::Left),
            Destination::Right => Some(Earbud::Right),
            Destination::Broadcast => None,
        }
    }
}

impl From<Earbud> for Destination {
    fn from(earbud: Earbud) -> Self {
        match earbud {
            Earbud::Left => Destination::Left,
            Earbud::Right => Destination::Right,
        }
    }
}

/// Hex dump helper for log output, e.g. `22 03 0F`
pub struct Hex<'a>(pub &'a [u8]);

impl core::fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (n, byte) in self.0.iter().enumerate() {
            if n > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
