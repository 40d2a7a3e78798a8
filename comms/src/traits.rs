//! # Collaborator Traits
//!
//! The protocol core never touches hardware. Everything it needs from the
//! rest of the case firmware is expressed here, one trait per collaborator:
//!
//! - **Transport**: the half-duplex charger comms driver
//! - **PowerControl**: run/stop/standby reason registers
//! - **BatteryMonitor / ChargerMonitor / LidSensor**: data sources
//! - **ConfigStore**: persisted settings
//! - **CommandOutput**: text results for whichever CLI started a command
//! - **Clock**: free-running tick counter
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Case (session)                      │
//! │   ┌──────────┐   CcpEvents   ┌──────────┐  WireEvents    │
//! │   │   FSM    │◄──────────────│   CCP    │◄────────┐      │
//! │   └────┬─────┘               └────┬─────┘         │      │
//! │        │ Platform                 │          ┌────┴───┐  │
//! │        ▼                          └─────────►│  Wire  │  │
//! │  power / battery / charger /                 └────┬───┘  │
//! │  lid / config / cli / clock                       │      │
//! └───────────────────────────────────────────────────┼──────┘
//!                                                     ▼
//!                                                 Transport
//! ```

use crate::earbud::Destination;
use crate::power::{RunReason, StandbyReason, StopReason};

/// Physical charger comms driver
///
/// `transmit` starts an asynchronous send; received bytes come back through
/// `Wire::receive`, one at a time, from tick context.
pub trait Transport {
    /// Begin sending a complete frame to `dest`
    fn transmit(&mut self, dest: Destination, frame: &[u8]);

    /// True while a physical exchange (including contention sensing) is in progress
    fn is_active(&self) -> bool;
}

/// Power manager reason registers
pub trait PowerControl {
    fn set_run_reason(&mut self, reason: RunReason);
    fn clear_run_reason(&mut self, reason: RunReason);
    fn set_stop_reason(&mut self, reason: StopReason);
    fn clear_stop_reason(&mut self, reason: StopReason);
    fn set_standby_reason(&mut self, reason: StandbyReason);
    fn clear_standby_reason(&mut self, reason: StandbyReason);
}

/// Case battery monitor
pub trait BatteryMonitor {
    /// Start a battery measurement, optionally showing the level on the LEDs
    fn read_request(&mut self, led: bool);

    /// True once the last requested measurement has completed
    fn read_done(&self) -> bool;

    /// Case battery level in percent
    fn percentage(&self) -> u8;

    /// Current drawn by the (left, right) earbuds, if the board can measure it
    fn earbud_load_ma(&mut self) -> Option<(u32, u32)>;

    /// True if the board has earbud current senses fitted
    fn current_senses_present(&self) -> bool;
}

/// USB charger detection
pub trait ChargerMonitor {
    fn is_connected(&self) -> bool;
    fn is_charging(&self) -> bool;

    /// Called when the case sees the charger arrive
    fn connected(&mut self);

    /// Called when the case sees the charger leave
    fn disconnected(&mut self);
}

/// Lid magnet sensor
pub trait LidSensor {
    fn lid_open(&self) -> bool;
}

/// Settings the case reads and the one it writes
pub trait ConfigStore {
    /// Seconds between status exchanges with the lid closed
    fn status_time_closed(&self) -> u32;

    /// Seconds between status exchanges with the lid open (0 disables)
    fn status_time_open(&self) -> u32;

    fn shipping_mode(&self) -> bool;
    fn set_shipping_mode(&mut self, enabled: bool);
}

/// CLI client waiting for a command result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandSource {
    Uart,
    Usb,
}

/// Sink for command result lines
pub trait CommandOutput {
    fn report(&mut self, source: CommandSource, line: &str);
}

/// Free-running scheduler tick counter
pub trait Clock {
    fn ticks(&self) -> u32;
}

/// Everything the case session layer needs from the board
pub trait Platform:
    PowerControl + BatteryMonitor + ChargerMonitor + LidSensor + ConfigStore + CommandOutput + Clock
{
}

impl<T> Platform for T where
    T: PowerControl + BatteryMonitor + ChargerMonitor + LidSensor + ConfigStore + CommandOutput + Clock
{
}
