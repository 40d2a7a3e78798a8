//! # Run Reasons and Wake Locks
//!
//! The MCU sleeps between ticks unless some component holds a run reason.
//! Each component that needs the MCU awake owns a [`WakeLock`] for its
//! reason; acquire and release are idempotent so a reason is set once and
//! cleared once no matter how many paths reach them.
//!
//! ```text
//!   run reason set?  ── yes ──► RUN
//!        │ no
//!   standby reason?  ── yes ──► STANDBY (shipping mode)
//!        │ no
//!   stop reason?     ── yes ──► STOP
//!        │ no
//!        ▼
//!      SLEEP
//! ```

use crate::traits::PowerControl;

/// Reasons to keep the MCU running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RunReason {
    /// A lid or charger event is waiting to be handled
    CaseEvent = 0,
    /// Left earbud session is not idle
    StatusLeft = 1,
    /// Right earbud session is not idle
    StatusRight = 2,
    /// A broadcast is being repeated on the link
    Broadcast = 3,
    /// Lid held open while in shipping mode
    Ship = 4,
}

impl RunReason {
    pub const fn bit(self) -> u16 {
        1 << self as u8
    }
}

/// Reasons to use STOP rather than SLEEP when idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StopReason {
    RunTime = 0,
    CaseEmpty = 1,
    FullyCharged = 2,
}

impl StopReason {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Reasons to enter STANDBY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StandbyReason {
    ShippingMode = 0,
}

impl StandbyReason {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Named token for one run reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeLock {
    reason: RunReason,
    held: bool,
}

impl WakeLock {
    pub const fn new(reason: RunReason) -> Self {
        Self { reason, held: false }
    }

    /// Set the run reason unless this lock already holds it
    pub fn acquire<P: PowerControl + ?Sized>(&mut self, power: &mut P) {
        if !self.held {
            self.held = true;
            power.set_run_reason(self.reason);
        }
    }

    /// Clear the run reason if this lock holds it
    pub fn release<P: PowerControl + ?Sized>(&mut self, power: &mut P) {
        if self.held {
            self.held = false;
            power.clear_run_reason(self.reason);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn reason(&self) -> RunReason {
        self.reason
    }
}

/// Low-power mode the reason masks resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerMode {
    Run,
    Sleep,
    Stop,
    Standby,
}

/// Bitmask model of the power manager's reason registers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PowerReasons {
    run: u16,
    stop: u8,
    standby: u8,
}

impl PowerReasons {
    pub const fn new() -> Self {
        Self { run: 0, stop: 0, standby: 0 }
    }

    pub fn has_run_reason(&self, reason: RunReason) -> bool {
        self.run & reason.bit() != 0
    }

    pub fn has_stop_reason(&self, reason: StopReason) -> bool {
        self.stop & reason.bit() != 0
    }

    pub fn has_standby_reason(&self, reason: StandbyReason) -> bool {
        self.standby & reason.bit() != 0
    }

    /// True while any run reason is set
    pub fn is_running(&self) -> bool {
        self.run != 0
    }

    pub fn mode(&self) -> PowerMode {
        if self.standby != 0 {
            PowerMode::Standby
        } else if self.run != 0 {
            PowerMode::Run
        } else if self.stop != 0 {
            PowerMode::Stop
        } else {
            PowerMode::Sleep
        }
    }
}

impl PowerControl for PowerReasons {
    fn set_run_reason(&mut self, reason: RunReason) {
        self.run |= reason.bit();
    }

    fn clear_run_reason(&mut self, reason: RunReason) {
        self.run &= !reason.bit();
    }

    fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop |= reason.bit();
    }

    fn clear_stop_reason(&mut self, reason: StopReason) {
        self.stop &= !reason.bit();
    }

    fn set_standby_reason(&mut self, reason: StandbyReason) {
        self.standby |= reason.bit();
    }

    fn clear_standby_reason(&mut self, reason: StandbyReason) {
        self.standby &= !reason.bit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_lock_is_idempotent() {
        let mut power = PowerReasons::new();
        let mut lock = WakeLock::new(RunReason::Broadcast);
        let mut other = WakeLock::new(RunReason::StatusLeft);

        lock.acquire(&mut power);
        lock.acquire(&mut power);
        other.acquire(&mut power);
        assert!(power.has_run_reason(RunReason::Broadcast));

        lock.release(&mut power);
        assert!(!power.has_run_reason(RunReason::Broadcast));
        assert!(power.has_run_reason(RunReason::StatusLeft));

        // A second release must not disturb a reason set by someone else
        power.set_run_reason(RunReason::Broadcast);
        lock.release(&mut power);
        assert!(power.has_run_reason(RunReason::Broadcast));
    }

    #[test]
    fn test_power_mode_priority() {
        let mut power = PowerReasons::new();
        assert_eq!(power.mode(), PowerMode::Sleep);

        power.set_stop_reason(StopReason::RunTime);
        assert_eq!(power.mode(), PowerMode::Stop);

        power.set_run_reason(RunReason::CaseEvent);
        assert_eq!(power.mode(), PowerMode::Run);

        power.set_standby_reason(StandbyReason::ShippingMode);
        assert_eq!(power.mode(), PowerMode::Standby);

        power.clear_standby_reason(StandbyReason::ShippingMode);
        power.clear_run_reason(RunReason::CaseEvent);
        power.clear_stop_reason(StopReason::RunTime);
        assert_eq!(power, PowerReasons::new());
    }
}
