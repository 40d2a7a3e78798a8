//! Command entry points used by the UART and USB command line interfaces.
//!
//! Every text line a command produces goes back through
//! [`CommandOutput::report`] to the source that issued it. Commands whose
//! result arrives later return [`Completion::Pending`] and report from the
//! session state machine.

use super::{report, Case, CaseState, LoopbackRequest, CASE_BATTERY_UNKNOWN};
use crate::earbud::Earbud;
use crate::traits::{CommandSource, Platform, Transport};

/// How a successful command finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    /// Finished; the caller prints OK
    Done,
    /// The result line follows once the earbuds have answered
    Pending,
}

/// Reasons a command is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// This board has no charger comms
    CommsDisabled,
    /// Another command is still waiting for its result
    Busy,
    /// A firmware update is about to start
    DfuPlanned,
    /// Only allowed with the lid closed
    LidOpen,
    /// Both earbuds must be in the case
    EarbudsAbsent,
    InvalidArgument,
}

type CommandResult = Result<Completion, CommandError>;

impl<T: Transport, P: Platform> Case<T, P> {
    fn require_comms(&self) -> Result<(), CommandError> {
        if self.comms_enabled {
            Ok(())
        } else {
            Err(CommandError::CommsDisabled)
        }
    }

    /// Attach `source` to both earbuds, if neither is already reporting
    fn set_cmd_source(&mut self, source: CommandSource) -> Result<(), CommandError> {
        if self.earbuds.iter().any(|s| s.cmd_source.is_some()) {
            return Err(CommandError::Busy);
        }
        for s in self.earbuds.iter_mut() {
            s.cmd_source = Some(source);
        }
        Ok(())
    }

    pub(super) fn clear_cmd_source(&mut self) {
        for s in self.earbuds.iter_mut() {
            s.cmd_source = None;
        }
    }

    /// Present/battery table plus lid state
    pub fn cmd_info(&mut self, source: CommandSource) -> CommandResult {
        self.require_comms()?;
        let out = Some(source);

        report(&mut self.platform, out, format_args!("Earbud  Present  Battery"));
        for earbud in Earbud::ALL {
            let s = &self.earbuds[earbud.index()];
            report(
                &mut self.platform,
                out,
                format_args!(
                    "{:<6}  {:<7}  {}",
                    earbud.letter(),
                    if s.present { "Yes" } else { "No" },
                    s.battery
                ),
            );
        }
        report(&mut self.platform, out, format_args!(""));

        if self.lid_now {
            report(&mut self.platform, out, format_args!("Lid : Open ({}s)", self.lid_open_time));
        } else {
            report(&mut self.platform, out, format_args!("Lid : Closed"));
        }
        report(
            &mut self.platform,
            out,
            format_args!("Next status in {} seconds", self.status_countdown),
        );

        Ok(Completion::Done)
    }

    /// Status exchange with the case battery level shown on the LEDs
    pub fn cmd_status(&mut self, _source: CommandSource) -> CommandResult {
        self.require_comms()?;
        self.start_status_sequence(true);
        Ok(Completion::Done)
    }

    /// Earbud status
    ///
    /// With a target, requests extended status `info_type` from one earbud.
    /// Without one, runs a status exchange with both and reports each
    /// battery level.
    pub fn cmd_ebstatus(&mut self, source: CommandSource, target: Option<(Earbud, u8)>) -> CommandResult {
        self.require_comms()?;

        match target {
            Some((earbud, info_type)) => {
                let s = &mut self.earbuds[earbud.index()];
                if s.cmd_source.is_some() {
                    return Err(CommandError::Busy);
                }
                s.cmd_source = Some(source);
                s.xstatus_wanted = true;
                s.info_type = info_type;
                self.wake(earbud);
            }
            None => {
                self.set_cmd_source(source)?;
                self.start_status_sequence(false);
            }
        }

        Ok(Completion::Done)
    }

    /// Factory reset one earbud
    pub fn cmd_reset(&mut self, _source: CommandSource, earbud: Earbud) -> CommandResult {
        self.require_comms()?;
        if self.dfu_planned {
            return Err(CommandError::DfuPlanned);
        }

        self.earbuds[earbud.index()].reset_wanted = true;
        self.wake(earbud);
        Ok(Completion::Done)
    }

    /// Echo test against one earbud
    pub fn cmd_loopback(
        &mut self,
        source: CommandSource,
        earbud: Earbud,
        request: LoopbackRequest<'_>,
    ) -> CommandResult {
        self.require_comms()?;

        let now = self.platform.ticks();
        let s = &mut self.earbuds[earbud.index()];
        if s.cmd_source.is_some() {
            return Err(CommandError::Busy);
        }
        s.loopback.configure(&request, now)?;
        s.loopback_wanted = true;
        s.cmd_source = Some(source);
        self.wake(earbud);

        Ok(Completion::Done)
    }

    /// Put the case and both earbuds into shipping mode
    pub fn cmd_ship(&mut self, source: CommandSource) -> CommandResult {
        if self.lid_now {
            return Err(CommandError::LidOpen);
        }

        if !self.comms_enabled {
            // Nothing to negotiate with
            self.enter_shipping_mode();
            return Ok(Completion::Done);
        }

        if !self.earbuds.iter().all(|s| s.present) {
            return Err(CommandError::EarbudsAbsent);
        }
        self.set_cmd_source(source)?;
        for earbud in Earbud::ALL {
            self.earbuds[earbud.index()].ship_wanted = true;
            self.wake(earbud);
        }

        Ok(Completion::Pending)
    }

    /// Lid sensor state as 1 (open) or 0
    pub fn cmd_lid(&mut self, source: CommandSource) -> CommandResult {
        let open = self.platform.lid_open();
        report(&mut self.platform, Some(source), format_args!("{}", open as u8));
        Ok(Completion::Done)
    }

    /// True if no earbud session is active; DFU is treated as planned either way
    pub fn allow_dfu(&mut self) -> bool {
        self.dfu_planned = true;
        self.earbuds.iter().all(|s| s.state == CaseState::Idle)
    }

    pub fn dfu_finished(&mut self) {
        self.dfu_planned = false;
    }

    /// Battery level last reported by `earbud`, if known
    pub fn earbud_battery(&self, earbud: Earbud) -> Option<u8> {
        match self.earbuds[earbud.index()].battery {
            CASE_BATTERY_UNKNOWN => None,
            level => Some(level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::testing::{case_with, run_until, step};
    use crate::fake_earbud::FakeEarbud;
    use crate::power::{RunReason, StandbyReason};

    #[test]
    fn test_info_table() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::absent());
        case.cmd_status(CommandSource::Uart).unwrap();
        run_until(&mut case, 500, |c| c.is_idle() && !c.ccp().wire().is_broadcasting());

        case.platform_mut().lines.clear();
        assert_eq!(case.cmd_info(CommandSource::Usb), Ok(Completion::Done));
        let p = case.platform();
        assert_eq!(p.line(0), Some("Earbud  Present  Battery"));
        assert_eq!(p.line(1), Some("L       Yes      33"));
        assert_eq!(p.line(2), Some("R       No       255"));
        assert_eq!(p.line(4), Some("Lid : Closed"));
        assert!(p.lines.iter().all(|(s, _)| *s == CommandSource::Usb));
    }

    #[test]
    fn test_ebstatus_reports_both_earbuds() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        assert_eq!(case.cmd_ebstatus(CommandSource::Uart, None), Ok(Completion::Done));
        assert_eq!(
            case.cmd_ebstatus(CommandSource::Usb, None),
            Err(CommandError::Busy)
        );

        run_until(&mut case, 500, |c| c.platform().has_line("EBSTATUS (R): 43"));
        assert!(case.platform().has_line("EBSTATUS (L): 33"));
    }

    #[test]
    fn test_ebstatus_extended_reports_address() {
        let mut left = FakeEarbud::new(0x21);
        left.bt_address.nap = 0x0002;
        left.bt_address.uap = 0x5B;
        left.bt_address.lap = 0x00EB21;
        let mut case = case_with(left, FakeEarbud::new(0x2B));

        case.cmd_ebstatus(CommandSource::Uart, Some((Earbud::Left, 0)))
            .unwrap();
        run_until(&mut case, 500, |c| c.platform().has_line("EBSTATUS (L): 0002,5B,00EB21"));
    }

    #[test]
    fn test_ebstatus_extended_failure_reported() {
        let mut case = case_with(FakeEarbud::absent(), FakeEarbud::new(0x2B));

        case.cmd_ebstatus(CommandSource::Uart, Some((Earbud::Left, 0)))
            .unwrap();
        run_until(&mut case, 500, |c| c.platform().has_line("EBSTATUS (L): Failed"));
        run_until(&mut case, 10, |c| c.state(Earbud::Left) == CaseState::Idle);
    }

    #[test]
    fn test_reset_refused_during_dfu() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        run_until(&mut case, 500, |c| c.is_idle() && !c.ccp().wire().is_broadcasting());

        assert!(case.allow_dfu());
        assert_eq!(
            case.cmd_reset(CommandSource::Uart, Earbud::Left),
            Err(CommandError::DfuPlanned)
        );

        // Status sequences are suppressed too
        case.cmd_status(CommandSource::Uart).unwrap();
        step(&mut case);
        assert!(case.is_idle());

        case.dfu_finished();
        case.cmd_reset(CommandSource::Uart, Earbud::Left).unwrap();
        assert_eq!(case.state(Earbud::Left), CaseState::Alert);
        assert!(!case.allow_dfu());
    }

    #[test]
    fn test_loopback_with_rate_report() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        let request = LoopbackRequest {
            iterations: 3,
            ..Default::default()
        };
        case.cmd_loopback(CommandSource::Usb, Earbud::Right, request)
            .unwrap();
        assert_eq!(
            case.cmd_loopback(CommandSource::Usb, Earbud::Right, request),
            Err(CommandError::Busy)
        );

        run_until(&mut case, 1000, |c| {
            c.platform().lines.iter().any(|(_, l)| l.starts_with("LOOPBACK (R): Data rate"))
        });
        let oks = case
            .platform()
            .lines
            .iter()
            .filter(|(_, l)| l.as_str() == "LOOPBACK (R): OK")
            .count();
        assert_eq!(oks, 3);
        assert!(case
            .platform()
            .lines
            .iter()
            .any(|(_, l)| l.ends_with("NACKs = 0")));
        assert!(!case.platform().has_line("LOOPBACK (R): Failed"));
    }

    #[test]
    fn test_loopback_with_caller_data() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        let request = LoopbackRequest {
            iterations: 0,
            len: Some(6),
            data: Some(&[0xAB, 0xCD]),
        };
        case.cmd_loopback(CommandSource::Uart, Earbud::Left, request)
            .unwrap();
        run_until(&mut case, 500, |c| c.platform().has_line("LOOPBACK (L): OK"));
        run_until(&mut case, 10, |c| c.state(Earbud::Left) == CaseState::Idle);
        assert!(!case.platform().lines.iter().any(|(_, l)| l.contains("Data rate")));
    }

    #[test]
    fn test_ship_preconditions() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        // Presence is unknown until the first exchange
        assert_eq!(
            case.cmd_ship(CommandSource::Uart),
            Err(CommandError::EarbudsAbsent)
        );

        case.platform_mut().lid = true;
        case.event_occurred();
        step(&mut case);
        assert_eq!(case.cmd_ship(CommandSource::Uart), Err(CommandError::LidOpen));
    }

    #[test]
    fn test_ship_accepted_by_both() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::new(0x2B));
        case.cmd_status(CommandSource::Uart).unwrap();
        run_until(&mut case, 500, |c| c.is_idle() && !c.ccp().wire().is_broadcasting());

        assert_eq!(case.cmd_ship(CommandSource::Usb), Ok(Completion::Pending));
        run_until(&mut case, 500, |c| c.platform().has_line("OK"));

        let p = case.platform();
        assert!(p.has_line("Shipping mode (L)"));
        assert!(p.has_line("Shipping mode (R)"));
        assert!(p.config.shipping_mode);
        assert!(p.power.has_standby_reason(StandbyReason::ShippingMode));
        assert!(case.is_idle());
        assert!(!p.power.has_run_reason(RunReason::StatusLeft));
        assert!(!p.power.has_run_reason(RunReason::StatusRight));
    }

    #[test]
    fn test_ship_rejected_by_one() {
        let mut right = FakeEarbud::new(0x2B);
        right.accept_shipping = false;
        let mut case = case_with(FakeEarbud::new(0x21), right);
        case.cmd_status(CommandSource::Uart).unwrap();
        run_until(&mut case, 500, |c| c.is_idle() && !c.ccp().wire().is_broadcasting());

        case.cmd_ship(CommandSource::Usb).unwrap();
        run_until(&mut case, 500, |c| c.platform().has_line("ERROR"));

        assert_eq!(case.state(Earbud::Left), CaseState::Alert);
        assert_eq!(case.state(Earbud::Right), CaseState::Alert);
        let p = case.platform();
        assert!(!p.config.shipping_mode);
        assert!(!p.power.has_standby_reason(StandbyReason::ShippingMode));

        // Sources were released, so another command may report
        assert_eq!(case.cmd_ebstatus(CommandSource::Uart, None), Ok(Completion::Done));
    }

    #[test]
    fn test_lid_query() {
        let mut case = case_with(FakeEarbud::absent(), FakeEarbud::absent());
        case.platform_mut().lid = true;
        case.cmd_lid(CommandSource::Uart).unwrap();
        assert!(case.platform().has_line("1"));
    }

    #[test]
    fn test_earbud_battery_unknown_until_reported() {
        let mut case = case_with(FakeEarbud::new(0x21), FakeEarbud::absent());
        assert_eq!(case.earbud_battery(Earbud::Left), None);
        case.cmd_status(CommandSource::Uart).unwrap();
        run_until(&mut case, 500, |c| c.earbud_battery(Earbud::Left).is_some());
        assert_eq!(case.earbud_battery(Earbud::Left), Some(0x21));
        assert_eq!(case.earbud_battery(Earbud::Right), None);
    }
}
