//! # Case Session Layer
//!
//! One state machine per earbud, plus the case-wide logic that decides when
//! to talk to them: lid and charger events, the periodic status countdown,
//! power-mode hints and shipping mode.
//!
//! ## Earbud Session States
//!
//! ```text
//!                    ┌──────────────── nothing wanted ─────────────┐
//!                    ▼                                             │
//!   IDLE ── wanted ──► ALERT ──► SENT_SHIPPING_MODE ──► SHIPPING_DONE
//!                      ▲   │
//!                      │   ├──► SENT_STATUS_REQUEST ──► STATUS_BROADCAST
//!                      │   ├──► SENT_XSTATUS_REQUEST
//!                      │   ├──► SENT_RESET ──► RESET_DELAY ◄─► RESETTING
//!                      │   └──► SENT_LOOPBACK
//!                      │
//!                      └── abort / give up / done
//! ```
//!
//! ALERT dispatches one wanted operation per periodic, in priority order:
//! ship, status, extended status, reset, loopback.
//!
//! A session holds its run reason for as long as it is out of IDLE.

mod commands;
mod loopback;

#[cfg(test)]
pub(crate) mod testing;

use core::fmt::{self, Write};

use heapless::String;
use log::{debug, info, trace};

use crate::ccp::{BtAddress, CaseStatus, Ccp, CcpEvents, CcpError, EarbudReport};
use crate::earbud::{Earbud, NO_OF_EARBUDS};
use crate::power::{RunReason, StandbyReason, StopReason, WakeLock};
use crate::traits::{CommandOutput, CommandSource, Platform, PowerControl, Transport};

pub use commands::{CommandError, Completion};
pub use loopback::{loopback_data_rate, LoopbackRequest};

use loopback::{LoopbackData, LoopbackTest};

/// Periodics to wait after a reset is acknowledged before polling the earbud
pub const CASE_RESET_DELAY_TIME: u16 = 100;

/// Status requests sent to a resetting earbud before giving up on it
pub const CASE_RESET_POLLS: u8 = 3;

/// Below this case battery level the earbuds are told to charge slowly
pub const CASE_LOW_BATTERY_THRESHOLD: u8 = 10;

/// Earbud battery level considered fully charged
pub const CASE_HIGH_BATTERY_THRESHOLD: u8 = 100;

/// Seed for generated loopback payloads
pub const CASE_LOOPBACK_SEED: u64 = 1234;

/// Periodics the lid must stay open to leave shipping mode
pub const CASE_SHIPPING_TIME: u8 = 25;

/// Seconds of running before STOP is preferred over SLEEP
pub const CASE_RUN_TIME_BEFORE_STOP: u32 = 30;

/// Seconds after which an open lid counts as "open for a long time"
pub const CASE_STATUS_MAX_OPEN_TIME: u16 = 600;

/// Status interval with the lid closed and both earbuds fully charged
pub const CASE_STATUS_TIME_CHARGED: u32 = 86400;

/// Battery level placeholder until an earbud reports
pub const CASE_BATTERY_UNKNOWN: u8 = 0xFF;

/// Below this draw an earbud that does not answer is taken to be absent
pub const CASE_EARBUD_MINIMUM_CURRENT_MA: u32 = 10;

/// Per-earbud session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CaseState {
    Idle,
    Alert,
    SentStatusRequest,
    StatusBroadcast,
    SentReset,
    ResetDelay,
    Resetting,
    SentLoopback,
    SentShippingMode,
    SentXstatusRequest,
    ShippingDone,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Status,
    Xstatus(u8),
    Reset,
    Loopback,
    Shipping,
}

struct EarbudSession {
    earbud: Earbud,
    state: CaseState,
    state_time: u16,
    status_wanted: bool,
    xstatus_wanted: bool,
    reset_wanted: bool,
    loopback_wanted: bool,
    ship_wanted: bool,
    /// A real answer arrived for the current request
    valid: bool,
    present_pin: bool,
    charge_rate: bool,
    battery: u8,
    charging: bool,
    info_type: u8,
    ack: bool,
    give_up: bool,
    abort: bool,
    present: bool,
    cmd_source: Option<CommandSource>,
    reset_poll_attempts: u8,
    loopback: LoopbackTest,
    lock: WakeLock,
}

impl EarbudSession {
    fn new(earbud: Earbud) -> Self {
        let reason = match earbud {
            Earbud::Left => RunReason::StatusLeft,
            Earbud::Right => RunReason::StatusRight,
        };

        Self {
            earbud,
            state: CaseState::Idle,
            state_time: 0,
            status_wanted: false,
            xstatus_wanted: false,
            reset_wanted: false,
            loopback_wanted: false,
            ship_wanted: false,
            valid: false,
            present_pin: false,
            charge_rate: false,
            battery: CASE_BATTERY_UNKNOWN,
            charging: false,
            info_type: 0,
            ack: false,
            give_up: false,
            abort: false,
            present: false,
            cmd_source: None,
            reset_poll_attempts: 0,
            loopback: LoopbackTest::default(),
            lock: WakeLock::new(reason),
        }
    }

    fn new_state<P: PowerControl>(&mut self, power: &mut P, state: CaseState) {
        trace!("Case ({}): {:?} -> {:?}", self.earbud.letter(), self.state, state);

        if state == CaseState::Idle {
            self.lock.release(power);
        } else {
            self.lock.acquire(power);
        }
        self.state = state;
        self.state_time = 0;
    }
}

/// Send one formatted line to `source`, if a command is waiting for it
fn report<P: CommandOutput>(platform: &mut P, source: Option<CommandSource>, args: fmt::Arguments<'_>) {
    let Some(source) = source else {
        return;
    };
    let mut line: String<64> = String::new();
    // Overlong lines are cut short
    let _ = line.write_fmt(args);
    platform.report(source, &line);
}

/// CCP notifications folded into the session flags
struct Notifier<'a, P: Platform> {
    earbuds: &'a mut [EarbudSession; NO_OF_EARBUDS],
    platform: &'a mut P,
    broadcast_lock: &'a mut WakeLock,
}

impl<P: Platform> CcpEvents for Notifier<'_, P> {
    fn rx_earbud_status(&mut self, earbud: Earbud, status: EarbudReport) {
        let s = &mut self.earbuds[earbud.index()];
        report(
            self.platform,
            s.cmd_source,
            format_args!("EBSTATUS ({}): {}", earbud.letter(), status.battery),
        );

        s.valid = true;
        s.present_pin = status.present_pin;
        s.charge_rate = status.charge_rate;
        s.battery = status.battery;
        s.charging = status.charging;
        s.present = true;
    }

    fn rx_bt_address(&mut self, earbud: Earbud, address: BtAddress) {
        let s = &mut self.earbuds[earbud.index()];
        report(
            self.platform,
            s.cmd_source,
            format_args!(
                "EBSTATUS ({}): {:04X},{:02X},{:06X}",
                earbud.letter(),
                address.nap,
                address.uap,
                address.lap
            ),
        );

        s.valid = true;
        s.present = true;
    }

    fn ack(&mut self, earbud: Earbud) {
        let s = &mut self.earbuds[earbud.index()];
        s.ack = true;
        s.present = true;
    }

    fn nack(&mut self, earbud: Earbud) {
        let s = &mut self.earbuds[earbud.index()];
        s.loopback.nack_count = s.loopback.nack_count.saturating_add(1);
        s.present = true;
    }

    fn give_up(&mut self, earbud: Earbud) {
        info!("Give up ({})", earbud.letter());
        let s = &mut self.earbuds[earbud.index()];
        s.give_up = true;
        s.present = true;
    }

    fn no_response(&mut self, earbud: Earbud) {
        info!("No response ({})", earbud.letter());
        let s = &mut self.earbuds[earbud.index()];
        s.give_up = true;
        s.present = false;
    }

    fn abort(&mut self, earbud: Earbud) {
        info!("Abort ({})", earbud.letter());
        self.earbuds[earbud.index()].abort = true;
    }

    fn broadcast_finished(&mut self) {
        self.broadcast_lock.release(self.platform);
    }

    fn loopback(&mut self, earbud: Earbud, data: &[u8]) {
        let s = &mut self.earbuds[earbud.index()];
        let ok = s.loopback.matches(data);
        report(
            self.platform,
            s.cmd_source,
            format_args!("LOOPBACK ({}): {}", earbud.letter(), if ok { "OK" } else { "ERROR" }),
        );

        s.valid = true;
        s.present = true;
    }

    fn shipping(&mut self, earbud: Earbud, accepted: bool) {
        let s = &mut self.earbuds[earbud.index()];
        if accepted {
            s.valid = true;
        } else {
            s.give_up = true;
        }
    }
}

/// The case: both earbud sessions over the CCP stack, plus the board
pub struct Case<T: Transport, P: Platform> {
    ccp: Ccp<T>,
    platform: P,
    earbuds: [EarbudSession; NO_OF_EARBUDS],
    event_lock: WakeLock,
    broadcast_lock: WakeLock,
    ship_lock: WakeLock,
    lid_now: bool,
    lid_before: bool,
    chg_now: bool,
    chg_before: bool,
    event: bool,
    dfu_planned: bool,
    status_on_timer: bool,
    lid_open_time: u16,
    status_countdown: u32,
    in_shipping_mode: bool,
    shipping_lid_open_count: u8,
    run_time: u32,
    stop_set: bool,
    comms_enabled: bool,
}

impl<T: Transport, P: Platform> Case<T, P> {
    pub fn new(transport: T, platform: P) -> Self {
        Self {
            ccp: Ccp::new(transport),
            platform,
            earbuds: [EarbudSession::new(Earbud::Left), EarbudSession::new(Earbud::Right)],
            event_lock: WakeLock::new(RunReason::CaseEvent),
            broadcast_lock: WakeLock::new(RunReason::Broadcast),
            ship_lock: WakeLock::new(RunReason::Ship),
            lid_now: false,
            lid_before: false,
            chg_now: false,
            chg_before: false,
            event: true,
            dfu_planned: false,
            status_on_timer: false,
            lid_open_time: 0,
            status_countdown: 0,
            in_shipping_mode: false,
            shipping_lid_open_count: 0,
            run_time: 0,
            stop_set: false,
            comms_enabled: false,
        }
    }

    /// Power-up: stay in shipping mode if it was stored, otherwise start comms
    pub fn init(&mut self) {
        for s in self.earbuds.iter_mut() {
            s.battery = CASE_BATTERY_UNKNOWN;
            s.cmd_source = None;
        }

        // Status exchange on the first tick
        self.status_countdown = 0;

        if self.platform.shipping_mode() {
            info!("Shipping mode");
            self.in_shipping_mode = true;
            self.platform.set_standby_reason(StandbyReason::ShippingMode);
        } else {
            self.start();
        }
    }

    fn start(&mut self) {
        self.in_shipping_mode = false;

        // Variant A boards without current senses have no charger comms
        self.comms_enabled = !cfg!(feature = "scheme-a") || self.platform.current_senses_present();
        if self.comms_enabled {
            self.ccp.reset();
            self.broadcast_lock.release(&mut self.platform);
        } else {
            info!("Charger comms disabled");
        }

        self.status_on_timer = true;
        self.event_occurred();
        self.platform.read_request(false);
    }

    /// Lid or charger state may have changed
    pub fn event_occurred(&mut self) {
        self.event_lock.acquire(&mut self.platform);
        self.event = true;
    }

    /// Feed one byte received from the charger comms link
    pub fn receive(&mut self, byte: u8) {
        self.ccp.receive(byte);
    }

    fn comms(&mut self) -> (&mut Ccp<T>, Notifier<'_, P>) {
        (
            &mut self.ccp,
            Notifier {
                earbuds: &mut self.earbuds,
                platform: &mut self.platform,
                broadcast_lock: &mut self.broadcast_lock,
            },
        )
    }

    fn set_state(&mut self, earbud: Earbud, state: CaseState) {
        self.earbuds[earbud.index()].new_state(&mut self.platform, state);
    }

    /// Move an idle session to ALERT so its wanted flags are looked at
    fn wake(&mut self, earbud: Earbud) {
        if self.earbuds[earbud.index()].state == CaseState::Idle {
            self.set_state(earbud, CaseState::Alert);
        }
    }

    fn schedule_next_status(&mut self, seconds: u32) {
        if seconds > 0 {
            self.status_on_timer = true;
            self.status_countdown = seconds;
        } else {
            self.status_on_timer = false;
        }
    }

    /// Measure the case battery and exchange status with both earbuds
    pub fn start_status_sequence(&mut self, led: bool) {
        if self.dfu_planned {
            return;
        }

        self.platform.read_request(led);
        if self.comms_enabled {
            for earbud in Earbud::ALL {
                self.earbuds[earbud.index()].status_wanted = true;
                self.wake(earbud);
            }
        }
    }

    /// Once a second
    pub fn tick(&mut self) {
        self.run_time = self.run_time.saturating_add(1);
        self.status_countdown = self.status_countdown.saturating_sub(1);

        if self.lid_now {
            if self.lid_open_time < CASE_STATUS_MAX_OPEN_TIME {
                self.lid_open_time += 1;
            }
        } else {
            self.lid_open_time = 0;
        }

        if !self.status_on_timer {
            return;
        }

        if !self.stop_set && self.run_time > CASE_RUN_TIME_BEFORE_STOP {
            self.stop_set = true;
            self.platform.set_stop_reason(StopReason::RunTime);
        }

        if self.status_countdown == 0 {
            self.start_status_sequence(false);

            let seconds = if self.lid_now && self.lid_open_time >= CASE_STATUS_MAX_OPEN_TIME {
                self.platform.status_time_open()
            } else {
                self.platform.status_time_closed()
            };
            self.schedule_next_status(seconds);
        }
    }

    /// Once per scheduler tick: the comms stack, then the sessions
    pub fn periodic(&mut self) {
        if self.comms_enabled {
            let (ccp, mut notifier) = self.comms();
            ccp.periodic(&mut notifier);
        }

        for s in self.earbuds.iter_mut() {
            s.state_time = s.state_time.saturating_add(1);
        }

        if self.event {
            self.handle_event();
        } else {
            for earbud in Earbud::ALL {
                self.run_session(earbud);

                let s = &mut self.earbuds[earbud.index()];
                s.ack = false;
                s.abort = false;
                s.give_up = false;
            }
        }

        self.shipping_startup();
        self.shipping_aggregate();
    }

    fn handle_event(&mut self) {
        self.event = false;
        self.lid_now = self.platform.lid_open();
        self.chg_now = self.platform.is_connected();

        if self.lid_now {
            if !self.lid_before {
                if self.in_shipping_mode {
                    self.ship_lock.acquire(&mut self.platform);
                } else {
                    self.start_status_sequence(true);
                }

                let seconds = if self.lid_open_time < CASE_STATUS_MAX_OPEN_TIME {
                    self.platform.status_time_closed()
                } else {
                    self.platform.status_time_open()
                };
                self.schedule_next_status(seconds);
            }
        } else {
            if self.in_shipping_mode {
                self.shipping_lid_open_count = 0;
                self.ship_lock.release(&mut self.platform);
            }

            if self.lid_before {
                let seconds = self.platform.status_time_closed();
                self.schedule_next_status(seconds);
                if !self.in_shipping_mode {
                    self.start_status_sequence(true);
                }
            }

            self.lid_open_time = 0;
        }

        if self.chg_now && !self.chg_before {
            info!("Charger connected");
            self.platform.connected();
        } else if !self.chg_now && self.chg_before {
            info!("Charger disconnected");
            self.platform.disconnected();
        }

        if self.comms_enabled {
            let (lid, chg) = (self.lid_now, self.chg_now);
            let low = self.platform.percentage() < CASE_LOW_BATTERY_THRESHOLD;
            let (ccp, mut notifier) = self.comms();
            match ccp.tx_short_status(lid, chg, low, &mut notifier) {
                Ok(()) => self.broadcast_lock.acquire(&mut self.platform),
                Err(e) => {
                    trace!("Short status deferred: {:?}", e);
                    self.event = true;
                }
            }
        }

        self.lid_before = self.lid_now;
        self.chg_before = self.chg_now;

        // Another event may have arrived meanwhile
        if !self.event {
            self.event_lock.release(&mut self.platform);
        }
    }

    fn request(&mut self, earbud: Earbud, request: Request) -> Result<(), CcpError> {
        let payload = match request {
            Request::Loopback => self.earbuds[earbud.index()].loopback.next_payload(),
            _ => LoopbackData::new(),
        };

        let (ccp, mut n) = self.comms();
        let sent = match request {
            Request::Status => ccp.tx_status_request(earbud, &mut n),
            Request::Xstatus(info_type) => ccp.tx_xstatus_request(earbud, info_type, &mut n),
            Request::Reset => ccp.tx_reset(earbud, true, &mut n),
            Request::Loopback => ccp.tx_loopback(earbud, &payload, &mut n),
            Request::Shipping => ccp.tx_shipping_mode(earbud, &mut n),
        };

        if let Err(e) = sent {
            trace!("{:?} deferred ({}): {:?}", request, earbud.letter(), e);
        }
        sent
    }

    fn run_session(&mut self, earbud: Earbud) {
        let i = earbud.index();

        match self.earbuds[i].state {
            CaseState::Idle | CaseState::ShippingDone => {}

            CaseState::Alert => {
                let s = &mut self.earbuds[i];
                if s.ship_wanted {
                    if self.request(earbud, Request::Shipping).is_ok() {
                        self.earbuds[i].valid = false;
                        self.set_state(earbud, CaseState::SentShippingMode);
                    }
                } else if s.status_wanted {
                    s.valid = false;
                    s.battery = CASE_BATTERY_UNKNOWN;
                    if self.request(earbud, Request::Status).is_ok() {
                        self.set_state(earbud, CaseState::SentStatusRequest);
                    }
                } else if s.xstatus_wanted {
                    s.valid = false;
                    let info_type = s.info_type;
                    if self.request(earbud, Request::Xstatus(info_type)).is_ok() {
                        self.set_state(earbud, CaseState::SentXstatusRequest);
                    }
                } else if s.reset_wanted {
                    if self.request(earbud, Request::Reset).is_ok() {
                        self.set_state(earbud, CaseState::SentReset);
                    }
                } else if s.loopback_wanted {
                    s.valid = false;
                    if self.request(earbud, Request::Loopback).is_ok() {
                        self.set_state(earbud, CaseState::SentLoopback);
                    }
                } else {
                    self.set_state(earbud, CaseState::Idle);
                }
            }

            CaseState::SentReset => {
                let s = &mut self.earbuds[i];
                if s.ack {
                    // Accepted; whatever we knew about the earbud is stale
                    s.valid = false;
                    s.battery = CASE_BATTERY_UNKNOWN;
                    s.reset_poll_attempts = 0;
                    self.set_state(earbud, CaseState::ResetDelay);
                } else if s.abort {
                    self.set_state(earbud, CaseState::Alert);
                } else if s.give_up {
                    self.end_reset(earbud);
                }
            }

            CaseState::ResetDelay => {
                if self.earbuds[i].state_time > CASE_RESET_DELAY_TIME
                    && self.request(earbud, Request::Status).is_ok()
                {
                    self.set_state(earbud, CaseState::Resetting);
                }
            }

            CaseState::Resetting => {
                let s = &mut self.earbuds[i];
                if s.valid {
                    self.end_reset(earbud);
                } else if s.give_up {
                    s.reset_poll_attempts += 1;
                    if s.reset_poll_attempts >= CASE_RESET_POLLS {
                        self.end_reset(earbud);
                    } else {
                        self.set_state(earbud, CaseState::ResetDelay);
                    }
                } else if s.abort {
                    self.set_state(earbud, CaseState::ResetDelay);
                }
            }

            CaseState::SentStatusRequest => {
                let s = &self.earbuds[i];
                if s.valid {
                    self.end_status(earbud, true);
                } else if s.give_up {
                    self.end_status(earbud, false);
                } else if s.abort {
                    self.set_state(earbud, CaseState::Alert);
                }
            }

            CaseState::SentXstatusRequest => {
                let s = &self.earbuds[i];
                if s.valid {
                    self.end_xstatus(earbud, true);
                } else if s.give_up {
                    self.end_xstatus(earbud, false);
                } else if s.abort {
                    self.set_state(earbud, CaseState::Alert);
                }
            }

            CaseState::StatusBroadcast => {
                if self.platform.read_done() {
                    self.broadcast_status(earbud);
                }
            }

            CaseState::SentLoopback => {
                let s = &mut self.earbuds[i];
                if s.valid {
                    s.loopback.count += 1;
                    if s.loopback.count >= s.loopback.iterations {
                        self.end_loopback(earbud, true);
                    } else {
                        s.valid = false;
                        if self.request(earbud, Request::Loopback).is_err() {
                            self.set_state(earbud, CaseState::Alert);
                        }
                    }
                } else if s.give_up {
                    // Ends a repeated run as well
                    self.end_loopback(earbud, false);
                } else if s.abort {
                    self.set_state(earbud, CaseState::Alert);
                }
            }

            CaseState::SentShippingMode => {
                let s = &self.earbuds[i];
                if s.valid {
                    report(
                        &mut self.platform,
                        s.cmd_source,
                        format_args!("Shipping mode ({})", earbud.letter()),
                    );
                    self.set_state(earbud, CaseState::ShippingDone);
                } else if s.give_up {
                    self.set_state(earbud, CaseState::ShippingDone);
                } else if s.abort {
                    self.set_state(earbud, CaseState::Alert);
                }
            }
        }
    }

    fn broadcast_status(&mut self, earbud: Earbud) {
        let battery = self.platform.percentage();
        let [left, right] = &self.earbuds;
        let status = CaseStatus {
            lid_open: self.lid_now,
            charger_connected: self.chg_now,
            charging: self.platform.is_charging(),
            charge_rate: battery < CASE_LOW_BATTERY_THRESHOLD,
            battery,
            left_battery: left.battery,
            right_battery: right.battery,
            left_charging: left.charging,
            right_charging: right.charging,
        };

        let (ccp, mut notifier) = self.comms();
        if ccp.tx_status(&status, &mut notifier).is_ok() {
            self.broadcast_lock.acquire(&mut self.platform);
            self.set_state(earbud, CaseState::Alert);
        }
    }

    fn all_charged(&self) -> bool {
        self.earbuds.iter().all(|s| {
            s.present && s.battery != CASE_BATTERY_UNKNOWN && s.battery >= CASE_HIGH_BATTERY_THRESHOLD
        })
    }

    /// True if nothing answered and nothing draws current from the case
    fn looks_empty(&mut self) -> bool {
        if self.earbuds.iter().any(|s| s.present) {
            return false;
        }
        match self.platform.earbud_load_ma() {
            Some((left, right)) => {
                left < CASE_EARBUD_MINIMUM_CURRENT_MA && right < CASE_EARBUD_MINIMUM_CURRENT_MA
            }
            None => true,
        }
    }

    fn end_status(&mut self, earbud: Earbud, success: bool) {
        let s = &mut self.earbuds[earbud.index()];
        if !success {
            report(
                &mut self.platform,
                s.cmd_source,
                format_args!("EBSTATUS ({}): Failed", earbud.letter()),
            );
        }
        s.status_wanted = false;
        s.cmd_source = None;

        self.platform.clear_stop_reason(StopReason::CaseEmpty);

        let next = if self.earbuds.iter().any(|s| s.status_wanted) {
            CaseState::Alert
        } else if self.earbuds.iter().any(|s| s.valid) {
            // At least one answered, so share the battery levels
            CaseState::StatusBroadcast
        } else {
            if self.looks_empty() {
                debug!("Case empty");
                self.platform.set_stop_reason(StopReason::CaseEmpty);
            }
            CaseState::Alert
        };
        self.set_state(earbud, next);

        if !self.lid_now && self.all_charged() {
            self.status_countdown = CASE_STATUS_TIME_CHARGED;
            self.platform.set_stop_reason(StopReason::FullyCharged);
        } else {
            self.platform.clear_stop_reason(StopReason::FullyCharged);
        }
    }

    fn end_xstatus(&mut self, earbud: Earbud, success: bool) {
        let s = &mut self.earbuds[earbud.index()];
        if !success {
            report(
                &mut self.platform,
                s.cmd_source,
                format_args!("EBSTATUS ({}): Failed", earbud.letter()),
            );
        }
        s.xstatus_wanted = false;
        s.cmd_source = None;
        self.set_state(earbud, CaseState::Alert);
    }

    fn end_loopback(&mut self, earbud: Earbud, success: bool) {
        let now = self.platform.ticks();
        let s = &mut self.earbuds[earbud.index()];
        if !success {
            report(
                &mut self.platform,
                s.cmd_source,
                format_args!("LOOPBACK ({}): Failed", earbud.letter()),
            );
        }

        let test = &s.loopback;
        if test.iterations > 0 {
            let rate = loopback_data_rate(test.iterations, test.len(), now.wrapping_sub(test.start_time));
            report(
                &mut self.platform,
                s.cmd_source,
                format_args!(
                    "LOOPBACK ({}): Data rate = {}, NACKs = {}",
                    earbud.letter(),
                    rate,
                    test.nack_count
                ),
            );
        }

        s.cmd_source = None;
        s.loopback_wanted = false;
        self.set_state(earbud, CaseState::Alert);
    }

    fn end_reset(&mut self, earbud: Earbud) {
        self.earbuds[earbud.index()].reset_wanted = false;
        self.set_state(earbud, CaseState::Alert);
    }

    fn enter_shipping_mode(&mut self) {
        info!("Entering shipping mode");
        self.platform.set_shipping_mode(true);
        self.platform.set_standby_reason(StandbyReason::ShippingMode);
        for earbud in Earbud::ALL {
            self.set_state(earbud, CaseState::Idle);
        }
        self.status_on_timer = false;
        self.in_shipping_mode = true;
    }

    /// Lid held open long enough while in shipping mode: back to normal
    fn shipping_startup(&mut self) {
        if !(self.in_shipping_mode && self.lid_now) {
            return;
        }

        self.shipping_lid_open_count = self.shipping_lid_open_count.saturating_add(1);
        if self.shipping_lid_open_count > CASE_SHIPPING_TIME {
            info!("Leaving shipping mode");
            self.shipping_lid_open_count = 0;
            self.platform.set_shipping_mode(false);
            self.platform.clear_standby_reason(StandbyReason::ShippingMode);
            self.lid_before = false;
            self.start();
            self.ship_lock.release(&mut self.platform);
        }
    }

    /// Commit to shipping mode once both earbuds have answered
    fn shipping_aggregate(&mut self) {
        if !self.earbuds.iter().all(|s| s.state == CaseState::ShippingDone) {
            return;
        }

        let source = self.earbuds[Earbud::Left.index()].cmd_source;
        for s in self.earbuds.iter_mut() {
            s.ship_wanted = false;
        }

        if self.earbuds.iter().all(|s| s.valid) {
            report(&mut self.platform, source, format_args!("OK"));
            self.enter_shipping_mode();
        } else {
            report(&mut self.platform, source, format_args!("ERROR"));
            for earbud in Earbud::ALL {
                self.set_state(earbud, CaseState::Alert);
            }
        }

        self.clear_cmd_source();
    }

    pub fn state(&self, earbud: Earbud) -> CaseState {
        self.earbuds[earbud.index()].state
    }

    /// True if `earbud` answered the last exchange
    pub fn is_present(&self, earbud: Earbud) -> bool {
        self.earbuds[earbud.index()].present
    }

    /// True if both sessions are idle
    pub fn is_idle(&self) -> bool {
        self.earbuds.iter().all(|s| s.state == CaseState::Idle)
    }

    pub fn in_shipping_mode(&self) -> bool {
        self.in_shipping_mode
    }

    pub fn comms_enabled(&self) -> bool {
        self.comms_enabled
    }

    /// Lid state as of the last handled event
    pub fn lid_open(&self) -> bool {
        self.lid_now
    }

    /// Seconds until the next periodic status exchange
    pub fn status_countdown(&self) -> u32 {
        self.status_countdown
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn ccp(&self) -> &Ccp<T> {
        &self.ccp
    }

    pub fn transport(&self) -> &T {
        self.ccp.wire().transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.ccp.wire_mut().transport_mut()
    }
}
