//! Board double and stepping helpers for case session tests.

use heapless::{String, Vec};

use super::Case;
use crate::config::CaseConfig;
use crate::fake_earbud::{FakeEarbud, FakeEarbuds};
use crate::power::{PowerReasons, RunReason, StandbyReason, StopReason};
use crate::traits::{
    BatteryMonitor, ChargerMonitor, Clock, CommandOutput, CommandSource, ConfigStore, LidSensor, PowerControl,
};

pub(crate) type TestCase = Case<FakeEarbuds, TestPlatform>;

pub(crate) struct TestPlatform {
    pub power: PowerReasons,
    pub config: CaseConfig,
    pub lid: bool,
    pub charger: bool,
    pub charging: bool,
    pub battery: u8,
    pub senses: bool,
    pub load_ma: Option<(u32, u32)>,
    pub ticks: u32,
    pub read_requests: u8,
    pub connected: u8,
    pub disconnected: u8,
    pub lines: Vec<(CommandSource, String<64>), 64>,
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self {
            power: PowerReasons::new(),
            config: CaseConfig::default(),
            lid: false,
            charger: false,
            charging: false,
            battery: 100,
            senses: true,
            load_ma: None,
            ticks: 0,
            read_requests: 0,
            connected: 0,
            disconnected: 0,
            lines: Vec::new(),
        }
    }
}

impl TestPlatform {
    pub fn line(&self, n: usize) -> Option<&str> {
        self.lines.get(n).map(|(_, l)| l.as_str())
    }

    pub fn has_line(&self, line: &str) -> bool {
        self.lines.iter().any(|(_, l)| l.as_str() == line)
    }
}

impl PowerControl for TestPlatform {
    fn set_run_reason(&mut self, reason: RunReason) {
        self.power.set_run_reason(reason);
    }
    fn clear_run_reason(&mut self, reason: RunReason) {
        self.power.clear_run_reason(reason);
    }
    fn set_stop_reason(&mut self, reason: StopReason) {
        self.power.set_stop_reason(reason);
    }
    fn clear_stop_reason(&mut self, reason: StopReason) {
        self.power.clear_stop_reason(reason);
    }
    fn set_standby_reason(&mut self, reason: StandbyReason) {
        self.power.set_standby_reason(reason);
    }
    fn clear_standby_reason(&mut self, reason: StandbyReason) {
        self.power.clear_standby_reason(reason);
    }
}

impl BatteryMonitor for TestPlatform {
    fn read_request(&mut self, _led: bool) {
        self.read_requests += 1;
    }
    fn read_done(&self) -> bool {
        true
    }
    fn percentage(&self) -> u8 {
        self.battery
    }
    fn earbud_load_ma(&mut self) -> Option<(u32, u32)> {
        self.load_ma
    }
    fn current_senses_present(&self) -> bool {
        self.senses
    }
}

impl ChargerMonitor for TestPlatform {
    fn is_connected(&self) -> bool {
        self.charger
    }
    fn is_charging(&self) -> bool {
        self.charging
    }
    fn connected(&mut self) {
        self.connected += 1;
    }
    fn disconnected(&mut self) {
        self.disconnected += 1;
    }
}

impl LidSensor for TestPlatform {
    fn lid_open(&self) -> bool {
        self.lid
    }
}

impl ConfigStore for TestPlatform {
    fn status_time_closed(&self) -> u32 {
        self.config.status_time_closed
    }
    fn status_time_open(&self) -> u32 {
        self.config.status_time_open
    }
    fn shipping_mode(&self) -> bool {
        self.config.shipping_mode
    }
    fn set_shipping_mode(&mut self, enabled: bool) {
        self.config.shipping_mode = enabled;
    }
}

impl CommandOutput for TestPlatform {
    fn report(&mut self, source: CommandSource, line: &str) {
        let _ = self.lines.push((source, String::try_from(line).unwrap_or_default()));
    }
}

impl Clock for TestPlatform {
    fn ticks(&self) -> u32 {
        self.ticks
    }
}

pub(crate) fn case_with_platform(platform: TestPlatform, left: FakeEarbud, right: FakeEarbud) -> TestCase {
    let mut case = Case::new(FakeEarbuds::new(left, right), platform);
    case.init();
    case
}

pub(crate) fn case_with(left: FakeEarbud, right: FakeEarbud) -> TestCase {
    case_with_platform(TestPlatform::default(), left, right)
}

/// One scheduler tick, with the earbuds' replies fed straight back
pub(crate) fn step(case: &mut TestCase) {
    case.periodic();
    case.platform_mut().ticks += 1;
    while let Some(byte) = case.transport_mut().pop_rx() {
        case.receive(byte);
    }
}

/// Step until `done`, returning the number of steps taken
pub(crate) fn run_until(case: &mut TestCase, limit: usize, done: impl Fn(&TestCase) -> bool) -> usize {
    for n in 0..limit {
        if done(case) {
            return n;
        }
        step(case);
    }
    panic!("condition not reached in {} periodics", limit);
}
