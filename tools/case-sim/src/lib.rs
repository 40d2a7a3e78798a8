//! # Charger Case Simulator
//!
//! Runs the case comms core on the host against simulated earbuds. A JSON
//! scenario describes the earbuds and a script of lid, charger and command
//! events; the simulator ticks the case until the script is done and
//! reports what happened.
//!
//! ## Tick Loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ every period:                                                │
//! │   scripted events due ──► lid / charger / cmd_* on the case  │
//! │   Case::periodic()    ──► Ccp ──► Wire ──► FakeEarbuds       │
//! │   earbud replies      ──► Case::receive(byte)                │
//! │   every 100 periods   ──► Case::tick()                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The run ends when the scenario duration is reached, or once the case
//! requests standby with nothing left in the script.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use case_comms::case::{CommandError, Completion, LoopbackRequest};
use case_comms::config::{ConfigError, ConfigFlash, PersistentConfig};
use case_comms::fake_earbud::{FakeEarbud, FakeEarbuds};
use case_comms::power::{PowerMode, PowerReasons, RunReason, StandbyReason, StopReason};
use case_comms::traits::{
    BatteryMonitor, ChargerMonitor, Clock, CommandOutput, CommandSource, ConfigStore, LidSensor,
    PowerControl,
};
use case_comms::{Case, Earbud, TIMER_FREQUENCY_HZ};

/// Errors that can occur while loading or running a scenario
#[derive(Error, Debug)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Scenario parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid scenario: {0}")]
    Scenario(String),
}

/// Earbud side as written in scenario files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl From<Side> for Earbud {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Earbud::Left,
            Side::Right => Earbud::Right,
        }
    }
}

/// How one simulated earbud behaves
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EarbudSetup {
    pub present: bool,
    pub battery: u8,
    pub charging: bool,
    pub accept_shipping: bool,
    pub response_delay: u8,
    pub nack_pattern: u32,
    pub corrupt_pattern: u32,
}

impl Default for EarbudSetup {
    fn default() -> Self {
        Self {
            present: true,
            battery: 50,
            charging: false,
            accept_shipping: true,
            response_delay: 0,
            nack_pattern: 0,
            corrupt_pattern: 0,
        }
    }
}

impl EarbudSetup {
    fn build(&self) -> FakeEarbud {
        let mut earbud = FakeEarbud::new(self.battery);
        earbud.present = self.present;
        earbud.charging = self.charging;
        earbud.accept_shipping = self.accept_shipping;
        earbud.response_delay = self.response_delay;
        earbud.nack_pattern = self.nack_pattern;
        earbud.corrupt_pattern = self.corrupt_pattern;
        earbud
    }
}

/// Something the script does to the case
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Lid {
        open: bool,
    },
    Charger {
        connected: bool,
    },
    Info,
    Status,
    Ebstatus {
        #[serde(default)]
        earbud: Option<Side>,
        #[serde(default)]
        info_type: u8,
    },
    Reset {
        earbud: Side,
    },
    Loopback {
        earbud: Side,
        #[serde(default)]
        iterations: u16,
        #[serde(default)]
        len: Option<u8>,
        #[serde(default)]
        data: Option<Vec<u8>>,
    },
    Ship,
    LidQuery,
}

/// An action scheduled for a given periodic
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedEvent {
    pub at: u32,
    #[serde(flatten)]
    pub action: Action,
}

/// A complete simulation run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Periodics to run at most
    pub duration: u32,
    /// Case battery level in percent
    pub case_battery: u8,
    pub current_senses: bool,
    /// Current drawn by (left, right) in mA, if the board can measure it
    pub earbud_load_ma: Option<(u32, u32)>,
    pub left: EarbudSetup,
    pub right: EarbudSetup,
    pub events: Vec<ScriptedEvent>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            duration: 3000,
            case_battery: 80,
            current_senses: true,
            earbud_load_ma: None,
            left: EarbudSetup::default(),
            right: EarbudSetup::default(),
            events: Vec::new(),
        }
    }
}

impl Scenario {
    /// Parse and validate a scenario; events come out in time order
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        let mut scenario: Scenario = serde_json::from_str(json)?;
        scenario.validate()?;
        scenario.events.sort_by_key(|e| e.at);
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self, SimError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), SimError> {
        if self.duration == 0 {
            return Err(SimError::Scenario("duration must be non-zero".into()));
        }
        if let Some(late) = self.events.iter().find(|e| e.at >= self.duration) {
            return Err(SimError::Scenario(format!(
                "event at {} is beyond the duration ({})",
                late.at, self.duration
            )));
        }
        for event in &self.events {
            if let Action::Loopback { data: Some(data), .. } = &event.action {
                if data.is_empty() {
                    return Err(SimError::Scenario(format!("empty loopback data at {}", event.at)));
                }
            }
        }
        Ok(())
    }
}

/// Configuration record kept in a file
pub struct FileFlash {
    path: PathBuf,
}

impl FileFlash {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigFlash for FileFlash {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConfigError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ConfigError::Empty),
            Err(e) => {
                warn!("Config read failed: {}", e);
                return Err(ConfigError::Flash);
            }
        };
        if bytes.is_empty() {
            return Err(ConfigError::Empty);
        }
        let dest = buf.get_mut(..bytes.len()).ok_or(ConfigError::Flash)?;
        dest.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn write(&mut self, record: &[u8]) -> Result<(), ConfigError> {
        std::fs::write(&self.path, record).map_err(|e| {
            warn!("Config write failed: {}", e);
            ConfigError::Flash
        })
    }
}

/// Host stand-in for the case board
pub struct SimPlatform<F: ConfigFlash> {
    power: PowerReasons,
    config: PersistentConfig<F>,
    lid: bool,
    charger: bool,
    battery: u8,
    senses: bool,
    load_ma: Option<(u32, u32)>,
    ticks: u32,
    transcript: Vec<String>,
}

impl<F: ConfigFlash> SimPlatform<F> {
    pub fn power(&self) -> &PowerReasons {
        &self.power
    }

    pub fn config(&self) -> &PersistentConfig<F> {
        &self.config
    }

    /// Every line reported to a command source, in order
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

impl<F: ConfigFlash> PowerControl for SimPlatform<F> {
    fn set_run_reason(&mut self, reason: RunReason) {
        self.power.set_run_reason(reason);
    }

    fn clear_run_reason(&mut self, reason: RunReason) {
        self.power.clear_run_reason(reason);
    }

    fn set_stop_reason(&mut self, reason: StopReason) {
        debug!("Stop reason set: {:?}", reason);
        self.power.set_stop_reason(reason);
    }

    fn clear_stop_reason(&mut self, reason: StopReason) {
        self.power.clear_stop_reason(reason);
    }

    fn set_standby_reason(&mut self, reason: StandbyReason) {
        info!("Standby reason set: {:?}", reason);
        self.power.set_standby_reason(reason);
    }

    fn clear_standby_reason(&mut self, reason: StandbyReason) {
        self.power.clear_standby_reason(reason);
    }
}

impl<F: ConfigFlash> BatteryMonitor for SimPlatform<F> {
    fn read_request(&mut self, led: bool) {
        if led {
            info!("LED: case battery {}%", self.battery);
        }
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

impl<F: ConfigFlash> ChargerMonitor for SimPlatform<F> {
    fn is_connected(&self) -> bool {
        self.charger
    }

    fn is_charging(&self) -> bool {
        self.charger && self.battery < 100
    }

    fn connected(&mut self) {
        debug!("Charger detection: connected");
    }

    fn disconnected(&mut self) {
        debug!("Charger detection: disconnected");
    }
}

impl<F: ConfigFlash> LidSensor for SimPlatform<F> {
    fn lid_open(&self) -> bool {
        self.lid
    }
}

impl<F: ConfigFlash> ConfigStore for SimPlatform<F> {
    fn status_time_closed(&self) -> u32 {
        self.config.status_time_closed()
    }

    fn status_time_open(&self) -> u32 {
        self.config.status_time_open()
    }

    fn shipping_mode(&self) -> bool {
        self.config.shipping_mode()
    }

    fn set_shipping_mode(&mut self, enabled: bool) {
        self.config.set_shipping_mode(enabled);
    }
}

impl<F: ConfigFlash> CommandOutput for SimPlatform<F> {
    fn report(&mut self, source: CommandSource, line: &str) {
        info!("[{:?}] {}", source, line);
        self.transcript.push(line.to_string());
    }
}

impl<F: ConfigFlash> Clock for SimPlatform<F> {
    fn ticks(&self) -> u32 {
        self.ticks
    }
}

/// Final state of one earbud
#[derive(Debug, Clone, Serialize)]
pub struct EarbudSummary {
    pub present: bool,
    pub battery: Option<u8>,
    pub state: String,
    pub frames: u32,
}

/// What a run ended with
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub ticks: u32,
    pub power_mode: String,
    pub shipping_mode: bool,
    pub comms_enabled: bool,
    pub broadcasts: u16,
    pub left: EarbudSummary,
    pub right: EarbudSummary,
    pub transcript: Vec<String>,
}

/// A case and its scripted surroundings
pub struct Simulator<F: ConfigFlash> {
    case: Case<FakeEarbuds, SimPlatform<F>>,
    events: Vec<ScriptedEvent>,
    next_event: usize,
    duration: u32,
    tick: u32,
}

impl<F: ConfigFlash> Simulator<F> {
    pub fn new(scenario: Scenario, flash: F) -> Self {
        let platform = SimPlatform {
            power: PowerReasons::new(),
            config: PersistentConfig::load(flash),
            lid: false,
            charger: false,
            battery: scenario.case_battery,
            senses: scenario.current_senses,
            load_ma: scenario.earbud_load_ma,
            ticks: 0,
            transcript: Vec::new(),
        };
        let earbuds = FakeEarbuds::new(scenario.left.build(), scenario.right.build());

        let mut case = Case::new(earbuds, platform);
        case.init();

        Self {
            case,
            events: scenario.events,
            next_event: 0,
            duration: scenario.duration,
            tick: 0,
        }
    }

    pub fn case(&self) -> &Case<FakeEarbuds, SimPlatform<F>> {
        &self.case
    }

    /// True once the duration is used up, or the case asked for standby
    /// with nothing left in the script
    ///
    /// A lid held open in shipping mode may still wake the case, so the run
    /// carries on while that is the case.
    pub fn finished(&self) -> bool {
        if self.tick >= self.duration {
            return true;
        }
        let platform = self.case.platform();
        let waking = self.case.in_shipping_mode() && platform.lid;
        platform.power.mode() == PowerMode::Standby
            && !waking
            && self.next_event >= self.events.len()
    }

    /// Advance by one periodic
    pub fn step(&mut self) {
        while let Some(event) = self.events.get(self.next_event) {
            if event.at > self.tick {
                break;
            }
            let action = event.action.clone();
            self.next_event += 1;
            self.apply(&action);
        }

        self.case.periodic();
        while let Some(byte) = self.case.transport_mut().pop_rx() {
            self.case.receive(byte);
        }

        self.tick += 1;
        self.case.platform_mut().ticks = self.tick;
        if self.tick % TIMER_FREQUENCY_HZ == 0 {
            self.case.tick();
        }
    }

    fn apply(&mut self, action: &Action) {
        debug!("t={} {:?}", self.tick, action);
        let source = CommandSource::Usb;

        let result = match action {
            Action::Lid { open } => {
                self.case.platform_mut().lid = *open;
                self.case.event_occurred();
                return;
            }
            Action::Charger { connected } => {
                self.case.platform_mut().charger = *connected;
                self.case.event_occurred();
                return;
            }
            Action::Info => self.case.cmd_info(source),
            Action::Status => self.case.cmd_status(source),
            Action::Ebstatus { earbud, info_type } => self
                .case
                .cmd_ebstatus(source, earbud.map(|side| (side.into(), *info_type))),
            Action::Reset { earbud } => self.case.cmd_reset(source, (*earbud).into()),
            Action::Loopback {
                earbud,
                iterations,
                len,
                data,
            } => {
                let request = LoopbackRequest {
                    iterations: *iterations,
                    len: *len,
                    data: data.as_deref(),
                };
                self.case.cmd_loopback(source, (*earbud).into(), request)
            }
            Action::Ship => self.case.cmd_ship(source),
            Action::LidQuery => self.case.cmd_lid(source),
        };

        self.conclude(action, result);
    }

    fn conclude(&mut self, action: &Action, result: Result<Completion, CommandError>) {
        match result {
            Ok(Completion::Done) => self.case.platform_mut().report(CommandSource::Usb, "OK"),
            Ok(Completion::Pending) => {}
            Err(e) => {
                warn!("{:?} refused: {:?}", action, e);
                self.case.platform_mut().report(CommandSource::Usb, "ERROR");
            }
        }
    }

    fn earbud_summary(&self, earbud: Earbud) -> EarbudSummary {
        EarbudSummary {
            present: self.case.is_present(earbud),
            battery: self.case.earbud_battery(earbud),
            state: format!("{:?}", self.case.state(earbud)),
            frames: self.case.transport().earbud(earbud).frames_seen(),
        }
    }

    pub fn summary(&self) -> Summary {
        let platform = self.case.platform();
        Summary {
            ticks: self.tick,
            power_mode: format!("{:?}", platform.power.mode()),
            shipping_mode: platform.config.config().shipping_mode,
            comms_enabled: self.case.comms_enabled(),
            broadcasts: self.case.transport().broadcasts(),
            left: self.earbud_summary(Earbud::Left),
            right: self.earbud_summary(Earbud::Right),
            transcript: platform.transcript.clone(),
        }
    }
}

/// Drive `sim` on a fixed period until it finishes
pub async fn run<F: ConfigFlash>(mut sim: Simulator<F>, period: Duration) -> Summary {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    while !sim.finished() {
        interval.tick().await;
        sim.step();
    }

    let summary = sim.summary();
    info!(
        "Finished after {} periodics in {} mode",
        summary.ticks, summary.power_mode
    );
    summary
}
