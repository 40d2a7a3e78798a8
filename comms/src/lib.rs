//! # Charger Case Comms
//!
//! Protocol stack run by a wireless-earbud charging case to talk to its two
//! earbuds over the half-duplex charger comms link:
//!
//! - **Wire**: framing, checksums, SN/NESN sequencing, retries, broadcasts
//! - **CCP**: the message catalogue plus polling for delayed answers
//! - **Case**: one session state machine per earbud, driven by lid and
//!   charger events, the status timer and command entry points
//!
//! ## Architecture
//!
//! ```text
//!   lid / charger / CLI ──► Case ──► Ccp ──► Wire ──► Transport ──► earbuds
//!                            ▲        │       │                       │
//!                            └────────┴───────┴──── receive(byte) ◄───┘
//! ```
//!
//! ## Execution Model
//!
//! Everything runs from two entry points on a cooperative scheduler:
//! [`Case::periodic`] every tick and [`Case::tick`] once a second. Nothing
//! blocks. Any component that needs the MCU awake holds a [`WakeLock`].

#![cfg_attr(not(feature = "std"), no_std)]

pub mod case;
pub mod ccp;
pub mod config;
pub mod crc;
pub mod earbud;
pub mod frame;
pub mod power;
pub mod traits;
pub mod wire;

#[cfg(any(test, feature = "fake-earbud"))]
pub mod fake_earbud;

// Re-export main types for convenience
pub use case::{Case, CaseState, CommandError, Completion, LoopbackRequest};
pub use ccp::{Ccp, CcpError, CcpEvents};
pub use config::{CaseConfig, ConfigError, ConfigFlash, PersistentConfig};
pub use earbud::{Destination, Earbud};
pub use frame::FrameError;
pub use power::{PowerMode, PowerReasons, RunReason, StandbyReason, StopReason, WakeLock};
pub use traits::{CommandSource, Platform, Transport};
pub use wire::{Wire, WireError, WireEvents};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scheduler ticks per second
pub const TIMER_FREQUENCY_HZ: u32 = 100;
