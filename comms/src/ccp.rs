//! # Case Comms Protocol
//!
//! Message catalogue on top of the Wire layer, plus the "acknowledged but
//! still waiting for the real answer" handling that bare Wire ACKs cannot
//! express.
//!
//! ## Message Header
//!
//! ```text
//! ┌───┬─────────┬─────────────┐
//! │ M │ CHAN_ID │   MSG_ID    │
//! │ 1 │    3    │      4      │
//! └───┴─────────┴─────────────┘
//!   M = more pieces follow
//! ```
//!
//! ## Request Flow
//!
//! ```text
//!  case                          earbud
//!   │ ── STATUS_REQ ───────────────► │
//!   │ ◄────────────────────── ACK ── │   poll timer armed
//!   │ ── poll (empty) ─────────────► │
//!   │ ◄────────────── EARBUD_STATUS ─│   delivered, transaction ends
//! ```
//!
//! Polls are bounded by [`CCP_MAX_POLLS`]; after that the original request is
//! sent again [`CCP_RETRY_COUNT`] times before giving up.

use heapless::Vec;
use log::{debug, info};

use crate::earbud::{Destination, Earbud, Hex, NO_OF_EARBUDS};
use crate::traits::Transport;
use crate::wire::{Wire, WireError, WireEvents};

#[cfg(feature = "scheme-a")]
pub const CCP_POLL_TIMEOUT: u8 = 25;

/// Periodics between polls
#[cfg(not(feature = "scheme-a"))]
pub const CCP_POLL_TIMEOUT: u8 = 2;

/// Polls sent before the request itself is retransmitted
pub const CCP_MAX_POLLS: u8 = 5;

/// Retransmissions of a request after the poll budget runs out
pub const CCP_RETRY_COUNT: u8 = 1;

/// Periodics a retransmission may be blocked before giving up
pub const CCP_ALLOWED_FAILED_RETRIES: u8 = 30;

/// Largest message body after the header byte
pub const CCP_MAX_PAYLOAD_SIZE: usize = 13;

/// Largest message including the header byte
pub const CCP_MAX_MSG_SIZE: usize = CCP_MAX_PAYLOAD_SIZE + 1;

/// Largest reassembled multi-piece message
const CCP_MAX_REASSEMBLY: usize = 64;

const HDR_M: u8 = 0x80;
const HDR_CHAN_SHIFT: u8 = 4;
const HDR_CHAN_MASK: u8 = 0x07;
const HDR_MSG_MASK: u8 = 0x0F;

const STATUS_1_CHG_RATE: u8 = 0x04;
const STATUS_1_CC: u8 = 0x02;
const STATUS_1_L: u8 = 0x01;

const BATTERY_C: u8 = 0x80;
const BATTERY_LEVEL: u8 = 0x7F;

const RESET_R: u8 = 0x01;

const EARBUD_STATUS_INFO: u8 = 0x80;
const EARBUD_STATUS_INFO_TYPE: u8 = 0x7F;
const EARBUD_STATUS_CHG_RATE: u8 = 0x02;
const EARBUD_STATUS_PP: u8 = 0x01;

const SHIP_RSP_SM: u8 = 0x01;

/// Extended status info type carrying the Bluetooth address
pub const INFO_TYPE_BT_ADDRESS: u8 = 0;

/// EARBUD_CMD / EARBUD_RSP command code for shipping mode
pub const EARBUD_CMD_SHIPPING_MODE: u8 = 0x02;

/// Message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CcpMessage {
    Status = 0,
    EarbudStatus = 1,
    Reset = 2,
    StatusReq = 3,
    Loopback = 4,
    EarbudCmd = 5,
    EarbudRsp = 6,
}

impl CcpMessage {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Status),
            1 => Some(Self::EarbudStatus),
            2 => Some(Self::Reset),
            3 => Some(Self::StatusReq),
            4 => Some(Self::Loopback),
            5 => Some(Self::EarbudCmd),
            6 => Some(Self::EarbudRsp),
            _ => None,
        }
    }
}

/// Logical channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CcpChannel {
    CaseInfo = 0,
}

fn header(chan: CcpChannel, msg: CcpMessage) -> u8 {
    ((chan as u8 & HDR_CHAN_MASK) << HDR_CHAN_SHIFT) | (msg as u8 & HDR_MSG_MASK)
}

fn battery_byte(level: u8, charging: bool) -> u8 {
    (level & BATTERY_LEVEL) | if charging { BATTERY_C } else { 0 }
}

/// Contents of an EARBUD_STATUS reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EarbudReport {
    pub present_pin: bool,
    pub charge_rate: bool,
    pub battery: u8,
    pub charging: bool,
}

/// Bluetooth device address, split the usual way
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BtAddress {
    pub nap: u16,
    pub uap: u8,
    pub lap: u32,
}

/// Everything carried by the long STATUS broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaseStatus {
    pub lid_open: bool,
    pub charger_connected: bool,
    pub charging: bool,
    pub charge_rate: bool,
    pub battery: u8,
    pub left_battery: u8,
    pub right_battery: u8,
    pub left_charging: bool,
    pub right_charging: bool,
}

/// Notifications delivered to the session layer
pub trait CcpEvents {
    fn rx_earbud_status(&mut self, earbud: Earbud, report: EarbudReport);
    fn rx_bt_address(&mut self, earbud: Earbud, address: BtAddress);
    /// Bare ACK for a message that did not ask for an answer
    fn ack(&mut self, earbud: Earbud);
    fn nack(&mut self, earbud: Earbud);
    fn give_up(&mut self, earbud: Earbud);
    fn no_response(&mut self, earbud: Earbud);
    fn abort(&mut self, earbud: Earbud);
    fn broadcast_finished(&mut self);
    fn loopback(&mut self, earbud: Earbud, data: &[u8]);
    fn shipping(&mut self, earbud: Earbud, accepted: bool);
}

/// Reasons a CCP message is not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcpError {
    /// Body exceeds [`CCP_MAX_PAYLOAD_SIZE`]
    TooLarge,
    /// A request to one of the earbuds is still waiting for its answer
    Busy,
    /// Refused by the Wire layer
    Wire(WireError),
}

impl From<WireError> for CcpError {
    fn from(e: WireError) -> Self {
        CcpError::Wire(e)
    }
}

type Message = Vec<u8, CCP_MAX_MSG_SIZE>;

#[derive(Debug, Default)]
struct CcpTransaction {
    busy: bool,
    poll_timeout: u8,
    poll_count: u8,
    retries: u8,
    failed_retries: u8,
    message: Message,
    pieces: Vec<u8, CCP_MAX_REASSEMBLY>,
}

/// Routes Wire notifications into CCP state and on to the user
struct Link<'a, E: CcpEvents> {
    transactions: &'a mut [CcpTransaction; NO_OF_EARBUDS],
    user: &'a mut E,
}

impl<E: CcpEvents> WireEvents for Link<'_, E> {
    fn rx(&mut self, earbud: Earbud, data: &[u8]) {
        debug!("WIRE->CCP ({}): {}", earbud.letter(), Hex(data));

        let t = &mut self.transactions[earbud.index()];
        let more = data.first().map_or(false, |hdr| hdr & HDR_M != 0);

        if more {
            let body = if t.pieces.is_empty() { data } else { &data[1..] };
            if t.pieces.extend_from_slice(body).is_err() {
                t.pieces.clear();
            }
            if t.busy {
                t.poll_timeout = CCP_POLL_TIMEOUT;
            }
            return;
        }

        if t.pieces.is_empty() {
            dispatch(self.user, earbud, data);
        } else {
            let mut whole = core::mem::take(&mut t.pieces);
            if whole.extend_from_slice(data.get(1..).unwrap_or(&[])).is_ok() {
                whole[0] &= !HDR_M;
                dispatch(self.user, earbud, &whole);
            }
        }

        self.transactions[earbud.index()].busy = false;
    }

    fn ack(&mut self, earbud: Earbud) {
        let t = &mut self.transactions[earbud.index()];
        if t.busy {
            // Still waiting for the actual answer
            t.poll_timeout = CCP_POLL_TIMEOUT;
        } else {
            self.user.ack(earbud);
        }
    }

    fn nack(&mut self, earbud: Earbud) {
        self.user.nack(earbud);
    }

    fn give_up(&mut self, earbud: Earbud) {
        self.user.give_up(earbud);
        self.transactions[earbud.index()].busy = false;
    }

    fn no_response(&mut self, earbud: Earbud) {
        self.user.no_response(earbud);
        self.transactions[earbud.index()].busy = false;
    }

    fn abort(&mut self, earbud: Earbud) {
        self.user.abort(earbud);
        self.transactions[earbud.index()].busy = false;
    }

    fn broadcast_finished(&mut self) {
        self.user.broadcast_finished();
    }
}

/// Decode a complete message from `earbud` and notify the user
///
/// Unknown channels, unknown messages and short bodies are ignored.
fn dispatch<E: CcpEvents>(user: &mut E, earbud: Earbud, msg: &[u8]) {
    let Some((&hdr, body)) = msg.split_first() else {
        return;
    };
    if (hdr >> HDR_CHAN_SHIFT) & HDR_CHAN_MASK != CcpChannel::CaseInfo as u8 {
        return;
    }

    match CcpMessage::from_id(hdr & HDR_MSG_MASK) {
        Some(CcpMessage::EarbudStatus) => match body {
            [status, rest @ ..] if status & EARBUD_STATUS_INFO != 0 => {
                if status & EARBUD_STATUS_INFO_TYPE == INFO_TYPE_BT_ADDRESS {
                    if let [lap0, lap1, lap2, uap, nap0, nap1, ..] = *rest {
                        user.rx_bt_address(
                            earbud,
                            BtAddress {
                                nap: u16::from_le_bytes([nap0, nap1]),
                                uap,
                                lap: u32::from_le_bytes([lap0, lap1, lap2, 0]),
                            },
                        );
                    }
                }
            }
            [status, battery, ..] => user.rx_earbud_status(
                earbud,
                EarbudReport {
                    present_pin: status & EARBUD_STATUS_PP != 0,
                    charge_rate: status & EARBUD_STATUS_CHG_RATE != 0,
                    battery: battery & BATTERY_LEVEL,
                    charging: battery & BATTERY_C != 0,
                },
            ),
            _ => {}
        },
        Some(CcpMessage::Loopback) => user.loopback(earbud, body),
        Some(CcpMessage::EarbudRsp) => {
            if let [EARBUD_CMD_SHIPPING_MODE, rsp, ..] = *body {
                user.shipping(earbud, rsp & SHIP_RSP_SM != 0);
            }
        }
        _ => {}
    }
}

/// CCP state for both earbuds, owning the Wire layer beneath it
pub struct Ccp<T: Transport> {
    wire: Wire<T>,
    transactions: [CcpTransaction; NO_OF_EARBUDS],
}

impl<T: Transport> Ccp<T> {
    pub fn new(transport: T) -> Self {
        Self {
            wire: Wire::new(transport),
            transactions: Default::default(),
        }
    }

    /// Drop every transaction, in CCP and Wire alike
    pub fn reset(&mut self) {
        self.wire.reset();
        self.transactions = Default::default();
    }

    pub fn wire(&self) -> &Wire<T> {
        &self.wire
    }

    pub fn wire_mut(&mut self) -> &mut Wire<T> {
        &mut self.wire
    }

    /// True while a request to `earbud` is waiting for its answer
    pub fn is_busy(&self, earbud: Earbud) -> bool {
        self.transactions[earbud.index()].busy
    }

    /// Feed one received byte to the Wire deframer
    pub fn receive(&mut self, byte: u8) {
        self.wire.receive(byte);
    }

    /// Drive the Wire layer, then the poll/retry state of each earbud
    pub fn periodic<E: CcpEvents>(&mut self, user: &mut E) {
        self.wire.periodic(&mut Link {
            transactions: &mut self.transactions,
            user: &mut *user,
        });

        for earbud in Earbud::ALL {
            self.manage_transaction(earbud, user);
        }
    }

    /// Broadcast the short STATUS form
    pub fn tx_short_status<E: CcpEvents>(
        &mut self,
        lid: bool,
        charger: bool,
        charge_rate: bool,
        user: &mut E,
    ) -> Result<(), CcpError> {
        let status = status_1(lid, charger, charge_rate);
        self.tx(CcpMessage::Status, Destination::Broadcast, &[status], false, user)
    }

    /// Broadcast the long STATUS form with all three battery levels
    pub fn tx_status<E: CcpEvents>(&mut self, status: &CaseStatus, user: &mut E) -> Result<(), CcpError> {
        let body = [
            status_1(status.lid_open, status.charger_connected, status.charge_rate),
            battery_byte(status.battery, status.charging),
            battery_byte(status.left_battery, status.left_charging),
            battery_byte(status.right_battery, status.right_charging),
        ];
        self.tx(CcpMessage::Status, Destination::Broadcast, &body, false, user)
    }

    pub fn tx_status_request<E: CcpEvents>(&mut self, earbud: Earbud, user: &mut E) -> Result<(), CcpError> {
        self.tx(CcpMessage::StatusReq, earbud.into(), &[], true, user)
    }

    pub fn tx_xstatus_request<E: CcpEvents>(
        &mut self,
        earbud: Earbud,
        info_type: u8,
        user: &mut E,
    ) -> Result<(), CcpError> {
        self.tx(CcpMessage::StatusReq, earbud.into(), &[info_type], true, user)
    }

    pub fn tx_loopback<E: CcpEvents>(&mut self, earbud: Earbud, data: &[u8], user: &mut E) -> Result<(), CcpError> {
        self.tx(CcpMessage::Loopback, earbud.into(), data, true, user)
    }

    /// Reset request; completion is a bare ACK
    pub fn tx_reset<E: CcpEvents>(&mut self, earbud: Earbud, factory: bool, user: &mut E) -> Result<(), CcpError> {
        let body = if factory { RESET_R } else { 0 };
        self.tx(CcpMessage::Reset, earbud.into(), &[body], false, user)
    }

    pub fn tx_shipping_mode<E: CcpEvents>(&mut self, earbud: Earbud, user: &mut E) -> Result<(), CcpError> {
        self.tx(CcpMessage::EarbudCmd, earbud.into(), &[EARBUD_CMD_SHIPPING_MODE], true, user)
    }

    fn tx<E: CcpEvents>(
        &mut self,
        msg: CcpMessage,
        dest: Destination,
        data: &[u8],
        need_answer: bool,
        user: &mut E,
    ) -> Result<(), CcpError> {
        if data.len() > CCP_MAX_PAYLOAD_SIZE {
            return Err(CcpError::TooLarge);
        }

        let mut message = Message::new();
        message
            .push(header(CcpChannel::CaseInfo, msg))
            .map_err(|_| CcpError::TooLarge)?;
        message
            .extend_from_slice(data)
            .map_err(|_| CcpError::TooLarge)?;

        match dest.earbud() {
            None => {
                self.wire.tx(
                    dest,
                    &message,
                    &mut Link {
                        transactions: &mut self.transactions,
                        user: &mut *user,
                    },
                )?;

                // Anything Wire did not abort was parked waiting to poll
                for earbud in Earbud::ALL {
                    let t = &mut self.transactions[earbud.index()];
                    if t.busy {
                        t.busy = false;
                        user.abort(earbud);
                    }
                }
            }
            Some(earbud) => {
                if self.is_busy(earbud) || self.is_busy(earbud.other()) {
                    return Err(CcpError::Busy);
                }

                self.wire.tx(
                    dest,
                    &message,
                    &mut Link {
                        transactions: &mut self.transactions,
                        user: &mut *user,
                    },
                )?;

                if need_answer {
                    let t = &mut self.transactions[earbud.index()];
                    t.busy = true;
                    t.poll_timeout = 0;
                    t.poll_count = 0;
                    t.retries = 0;
                    t.failed_retries = 0;
                    t.message = message;
                    t.pieces.clear();
                }
            }
        }

        Ok(())
    }

    /// Send the stored request again as a new Wire message
    fn retransmit<E: CcpEvents>(&mut self, earbud: Earbud, user: &mut E) -> Result<(), CcpError> {
        if self.is_busy(earbud.other()) {
            return Err(CcpError::Busy);
        }

        let message = self.transactions[earbud.index()].message.clone();
        self.wire.tx(
            earbud.into(),
            &message,
            &mut Link {
                transactions: &mut self.transactions,
                user: &mut *user,
            },
        )?;

        let t = &mut self.transactions[earbud.index()];
        t.busy = true;
        t.poll_count = 0;
        t.poll_timeout = 0;
        Ok(())
    }

    fn manage_transaction<E: CcpEvents>(&mut self, earbud: Earbud, user: &mut E) {
        let i = earbud.index();
        let t = &mut self.transactions[i];
        if !t.busy || t.poll_timeout == 0 {
            return;
        }
        t.poll_timeout -= 1;
        if t.poll_timeout > 0 {
            return;
        }

        if t.poll_count < CCP_MAX_POLLS {
            let polled = self.wire.tx(
                earbud.into(),
                &[],
                &mut Link {
                    transactions: &mut self.transactions,
                    user: &mut *user,
                },
            );
            let t = &mut self.transactions[i];
            match polled {
                Ok(()) => {
                    t.poll_timeout = CCP_POLL_TIMEOUT;
                    t.poll_count += 1;
                }
                // Link temporarily busy; try again next time without using a poll
                Err(_) => t.poll_timeout = 1,
            }
        } else if t.retries < CCP_RETRY_COUNT {
            let resent = self.retransmit(earbud, user);
            let t = &mut self.transactions[i];
            match resent {
                Ok(()) => t.retries += 1,
                Err(_) => {
                    t.failed_retries += 1;
                    if t.failed_retries > CCP_ALLOWED_FAILED_RETRIES {
                        info!("Retransmit blocked ({})", earbud.letter());
                        t.busy = false;
                        user.give_up(earbud);
                    } else {
                        t.poll_timeout = 1;
                    }
                }
            }
        } else {
            t.busy = false;
            user.give_up(earbud);
        }
    }
}

fn status_1(lid: bool, charger: bool, charge_rate: bool) -> u8 {
    let mut status = 0;
    if charge_rate {
        status |= STATUS_1_CHG_RATE;
    }
    if charger {
        status |= STATUS_1_CC;
    }
    if lid {
        status |= STATUS_1_L;
    }
    status
}
