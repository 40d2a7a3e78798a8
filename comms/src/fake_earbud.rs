//! # Simulated Earbuds
//!
//! A [`Transport`] that plays the earbud side of the link for tests and the
//! host simulator. Each earbud keeps its own SN/NESN pair, answers CCP
//! requests after a configurable number of polls, and can be told to reject
//! or corrupt particular frames.
//!
//! Replies are queued as raw bytes; the owner drains them with
//! [`FakeEarbuds::pop_rx`] and feeds them back into the Wire layer.

use heapless::{Deque, Vec};

use crate::ccp::{BtAddress, CcpMessage, EARBUD_CMD_SHIPPING_MODE, INFO_TYPE_BT_ADDRESS};
use crate::earbud::{Destination, Earbud, ADDRESS_CASE, NO_OF_EARBUDS};
use crate::frame::{self, FrameHeader, WIRE_MAX_PAYLOAD};
use crate::traits::Transport;

type Payload = Vec<u8, WIRE_MAX_PAYLOAD>;

/// One simulated earbud
#[derive(Debug, Clone)]
pub struct FakeEarbud {
    /// Absent earbuds never answer
    pub present: bool,
    pub battery: u8,
    pub charging: bool,
    pub accept_shipping: bool,
    pub bt_address: BtAddress,
    /// Empty polls answered before a pending response is released
    pub response_delay: u8,
    /// Bit n set: reject the nth unicast frame received
    pub nack_pattern: u32,
    /// Bit n set: corrupt the reply to the nth unicast frame received
    pub corrupt_pattern: u32,
    /// Factory resets received
    pub resets: u16,
    sn: bool,
    nesn: bool,
    rsp_later: u8,
    pending: Option<Payload>,
    frames_seen: u32,
}

impl FakeEarbud {
    pub fn new(battery: u8) -> Self {
        Self {
            present: true,
            battery,
            charging: false,
            accept_shipping: true,
            bt_address: BtAddress::default(),
            response_delay: 0,
            nack_pattern: 0,
            corrupt_pattern: 0,
            resets: 0,
            sn: false,
            nesn: false,
            rsp_later: 0,
            pending: None,
            frames_seen: 0,
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new(0)
        }
    }

    /// Unicast frames received so far
    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    fn resync(&mut self) {
        self.sn = false;
        self.nesn = false;
    }

    fn pattern_bit(pattern: u32, n: u32) -> bool {
        n < 32 && pattern & (1 << n) != 0
    }

    /// Handle one frame; returns the reply payload, if any
    fn handle(&mut self, header: &FrameHeader, payload: &[u8]) -> Option<Payload> {
        let n = self.frames_seen;
        self.frames_seen += 1;

        let fresh = header.seq == self.nesn;
        if header.nesn != self.sn {
            self.sn = !self.sn;
        }

        if Self::pattern_bit(self.nack_pattern, n) {
            return Some(Payload::new());
        }

        if !fresh {
            return Some(Payload::new());
        }
        self.nesn = !self.nesn;

        if payload.is_empty() {
            return match self.pending.take() {
                Some(answer) if self.rsp_later == 0 => Some(answer),
                Some(answer) => {
                    self.rsp_later -= 1;
                    self.pending = Some(answer);
                    Some(Payload::new())
                }
                None => None,
            };
        }

        self.pending = self.answer(payload);
        self.rsp_later = self.response_delay;
        Some(Payload::new())
    }

    fn answer(&mut self, request: &[u8]) -> Option<Payload> {
        let (&hdr, body) = request.split_first()?;
        let mut out = Payload::new();
        let battery = (self.battery & 0x7F) | if self.charging { 0x80 } else { 0 };

        match hdr & 0x0F {
            id if id == CcpMessage::StatusReq as u8 => match body.first() {
                None => out
                    .extend_from_slice(&[CcpMessage::EarbudStatus as u8, 0x00, battery])
                    .ok()?,
                Some(&INFO_TYPE_BT_ADDRESS) => {
                    let a = &self.bt_address;
                    out.extend_from_slice(&[
                        CcpMessage::EarbudStatus as u8,
                        0x80 | INFO_TYPE_BT_ADDRESS,
                        a.lap as u8,
                        (a.lap >> 8) as u8,
                        (a.lap >> 16) as u8,
                        a.uap,
                        a.nap as u8,
                        (a.nap >> 8) as u8,
                    ])
                    .ok()?
                }
                Some(_) => return None,
            },
            id if id == CcpMessage::Loopback as u8 => out.extend_from_slice(request).ok()?,
            id if id == CcpMessage::EarbudCmd as u8 => {
                if body.first() != Some(&EARBUD_CMD_SHIPPING_MODE) {
                    return None;
                }
                out.extend_from_slice(&[
                    CcpMessage::EarbudRsp as u8,
                    EARBUD_CMD_SHIPPING_MODE,
                    self.accept_shipping as u8,
                ])
                .ok()?
            }
            id if id == CcpMessage::Reset as u8 => {
                self.resets += 1;
                return None;
            }
            _ => return None,
        }

        Some(out)
    }
}

/// Both earbuds behind one transport
pub struct FakeEarbuds {
    pub earbuds: [FakeEarbud; NO_OF_EARBUDS],
    /// Forces `is_active` for contention tests
    pub active: bool,
    outbox: Deque<u8, 256>,
    last_broadcast: Option<Payload>,
    broadcasts: u16,
}

impl FakeEarbuds {
    pub fn new(left: FakeEarbud, right: FakeEarbud) -> Self {
        Self {
            earbuds: [left, right],
            active: false,
            outbox: Deque::new(),
            last_broadcast: None,
            broadcasts: 0,
        }
    }

    pub fn earbud(&self, earbud: Earbud) -> &FakeEarbud {
        &self.earbuds[earbud.index()]
    }

    pub fn earbud_mut(&mut self, earbud: Earbud) -> &mut FakeEarbud {
        &mut self.earbuds[earbud.index()]
    }

    /// Next reply byte heading back to the case
    pub fn pop_rx(&mut self) -> Option<u8> {
        self.outbox.pop_front()
    }

    /// Payload of the most recent broadcast frame
    pub fn last_broadcast(&self) -> Option<&[u8]> {
        self.last_broadcast.as_deref()
    }

    /// Broadcast frames sent so far, repeats included
    pub fn broadcasts(&self) -> u16 {
        self.broadcasts
    }

    fn queue(&mut self, earbud: Earbud, payload: &[u8]) {
        let e = &self.earbuds[earbud.index()];
        let header = FrameHeader::new(e.sn, e.nesn, ADDRESS_CASE, payload.len());
        let corrupt = FakeEarbud::pattern_bit(e.corrupt_pattern, e.frames_seen - 1);
        if let Ok(mut bytes) = frame::encode(&header, payload) {
            if corrupt {
                if let Some(last) = bytes.last_mut() {
                    *last ^= 0xFF;
                }
            }
            for byte in bytes {
                if self.outbox.push_back(byte).is_err() {
                    break;
                }
            }
        }
    }
}

impl Transport for FakeEarbuds {
    fn transmit(&mut self, dest: Destination, bytes: &[u8]) {
        let Ok((header, payload)) = frame::decode(bytes) else {
            return;
        };

        match dest.earbud() {
            None => {
                self.broadcasts += 1;
                self.last_broadcast = Payload::from_slice(payload).ok();
                for e in self.earbuds.iter_mut() {
                    e.resync();
                }
            }
            Some(earbud) => {
                let e = &mut self.earbuds[earbud.index()];
                if !e.present {
                    return;
                }
                if let Some(reply) = e.handle(&header, payload) {
                    self.queue(earbud, &reply);
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
