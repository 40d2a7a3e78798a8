//! # Wire Layer
//!
//! Frames CCP payloads for one earbud or for both (broadcast), tracks the
//! per-earbud sequence bits and reports how each exchange ended.
//!
//! ## Transactions
//!
//! Only one exchange owns the link at a time:
//!
//! ```text
//!            tx(Left)                      tx(Broadcast)
//!   idle ───────────────► left busy ───────────────────────► broadcast
//!     ▲                      │   aborts busy unicast first       │
//!     │  ack / rx / give_up /│no_response                        │ 3 repeats
//!     └──────────────────────┘◄──────────────────────────────────┘
//! ```
//!
//! ## Sequencing
//!
//! Each side keeps `seq` (its own sequence bit) and `nesn` (the bit it expects
//! next). A reply whose NESN still equals our `seq` is a NACK and the frame is
//! sent again with the same `seq`. Three NACKs in a row trigger an empty
//! broadcast, which resets both ends to zero before the frame is retried;
//! once [`WIRE_MAX_RESYNCS`] of those have been spent the exchange gives up.
//!
//! The empty frame that acknowledges a received payload is a frame like any
//! other: the earbud advances its NESN for it, so it uses up our `seq`.

use heapless::Vec;
use log::{debug, warn};

use crate::earbud::{Destination, Earbud, Hex, NO_OF_EARBUDS};
use crate::frame::{self, Deframer, FrameError, FrameHeader, WIRE_MAX_PAYLOAD};
use crate::traits::Transport;

#[cfg(feature = "scheme-a")]
mod timing {
    pub const WIRE_NO_RESPONSE_TIMEOUT: u16 = 20;
    pub const WIRE_BROADCAST_TIMEOUT: u16 = 20;
}

#[cfg(not(feature = "scheme-a"))]
mod timing {
    pub const WIRE_NO_RESPONSE_TIMEOUT: u16 = 5;
    pub const WIRE_BROADCAST_TIMEOUT: u16 = 5;
}

/// Periodics without a reply before `no_response`, and periodics between broadcast repeats
pub use timing::{WIRE_BROADCAST_TIMEOUT, WIRE_NO_RESPONSE_TIMEOUT};

/// Number of times each broadcast goes out
pub const WIRE_BROADCAST_REPEATS: u8 = 3;

/// Sends of one frame that may fail the checksum before giving up
pub const WIRE_MAX_RETRIES: u8 = 3;

/// Consecutive NACKs before the sequence bits are resynchronised
pub const WIRE_MAX_NACKS: u8 = 3;

/// Resynchronisations allowed for one frame before giving up
pub const WIRE_MAX_RESYNCS: u8 = 2;

/// Notifications raised by the Wire layer
pub trait WireEvents {
    /// Payload received from an earbud
    fn rx(&mut self, earbud: Earbud, data: &[u8]);
    /// Frame acknowledged without data
    fn ack(&mut self, earbud: Earbud);
    /// Earbud rejected the last frame; it is being retransmitted
    fn nack(&mut self, earbud: Earbud);
    /// Retries exhausted
    fn give_up(&mut self, earbud: Earbud);
    /// Nothing heard back in time
    fn no_response(&mut self, earbud: Earbud);
    /// Transaction pre-empted by a broadcast
    fn abort(&mut self, earbud: Earbud);
    /// All repeats of a requested broadcast have been sent
    fn broadcast_finished(&mut self);
}

/// Reasons `tx` refuses a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WireError {
    /// Payload exceeds [`WIRE_MAX_PAYLOAD`]
    TooLarge,
    /// A broadcast is being repeated
    BroadcastActive,
    /// An earbud transaction is in progress
    Busy,
    /// The transport is in the middle of a physical exchange
    TransportActive,
}

type Payload = Vec<u8, WIRE_MAX_PAYLOAD>;

#[derive(Debug, Default)]
struct Received {
    seq: bool,
    nesn: bool,
    payload: Payload,
}

#[derive(Debug, Default)]
struct WireTransaction {
    busy: bool,
    seq: bool,
    nesn: bool,
    retries: u8,
    nack_count: u8,
    resyncs: u8,
    silent_ticks: u16,
    resend: bool,
    corrupt: bool,
    payload: Payload,
    received: Option<Received>,
}

impl WireTransaction {
    fn start(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.payload.clear();
        self.payload
            .extend_from_slice(data)
            .map_err(|_| WireError::TooLarge)?;
        self.busy = true;
        self.retries = 0;
        self.nack_count = 0;
        self.resyncs = 0;
        self.silent_ticks = 0;
        self.resend = false;
        self.corrupt = false;
        self.received = None;
        Ok(())
    }

    fn finish(&mut self) {
        self.busy = false;
        self.resend = false;
        self.corrupt = false;
        self.received = None;
    }
}

#[derive(Debug, Default)]
struct BroadcastSession {
    active: bool,
    /// Sequence resync after repeated NACKs; nobody is told when it ends
    internal: bool,
    count: u8,
    timeout: u16,
    payload: Payload,
}

/// Wire layer state for both earbuds and the broadcast channel
pub struct Wire<T: Transport> {
    transport: T,
    transactions: [WireTransaction; NO_OF_EARBUDS],
    broadcast: BroadcastSession,
    deframer: Deframer,
}

impl<T: Transport> Wire<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            transactions: Default::default(),
            broadcast: BroadcastSession::default(),
            deframer: Deframer::new(),
        }
    }

    /// Forget all link state
    pub fn reset(&mut self) {
        self.transactions = Default::default();
        self.broadcast = BroadcastSession::default();
        self.deframer.reset();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// True while a unicast exchange with `earbud` is in progress
    pub fn is_busy(&self, earbud: Earbud) -> bool {
        self.transactions[earbud.index()].busy
    }

    /// True while a broadcast is being repeated
    pub fn is_broadcasting(&self) -> bool {
        self.broadcast.active
    }

    /// Queue `data` for `dest` and send the first copy straight away
    ///
    /// A broadcast pre-empts any unicast exchange, raising `abort` for it.
    pub fn tx<E: WireEvents>(
        &mut self,
        dest: Destination,
        data: &[u8],
        events: &mut E,
    ) -> Result<(), WireError> {
        if data.len() > WIRE_MAX_PAYLOAD {
            return Err(WireError::TooLarge);
        }
        if self.broadcast.active {
            return Err(WireError::BroadcastActive);
        }

        match dest.earbud() {
            Some(earbud) => {
                if self.is_busy(earbud) || self.is_busy(earbud.other()) {
                    return Err(WireError::Busy);
                }
                if self.transport.is_active() {
                    return Err(WireError::TransportActive);
                }
                if !data.is_empty() {
                    debug!("CCP->WIRE ({}): {}", earbud.letter(), Hex(data));
                }
                self.transactions[earbud.index()].start(data)?;
                self.send(earbud);
            }
            None => {
                if self.transport.is_active() {
                    return Err(WireError::TransportActive);
                }
                debug!("CCP->WIRE (B): {}", Hex(data));

                let mut payload = Payload::new();
                payload
                    .extend_from_slice(data)
                    .map_err(|_| WireError::TooLarge)?;

                for earbud in Earbud::ALL {
                    let t = &mut self.transactions[earbud.index()];
                    if t.busy {
                        t.finish();
                        events.abort(earbud);
                    }
                }

                self.broadcast = BroadcastSession {
                    active: true,
                    internal: false,
                    count: 0,
                    timeout: 0,
                    payload,
                };
                self.send_broadcast();
            }
        }

        Ok(())
    }

    /// A complete frame has arrived from `earbud`
    ///
    /// Good frames are held until the next [`Wire::periodic`]; bad ones mark
    /// the transaction for a resend.
    pub fn rx(&mut self, earbud: Earbud, bytes: &[u8]) {
        debug!("COMMS->WIRE ({}): {}", earbud.letter(), Hex(bytes));

        let t = &mut self.transactions[earbud.index()];
        match frame::decode(bytes) {
            Ok((header, payload)) => {
                if !t.busy {
                    debug!("Unexpected frame ({})", earbud.letter());
                    return;
                }
                let mut received = Received {
                    seq: header.seq,
                    nesn: header.nesn,
                    payload: Payload::new(),
                };
                if received.payload.extend_from_slice(payload).is_ok() {
                    t.received = Some(received);
                }
            }
            Err(FrameError::BadChecksum) => {
                warn!("Invalid checksum ({})", earbud.letter());
                if t.busy {
                    t.corrupt = true;
                }
            }
            Err(e) => {
                warn!("Invalid frame ({}): {:?}", earbud.letter(), e);
                if t.busy {
                    t.corrupt = true;
                }
            }
        }
    }

    /// Feed one byte from the transport
    ///
    /// Replies can only come from the earbud that owns the link, so a
    /// completed frame is attributed to it.
    pub fn receive(&mut self, byte: u8) {
        if let Some(bytes) = self.deframer.push(byte) {
            match Earbud::ALL.into_iter().find(|e| self.is_busy(*e)) {
                Some(earbud) => self.rx(earbud, &bytes),
                None => debug!("COMMS->WIRE dropped: {}", Hex(&bytes)),
            }
        }
    }

    /// Drive broadcast repeats, then each earbud's transaction (left first)
    pub fn periodic<E: WireEvents>(&mut self, events: &mut E) {
        if self.broadcast.active {
            self.broadcast_periodic(events);
            return;
        }

        for earbud in Earbud::ALL {
            self.transaction_periodic(earbud, events);
        }
    }

    fn broadcast_periodic<E: WireEvents>(&mut self, events: &mut E) {
        if self.broadcast.timeout > 0 {
            self.broadcast.timeout -= 1;
            return;
        }
        if self.transport.is_active() {
            return;
        }

        self.send_broadcast();

        if self.broadcast.count >= WIRE_BROADCAST_REPEATS {
            let internal = self.broadcast.internal;
            self.broadcast = BroadcastSession::default();
            if !internal {
                events.broadcast_finished();
            }
        }
    }

    fn transaction_periodic<E: WireEvents>(&mut self, earbud: Earbud, events: &mut E) {
        let i = earbud.index();
        if !self.transactions[i].busy {
            return;
        }

        if let Some(received) = self.transactions[i].received.take() {
            self.handle_received(earbud, received, events);
            return;
        }

        let t = &mut self.transactions[i];
        if t.corrupt {
            t.corrupt = false;
            t.retries += 1;
            if t.retries >= WIRE_MAX_RETRIES {
                debug!("Retries exhausted ({})", earbud.letter());
                t.finish();
                events.give_up(earbud);
                return;
            }
            t.resend = true;
        }

        if t.resend {
            // A busy transport delays the resend without using up a retry
            if !self.transport.is_active() {
                self.transactions[i].resend = false;
                self.send(earbud);
            }
            return;
        }

        t.silent_ticks += 1;
        if t.silent_ticks > WIRE_NO_RESPONSE_TIMEOUT {
            t.finish();
            events.no_response(earbud);
        }
    }

    fn handle_received<E: WireEvents>(&mut self, earbud: Earbud, received: Received, events: &mut E) {
        let i = earbud.index();
        let t = &mut self.transactions[i];
        t.silent_ticks = 0;

        let fresh = received.seq == t.nesn;
        if fresh {
            t.nesn = !t.nesn;
        }

        if received.nesn == t.seq {
            warn!("NACK! ({})", earbud.letter());
            t.nack_count += 1;
            let resync = t.nack_count >= WIRE_MAX_NACKS;
            if resync {
                if t.resyncs >= WIRE_MAX_RESYNCS {
                    debug!("Retries exhausted ({})", earbud.letter());
                    t.finish();
                    events.give_up(earbud);
                    return;
                }
                t.resyncs += 1;
                t.nack_count = 0;
                t.resend = true;
            }
            events.nack(earbud);

            if resync {
                self.broadcast = BroadcastSession {
                    active: true,
                    internal: true,
                    ..Default::default()
                };
            } else if self.transport.is_active() {
                self.transactions[i].resend = true;
            } else {
                self.send(earbud);
            }
            return;
        }

        t.seq = !t.seq;

        if fresh && !received.payload.is_empty() {
            self.send_ack(earbud);
            self.transactions[i].finish();
            events.rx(earbud, &received.payload);
        } else {
            t.finish();
            events.ack(earbud);
        }
    }

    fn send(&mut self, earbud: Earbud) {
        let t = &mut self.transactions[earbud.index()];
        t.silent_ticks = 0;
        let header = FrameHeader::new(
            t.seq,
            t.nesn,
            Destination::from(earbud).address(),
            t.payload.len(),
        );
        match frame::encode(&header, &t.payload) {
            Ok(bytes) => {
                self.deframer.reset();
                self.transport.transmit(earbud.into(), &bytes);
            }
            Err(e) => warn!("Frame error ({}): {:?}", earbud.letter(), e),
        }
    }

    fn send_ack(&mut self, earbud: Earbud) {
        if self.transport.is_active() {
            debug!("ACK skipped ({})", earbud.letter());
            return;
        }

        let t = &mut self.transactions[earbud.index()];
        let header = FrameHeader::new(t.seq, t.nesn, Destination::from(earbud).address(), 0);
        if let Ok(bytes) = frame::encode(&header, &[]) {
            self.deframer.reset();
            self.transport.transmit(earbud.into(), &bytes);
            t.seq = !t.seq;
        }
    }

    fn send_broadcast(&mut self) {
        let b = &mut self.broadcast;
        b.count += 1;
        b.timeout = WIRE_BROADCAST_TIMEOUT;

        let header = FrameHeader::new(false, false, Destination::Broadcast.address(), b.payload.len());
        match frame::encode(&header, &b.payload) {
            Ok(bytes) => self.transport.transmit(Destination::Broadcast, &bytes),
            Err(e) => warn!("Frame error (B): {:?}", e),
        }

        // Earbuds restart their sequence bits on every broadcast
        for t in self.transactions.iter_mut() {
            t.seq = false;
            t.nesn = false;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::FrameBuf;

    #[cfg(feature = "scheme-a")]
    macro_rules! v {
        (a: [$($a:expr),*], b: [$($b:expr),*]) => {{
            let bytes: &[u8] = &[$($a),*];
            bytes
        }};
    }

    #[cfg(not(feature = "scheme-a"))]
    macro_rules! v {
        (a: [$($a:expr),*], b: [$($b:expr),*]) => {{
            let bytes: &[u8] = &[$($b),*];
            bytes
        }};
    }

    pub(crate) use v;

    #[derive(Default)]
    pub(crate) struct TestTransport {
        pub active: bool,
        pub sent: Vec<(Destination, FrameBuf), 32>,
    }

    impl TestTransport {
        pub fn last(&self) -> &[u8] {
            self.sent.last().map(|(_, f)| &f[..]).unwrap_or(&[])
        }
    }

    impl Transport for TestTransport {
        fn transmit(&mut self, dest: Destination, frame: &[u8]) {
            self.sent
                .push((dest, Vec::from_slice(frame).unwrap()))
                .unwrap();
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    #[derive(Default)]
    struct Recorder {
        rx: Vec<(Earbud, Vec<u8, 32>), 4>,
        ack: [u8; 2],
        nack: [u8; 2],
        give_up: [u8; 2],
        no_response: [u8; 2],
        abort: [u8; 2],
        broadcast_finished: u8,
    }

    impl WireEvents for Recorder {
        fn rx(&mut self, earbud: Earbud, data: &[u8]) {
            self.rx.push((earbud, Vec::from_slice(data).unwrap())).unwrap();
        }
        fn ack(&mut self, earbud: Earbud) {
            self.ack[earbud.index()] += 1;
        }
        fn nack(&mut self, earbud: Earbud) {
            self.nack[earbud.index()] += 1;
        }
        fn give_up(&mut self, earbud: Earbud) {
            self.give_up[earbud.index()] += 1;
        }
        fn no_response(&mut self, earbud: Earbud) {
            self.no_response[earbud.index()] += 1;
        }
        fn abort(&mut self, earbud: Earbud) {
            self.abort[earbud.index()] += 1;
        }
        fn broadcast_finished(&mut self) {
            self.broadcast_finished += 1;
        }
    }

    fn setup() -> (Wire<TestTransport>, Recorder) {
        (Wire::new(TestTransport::default()), Recorder::default())
    }

    fn ack_frame() -> &'static [u8] {
        v!(a: [0x41, 0xBB], b: [0x40, 0x02, 0xCF, 0x7E])
    }

    fn nack_frame() -> &'static [u8] {
        v!(a: [0x01, 0x0E], b: [0x00, 0x02, 0xC2, 0xB2])
    }

    fn left_status_request() -> &'static [u8] {
        v!(a: [0x22, 0x03, 0x0F], b: [0x20, 0x03, 0x03, 0xD0, 0x95])
    }

    fn left_poll() -> &'static [u8] {
        v!(a: [0xE1, 0xE1], b: [0xE0, 0x02, 0xD2, 0x00])
    }

    fn link_users(wire: &Wire<TestTransport>) -> usize {
        [wire.is_busy(Earbud::Left), wire.is_busy(Earbud::Right), wire.is_broadcasting()]
            .iter()
            .filter(|b| **b)
            .count()
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut wire, mut ev) = setup();
        let data = [0u8; WIRE_MAX_PAYLOAD + 1];
        assert_eq!(wire.tx(Destination::Left, &data, &mut ev), Err(WireError::TooLarge));
        assert_eq!(wire.tx(Destination::Broadcast, &data, &mut ev), Err(WireError::TooLarge));
        assert!(wire.transport().sent.is_empty());
    }

    #[test]
    fn test_left_status_request_exchange() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        assert_eq!(wire.transport().last(), left_status_request());

        wire.rx(Earbud::Left, ack_frame());
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [1, 0]);
        assert!(!wire.is_busy(Earbud::Left));

        wire.tx(Destination::Left, &[], &mut ev).unwrap();
        assert_eq!(wire.transport().last(), left_poll());

        wire.rx(
            Earbud::Left,
            v!(a: [0x84, 0x01, 0x00, 0x21, 0x94], b: [0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]),
        );
        wire.periodic(&mut ev);
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x21, 0x8D], b: [0x20, 0x02, 0xC4, 0x54])
        );
        assert_eq!(ev.rx.len(), 1);
        assert_eq!(ev.rx[0].0, Earbud::Left);
        assert_eq!(&ev.rx[0].1[..], &[0x01, 0x00, 0x21]);
        assert!(!wire.is_busy(Earbud::Left));
    }

    #[test]
    fn test_right_status_request_exchange() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Right, &[0x03], &mut ev).unwrap();
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x12, 0x03, 0x18], b: [0x10, 0x03, 0x03, 0x15, 0x30])
        );

        wire.rx(Earbud::Right, ack_frame());
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [0, 1]);

        wire.tx(Destination::Right, &[], &mut ev).unwrap();
        assert_eq!(
            wire.transport().last(),
            v!(a: [0xD1, 0xFA], b: [0xD0, 0x02, 0xD7, 0x95])
        );

        wire.rx(
            Earbud::Right,
            v!(a: [0x84, 0x01, 0x00, 0x2B, 0xCB], b: [0x80, 0x05, 0x01, 0x00, 0x2B, 0xD2, 0x5F]),
        );
        wire.periodic(&mut ev);
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x11, 0x96], b: [0x10, 0x02, 0xC1, 0xC1])
        );
        assert_eq!(&ev.rx[0].1[..], &[0x01, 0x00, 0x2B]);
    }

    #[test]
    fn test_nack_retransmits_with_same_sequence() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        wire.rx(Earbud::Left, nack_frame());
        wire.periodic(&mut ev);
        assert_eq!(ev.nack, [1, 0]);
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x62, 0x03, 0x3B], b: [0x60, 0x03, 0x03, 0xCD, 0x38])
        );
        assert!(wire.is_busy(Earbud::Left));

        wire.rx(Earbud::Left, ack_frame());
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [1, 0]);

        wire.tx(Destination::Left, &[], &mut ev).unwrap();
        assert_eq!(wire.transport().last(), left_poll());
    }

    #[test]
    fn test_repeated_nacks_resync_sequence_bits() {
        let (mut wire, mut ev) = setup();
        let resync = v!(a: [0x31, 0x15], b: [0x30, 0x02, 0xC7, 0x27]);

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        for _ in 0..WIRE_MAX_NACKS - 1 {
            wire.rx(Earbud::Left, nack_frame());
            wire.periodic(&mut ev);
        }
        let sent = wire.transport().sent.len();

        wire.rx(Earbud::Left, nack_frame());
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), sent);
        assert!(wire.is_broadcasting());

        for repeat in 0..WIRE_BROADCAST_REPEATS {
            if repeat > 0 {
                for _ in 0..WIRE_BROADCAST_TIMEOUT {
                    wire.periodic(&mut ev);
                }
            }
            wire.periodic(&mut ev);
            assert_eq!(wire.transport().last(), resync);
        }
        assert!(!wire.is_broadcasting());
        assert_eq!(wire.transport().sent.len(), sent + WIRE_BROADCAST_REPEATS as usize);
        assert_eq!(ev.broadcast_finished, 0);
        assert_eq!(ev.abort, [0, 0]);

        // First frame again, sequence bits back at zero
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().last(), left_status_request());

        wire.rx(Earbud::Left, ack_frame());
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [1, 0]);
        assert_eq!(ev.nack, [3, 0]);
        wire.tx(Destination::Left, &[], &mut ev).unwrap();
        assert_eq!(wire.transport().last(), left_poll());
    }

    #[test]
    fn test_next_request_follows_ack_frame() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        wire.rx(Earbud::Left, ack_frame());
        wire.periodic(&mut ev);
        wire.tx(Destination::Left, &[], &mut ev).unwrap();
        wire.rx(
            Earbud::Left,
            v!(a: [0x84, 0x01, 0x00, 0x21, 0x94], b: [0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15]),
        );
        wire.periodic(&mut ev);
        assert_eq!(ev.rx.len(), 1);

        // The earbud counted our ACK frame, so the next request moves on
        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        let (header, payload) = frame::decode(wire.transport().last()).unwrap();
        assert!(header.seq);
        assert!(!header.nesn);
        assert_eq!(payload, &[0x03]);
    }

    #[test]
    fn test_persistent_nacks_give_up() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        for _ in 0..500 {
            if ev.give_up[0] > 0 {
                break;
            }
            wire.rx(Earbud::Left, nack_frame());
            wire.periodic(&mut ev);
        }

        assert_eq!(ev.give_up, [1, 0]);
        assert_eq!(ev.nack[0], WIRE_MAX_NACKS * (WIRE_MAX_RESYNCS + 1) - 1);
        assert_eq!(ev.broadcast_finished, 0);
        assert!(!wire.is_busy(Earbud::Left));
        assert!(!wire.is_broadcasting());
    }

    #[test]
    fn test_checksum_failures_give_up() {
        let (mut wire, mut ev) = setup();
        let mut corrupt = [0u8; 8];
        corrupt[..ack_frame().len()].copy_from_slice(ack_frame());
        corrupt[ack_frame().len() - 1] ^= 0xFF;
        let corrupt = &corrupt[..ack_frame().len()];

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();

        wire.rx(Earbud::Left, corrupt);
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 2);
        assert_eq!(wire.transport().last(), left_status_request());

        wire.rx(Earbud::Left, corrupt);
        wire.transport_mut().active = true;
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 2);
        wire.transport_mut().active = false;
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 3);

        wire.rx(Earbud::Left, corrupt);
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 3);
        assert_eq!(ev.give_up, [1, 0]);
        assert!(!wire.is_busy(Earbud::Left));
    }

    #[test]
    fn test_no_response_is_bounded() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Right, &[0x03], &mut ev).unwrap();
        for _ in 0..WIRE_NO_RESPONSE_TIMEOUT {
            wire.periodic(&mut ev);
        }
        assert_eq!(ev.no_response, [0, 0]);
        assert!(wire.is_busy(Earbud::Right));

        wire.periodic(&mut ev);
        assert_eq!(ev.no_response, [0, 1]);
        assert!(!wire.is_busy(Earbud::Right));
        assert_eq!(wire.transport().sent.len(), 1);
    }

    #[test]
    fn test_busy_peers_block_unicast() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        assert_eq!(wire.tx(Destination::Right, &[0x03], &mut ev), Err(WireError::Busy));
        assert_eq!(wire.tx(Destination::Left, &[0x03], &mut ev), Err(WireError::Busy));
        assert_eq!(wire.transport().sent.len(), 1);

        let (mut wire, mut ev) = setup();
        wire.transport_mut().active = true;
        assert_eq!(
            wire.tx(Destination::Left, &[0x03], &mut ev),
            Err(WireError::TransportActive)
        );
        assert!(!wire.is_busy(Earbud::Left));
    }

    #[test]
    fn test_broadcast_preempts_unicast() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        wire.tx(Destination::Broadcast, &[0x00, 0x01], &mut ev).unwrap();
        assert_eq!(ev.abort, [1, 0]);
        assert!(!wire.is_busy(Earbud::Left));
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x33, 0x00, 0x01, 0x3D], b: [0x30, 0x04, 0x00, 0x01, 0x9B, 0x37])
        );
        assert_eq!(wire.transport().sent.last().unwrap().0, Destination::Broadcast);

        assert_eq!(
            wire.tx(Destination::Right, &[0x03], &mut ev),
            Err(WireError::BroadcastActive)
        );
        assert_eq!(
            wire.tx(Destination::Broadcast, &[0x00, 0x02], &mut ev),
            Err(WireError::BroadcastActive)
        );

        for repeat in 2..=WIRE_BROADCAST_REPEATS as usize {
            for _ in 0..WIRE_BROADCAST_TIMEOUT {
                wire.periodic(&mut ev);
            }
            assert_eq!(wire.transport().sent.len(), repeat);
            wire.periodic(&mut ev);
            assert_eq!(wire.transport().sent.len(), repeat + 1);
        }
        assert_eq!(ev.broadcast_finished, 1);
        assert!(!wire.is_broadcasting());

        wire.tx(Destination::Right, &[0x03], &mut ev).unwrap();
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x12, 0x03, 0x18], b: [0x10, 0x03, 0x03, 0x15, 0x30])
        );
    }

    #[test]
    fn test_broadcast_waits_for_transport() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Broadcast, &[0x00, 0x02], &mut ev).unwrap();
        for _ in 0..WIRE_BROADCAST_TIMEOUT {
            wire.periodic(&mut ev);
        }
        wire.transport_mut().active = true;
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 1);
        wire.transport_mut().active = false;
        wire.periodic(&mut ev);
        assert_eq!(wire.transport().sent.len(), 2);
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x33, 0x00, 0x02, 0xFE], b: [0x30, 0x04, 0x00, 0x02, 0xAB, 0x54])
        );
    }

    #[test]
    fn test_broadcast_resets_sequence_bits() {
        let (mut wire, mut ev) = setup();

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        wire.rx(Earbud::Left, ack_frame());
        wire.periodic(&mut ev);

        wire.tx(Destination::Broadcast, &[0x00, 0x01], &mut ev).unwrap();
        while wire.is_broadcasting() {
            wire.periodic(&mut ev);
        }

        wire.tx(Destination::Left, &[], &mut ev).unwrap();
        assert_eq!(
            wire.transport().last(),
            v!(a: [0x21, 0x8D], b: [0x20, 0x02, 0xC4, 0x54])
        );
    }

    #[test]
    fn test_received_bytes_go_to_busy_earbud() {
        let (mut wire, mut ev) = setup();

        // Nobody is waiting: dropped
        for byte in ack_frame() {
            wire.receive(*byte);
        }
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [0, 0]);

        wire.tx(Destination::Right, &[0x03], &mut ev).unwrap();
        for byte in ack_frame() {
            wire.receive(*byte);
        }
        wire.periodic(&mut ev);
        assert_eq!(ev.ack, [0, 1]);
    }

    #[test]
    fn test_single_link_user() {
        let (mut wire, mut ev) = setup();
        assert_eq!(link_users(&wire), 0);

        wire.tx(Destination::Left, &[0x03], &mut ev).unwrap();
        assert_eq!(link_users(&wire), 1);
        let _ = wire.tx(Destination::Right, &[0x03], &mut ev);
        assert_eq!(link_users(&wire), 1);

        wire.tx(Destination::Broadcast, &[0x00, 0x05], &mut ev).unwrap();
        assert_eq!(link_users(&wire), 1);

        for _ in 0..3 * (WIRE_BROADCAST_TIMEOUT as usize + 1) {
            wire.periodic(&mut ev);
            assert!(link_users(&wire) <= 1);
        }
        assert_eq!(link_users(&wire), 0);
    }
}
