//! C9 — data channel: stream-id allocation, DCEP open/ack, and the
//! buffered-amount-low edge trigger (spec §4.7).

pub mod dcep;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::queue::Queue;
use crate::reliability::Reliability;
use crate::transport::sctp::SctpTransport;

/// Stream-id parity a side allocates on, derived from the DTLS/SCTP setup
/// role (spec §4.7): the offerer-until-answered side assumes `Passive`
/// (odd ids); once negotiation resolves, the `Active` side allocates even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityRole {
    Active,
    Passive,
}

impl ParityRole {
    fn wants_even(self) -> bool {
        matches!(self, ParityRole::Active)
    }
}

const MAX_STREAM_ID: u16 = 65534;
const INVALID_STREAM_ID: u16 = 65535;

/// Owns stream-id allocation and the live stream -> channel map for one
/// connection. Lives on the `PeerConnection` (spec §3: "data_channels :
/// map<u16, weak DataChannel>").
pub struct DataChannelRegistry {
    role: Mutex<ParityRole>,
    channels: Mutex<HashMap<u16, Weak<DataChannel>>>,
}

impl Default for DataChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataChannelRegistry {
    pub fn new() -> Self {
        DataChannelRegistry {
            // Offerer-until-answered assumes Passive (spec §4.7).
            role: Mutex::new(ParityRole::Passive),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> ParityRole {
        *self.role.lock().unwrap()
    }

    /// Called once negotiation resolves to `Active`/`Passive`. If the role
    /// actually changes to `Active`, shifts every still-unopened,
    /// non-user-supplied channel from its assumed odd id down to the
    /// matching even id (spec §4.7, §8 "stream parity", §9 regression note).
    pub fn set_role(&self, new_role: ParityRole) {
        let old_role = {
            let mut role = self.role.lock().unwrap();
            let old = *role;
            *role = new_role;
            old
        };
        if old_role == new_role || new_role != ParityRole::Active {
            return;
        }
        self.compact();
        let mut channels = self.channels.lock().unwrap();
        let to_shift: Vec<(u16, Arc<DataChannel>)> = channels
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|c| (*id, c)))
            .filter(|(id, c)| id % 2 == 1 && !c.is_open() && !c.user_supplied_id())
            .collect();
        for (old_id, channel) in to_shift {
            let new_id = old_id - 1;
            channels.remove(&old_id);
            channel.set_stream(new_id);
            channels.insert(new_id, Arc::downgrade(&channel));
        }
    }

    /// Allocates a stream id. Honors a caller-supplied `requested` id
    /// verbatim (spec §4.7); otherwise walks up from 0 on the current
    /// role's parity, skipping ids already in use, up to `MAX_STREAM_ID`.
    /// `65535` is never valid (spec §8).
    pub fn allocate(&self, requested: Option<u16>) -> Result<u16> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(id) = requested {
            if id == INVALID_STREAM_ID {
                return Err(Error::invalid("stream id 65535 is reserved and never valid"));
            }
            if channels.contains_key(&id) {
                return Err(Error::invalid(format!("stream id {id} already in use")));
            }
            return Ok(id);
        }
        let wants_even = self.role.lock().unwrap().wants_even();
        let mut id = if wants_even { 0u16 } else { 1u16 };
        loop {
            if id > MAX_STREAM_ID {
                return Err(Error::resource("no free data channel stream ids"));
            }
            if !channels.contains_key(&id) {
                return Ok(id);
            }
            id += 2;
        }
    }

    pub fn insert(&self, id: u16, channel: &Arc<DataChannel>) {
        self.channels.lock().unwrap().insert(id, Arc::downgrade(channel));
    }

    pub fn remove(&self, id: u16) {
        self.channels.lock().unwrap().remove(&id);
    }

    pub fn get(&self, id: u16) -> Option<Arc<DataChannel>> {
        self.channels.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }

    /// Drops map entries whose channel the user has already released.
    pub fn compact(&self) {
        self.channels.lock().unwrap().retain(|_, weak| weak.strong_count() > 0);
    }

    /// `true` if `id`'s parity matches what a remote-initiated OPEN on this
    /// side should use (the opposite parity of our own allocation role).
    pub fn is_remote_initiated_parity(&self, id: u16) -> bool {
        let ours_even = self.role.lock().unwrap().wants_even();
        let id_even = id % 2 == 0;
        id_even != ours_even
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

type VoidCallback = Box<dyn Fn() + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;
type MessageCallback = Box<dyn Fn(Message) + Send + Sync>;

/// A single SCTP-backed data channel (spec §3 "DataChannel", §4.7).
pub struct DataChannel {
    stream: Mutex<u16>,
    user_supplied_id: bool,
    label: String,
    protocol: String,
    reliability: Reliability,
    negotiated: bool,
    state: Mutex<DataChannelState>,
    recv_queue: Arc<Queue<Message>>,
    sctp: Mutex<Weak<SctpTransport>>,
    buffered_amount: AtomicUsize,
    buffered_amount_low_threshold: AtomicUsize,
    was_at_or_above_threshold: AtomicBool,
    on_open: ArcSwapOption<VoidCallback>,
    on_closed: ArcSwapOption<VoidCallback>,
    on_error: ArcSwapOption<ErrorCallback>,
    on_message: ArcSwapOption<MessageCallback>,
    on_buffered_amount_low: ArcSwapOption<VoidCallback>,
}

impl DataChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: u16,
        user_supplied_id: bool,
        label: impl Into<String>,
        protocol: impl Into<String>,
        reliability: Reliability,
        negotiated: bool,
        initial_state: DataChannelState,
    ) -> Arc<Self> {
        Arc::new(DataChannel {
            stream: Mutex::new(stream),
            user_supplied_id,
            label: label.into(),
            protocol: protocol.into(),
            reliability,
            negotiated,
            state: Mutex::new(initial_state),
            recv_queue: Arc::new(Queue::with_amount_fn(16 * 1024 * 1024, |m: &Message| m.len())),
            sctp: Mutex::new(Weak::new()),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low_threshold: AtomicUsize::new(0),
            was_at_or_above_threshold: AtomicBool::new(false),
            on_open: ArcSwapOption::from(None),
            on_closed: ArcSwapOption::from(None),
            on_error: ArcSwapOption::from(None),
            on_message: ArcSwapOption::from(None),
            on_buffered_amount_low: ArcSwapOption::from(None),
        })
    }

    pub fn stream(&self) -> u16 {
        *self.stream.lock().unwrap()
    }

    pub(crate) fn set_stream(&self, id: u16) {
        *self.stream.lock().unwrap() = id;
    }

    pub(crate) fn user_supplied_id(&self) -> bool {
        self.user_supplied_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn reliability(&self) -> &Reliability {
        &self.reliability
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock().unwrap() == DataChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == DataChannelState::Closed
    }

    /// Negotiated MTU for a single message: the SCTP association's
    /// practical ceiling, independent of the current path MTU (the
    /// transports below fragment/reassemble at the record layer).
    pub fn max_message_size(&self) -> usize {
        256 * 1024
    }

    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low_threshold.store(threshold, Ordering::SeqCst);
    }

    pub fn on_open(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_open.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_closed(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_closed.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_error(&self, cb: impl Fn(&Error) + Send + Sync + 'static) {
        self.on_error.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_message(&self, cb: impl Fn(Message) + Send + Sync + 'static) {
        self.on_message.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_buffered_amount_low(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_buffered_amount_low.store(Some(Arc::new(Box::new(cb))));
    }

    /// Blocks for the next user message, for callers that poll instead of
    /// registering [`Self::on_message`]. Returns `None` once closed.
    pub fn recv(&self) -> Option<Message> {
        self.recv_queue.pop()
    }

    pub(crate) fn attach_sctp(&self, sctp: &Arc<SctpTransport>) {
        *self.sctp.lock().unwrap() = Arc::downgrade(sctp);
    }

    /// Sends the DCEP OPEN: only the creating side does this, once SCTP is
    /// connected (spec §4.7). Negotiated (pre-agreed id) channels skip DCEP
    /// entirely and are considered open immediately.
    pub(crate) fn start_handshake(self: &Arc<Self>) -> Result<()> {
        if self.negotiated {
            *self.state.lock().unwrap() = DataChannelState::Open;
            self.fire_open();
            return Ok(());
        }
        let open = dcep::Open {
            reliability: self.reliability.clone(),
            priority: 0,
            label: self.label.clone(),
            protocol: self.protocol.clone(),
        };
        self.send_control(open.encode())
    }

    /// Accepts a remote-initiated OPEN: replies with ACK and immediately
    /// opens (spec §4.7).
    pub(crate) fn accept_remote_open(self: &Arc<Self>) -> Result<()> {
        self.send_control(dcep::encode_ack())?;
        *self.state.lock().unwrap() = DataChannelState::Open;
        self.fire_open();
        Ok(())
    }

    fn send_control(&self, payload: Vec<u8>) -> Result<()> {
        let sctp = self.sctp.lock().unwrap().upgrade().ok_or(Error::Closed)?;
        sctp.send(&Message::control(payload, self.stream()))
    }

    fn fire_open(&self) {
        if let Some(cb) = self.on_open.load_full() {
            cb();
        }
    }

    /// Dispatches one message arriving on this channel's stream: Control
    /// messages drive the DCEP/close state machine, everything else is a
    /// user payload (spec §4.7).
    pub(crate) fn handle_incoming(self: &Arc<Self>, msg: Message) {
        if msg.kind == MessageKind::Control {
            self.handle_control(msg);
            return;
        }
        self.recv_queue.push(msg.clone());
        if let Some(cb) = self.on_message.load_full() {
            cb(msg);
        }
    }

    fn handle_control(self: &Arc<Self>, msg: Message) {
        let Some(&first) = msg.buffer.first() else { return };
        match first {
            dcep::DCEP_ACK => {
                log::debug!("data channel {:?} (stream {}) acked, now open", self.label, self.stream());
                *self.state.lock().unwrap() = DataChannelState::Open;
                self.fire_open();
            }
            dcep::DCEP_CLOSE => {
                log::debug!("data channel {:?} (stream {}) closed by peer", self.label, self.stream());
                *self.state.lock().unwrap() = DataChannelState::Closed;
                if let Some(cb) = self.on_closed.load_full() {
                    cb();
                }
            }
            other => {
                // DATA_CHANNEL_OPEN on an already-known stream shouldn't
                // reach here -- the registry routes fresh OPENs before
                // a DataChannel object even exists; drop defensively.
                log::debug!("dropping unexpected DCEP control byte {} on stream {}", other, self.stream());
            }
        }
    }

    /// Queues `msg` for send. Fails with `Closed` if the channel isn't
    /// `Open` (spec §7: "a failure to resend after Closed").
    pub fn send(self: &Arc<Self>, msg: Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let sctp = self.sctp.lock().unwrap().upgrade().ok_or(Error::Closed)?;
        let mut msg = msg;
        msg.stream = self.stream();
        msg.reliability = Some(self.reliability.clone());
        let len = msg.len();
        self.buffered_amount.fetch_add(len, Ordering::SeqCst);
        let result = sctp.send(&msg);
        self.note_buffered_amount_drained(len);
        if let Err(e) = &result {
            if let Some(cb) = self.on_error.load_full() {
                cb(e);
            }
        }
        result
    }

    pub fn send_text(self: &Arc<Self>, text: impl Into<String>) -> Result<()> {
        self.send(Message::string(text, self.stream()))
    }

    pub fn send_binary(self: &Arc<Self>, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Message::binary(data, self.stream()))
    }

    /// Since sends here are synchronous (spec §5: SCTP send may suspend on
    /// its outbound window, but this wrapper has no queueing of its own
    /// beyond that), `buffered_amount` is only ever transiently non-zero for
    /// the duration of one send; this is still the edge-trigger the spec
    /// requires (§4.7 "every time buffered_amount transitions from >=
    /// threshold to < threshold").
    fn note_buffered_amount_drained(&self, sent_len: usize) {
        self.buffered_amount.fetch_sub(sent_len, Ordering::SeqCst);
        let threshold = self.buffered_amount_low_threshold.load(Ordering::SeqCst);
        let now = self.buffered_amount.load(Ordering::SeqCst);
        let was_above = self.was_at_or_above_threshold.swap(now >= threshold, Ordering::SeqCst);
        if was_above && now < threshold {
            if let Some(cb) = self.on_buffered_amount_low.load_full() {
                cb();
            }
        }
    }

    /// Local close: sends an outgoing SCTP stream reset. The resulting
    /// DCEP CLOSE the peer synthesizes is one-directional, so this side
    /// transitions straight to `Closed` once the reset is sent.
    pub fn close(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == DataChannelState::Closed {
            return;
        }
        *state = DataChannelState::Closing;
        drop(state);
        if let Some(sctp) = self.sctp.lock().unwrap().upgrade() {
            let _ = sctp.reset_stream(self.stream());
        }
        *self.state.lock().unwrap() = DataChannelState::Closed;
        self.recv_queue.stop();
        if let Some(cb) = self.on_closed.load_full() {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_honors_user_supplied_id() {
        let registry = DataChannelRegistry::new();
        assert_eq!(registry.allocate(Some(1)).unwrap(), 1);
    }

    #[test]
    fn allocate_rejects_stream_id_65535() {
        let registry = DataChannelRegistry::new();
        assert!(registry.allocate(Some(65535)).is_err());
    }

    #[test]
    fn passive_role_allocates_odd_ids_skipping_used() {
        let registry = DataChannelRegistry::new();
        assert_eq!(registry.allocate(None).unwrap(), 1);
        let ch = DataChannel::new(1, false, "a", "", Reliability::default(), false, DataChannelState::Opening);
        registry.insert(1, &ch);
        assert_eq!(registry.allocate(None).unwrap(), 3);
    }

    #[test]
    fn active_role_allocates_even_ids() {
        let registry = DataChannelRegistry::new();
        registry.set_role(ParityRole::Active);
        assert_eq!(registry.allocate(None).unwrap(), 0);
    }

    #[test]
    fn set_role_active_shifts_unopened_odd_channels_to_even() {
        let registry = DataChannelRegistry::new();
        let id = registry.allocate(None).unwrap();
        assert_eq!(id, 1);
        let ch = DataChannel::new(id, false, "test", "", Reliability::default(), false, DataChannelState::Opening);
        registry.insert(id, &ch);

        registry.set_role(ParityRole::Active);

        assert_eq!(ch.stream(), 0);
        assert!(registry.get(0).is_some());
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn set_role_active_does_not_shift_already_open_channels() {
        let registry = DataChannelRegistry::new();
        let ch = DataChannel::new(1, false, "test", "", Reliability::default(), false, DataChannelState::Open);
        registry.insert(1, &ch);

        registry.set_role(ParityRole::Active);

        assert_eq!(ch.stream(), 1);
    }

    #[test]
    fn set_role_active_does_not_shift_user_supplied_ids() {
        let registry = DataChannelRegistry::new();
        let ch = DataChannel::new(1, true, "negotiated", "", Reliability::default(), true, DataChannelState::Open);
        registry.insert(1, &ch);

        registry.set_role(ParityRole::Active);

        assert_eq!(ch.stream(), 1);
    }

    #[test]
    fn is_remote_initiated_parity_is_opposite_of_our_role() {
        let registry = DataChannelRegistry::new(); // Passive: we allocate odd
        assert!(registry.is_remote_initiated_parity(2)); // even => remote-initiated
        assert!(!registry.is_remote_initiated_parity(1)); // odd => ours
    }

    #[test]
    fn negotiated_channel_opens_without_dcep() {
        let ch = DataChannel::new(1, true, "negotiated", "", Reliability::default(), true, DataChannelState::Opening);
        ch.start_handshake().unwrap();
        assert!(ch.is_open());
    }

    #[test]
    fn buffered_amount_low_fires_once_per_crossing() {
        let ch = DataChannel::new(1, false, "t", "", Reliability::default(), false, DataChannelState::Open);
        ch.set_buffered_amount_low_threshold(100);
        ch.buffered_amount.store(200, Ordering::SeqCst);
        ch.was_at_or_above_threshold.store(true, Ordering::SeqCst);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        ch.on_buffered_amount_low(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        ch.note_buffered_amount_drained(150);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Already below threshold: no repeat firing on another drain below it.
        ch.buffered_amount.store(10, Ordering::SeqCst);
        ch.note_buffered_amount_drained(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
