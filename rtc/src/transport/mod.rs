//! C4 — transport base: the two-way message relay every layer of the
//! ICE -> DTLS -> {SCTP | DTLS-SRTP} stack is built from (spec §4.3-§4.6).
//!
//! Each transport owns an inbox (C2 queue) fed by its recv task, and an
//! upper-wiring closure it calls to hand decoded messages to the layer
//! above -- "upper wiring is a closure held by the lower" (spec §9). State
//! changes go through a synchronized callback slot so a transport can be
//! torn down without racing a caller mid-callback.

pub mod dtls;
pub mod dtls_srtp;
pub mod ice;
pub mod sctp;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::message::Message;

/// State shared by every layer of the stack (spec §4.3: "Events (state)").
/// Not every transport visits every variant (ICE alone distinguishes
/// `Connected`/`Completed`; SCTP/DTLS never emit `Completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Completed = 3,
    Disconnected = 4,
    Failed = 5,
    Closed = 6,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransportState::New,
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Completed,
            4 => TransportState::Disconnected,
            5 => TransportState::Failed,
            _ => TransportState::Closed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    pub fn is_up(self) -> bool {
        matches!(self, TransportState::Connected | TransportState::Completed)
    }
}

type StateCallback = Box<dyn Fn(TransportState) + Send + Sync>;
type UpperSink = Box<dyn Fn(Message) + Send + Sync>;

/// Shared plumbing for every transport layer: atomic state, a replaceable
/// state-change callback, and a closure wired to the layer above.
///
/// `ArcSwapOption` gives atomic install/replace semantics for the callback
/// slots (spec §9 "synchronized callback slot") without a lock on the
/// per-packet hot path.
pub struct TransportBase {
    state: AtomicU8,
    on_state_change: ArcSwapOption<StateCallback>,
    upper: ArcSwapOption<UpperSink>,
}

impl Default for TransportBase {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBase {
    pub fn new() -> Self {
        TransportBase {
            state: AtomicU8::new(TransportState::New as u8),
            on_state_change: ArcSwapOption::from(None),
            upper: ArcSwapOption::from(None),
        }
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Sets the new state and fires the callback iff it actually changed --
    /// state changes are idempotent no-ops from the caller's perspective.
    pub fn set_state(&self, new_state: TransportState) {
        let prev = self.state.swap(new_state as u8, Ordering::SeqCst);
        if prev != new_state as u8 {
            log::debug!(
                "transport state: {:?} -> {:?}",
                TransportState::from_u8(prev),
                new_state
            );
            if let Some(cb) = self.on_state_change.load_full() {
                cb(new_state);
            }
        }
    }

    pub fn on_state_change(&self, cb: impl Fn(TransportState) + Send + Sync + 'static) {
        self.on_state_change.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn clear_callbacks(&self) {
        self.on_state_change.store(None);
        self.upper.store(None);
    }

    pub fn wire_upper(&self, sink: impl Fn(Message) + Send + Sync + 'static) {
        self.upper.store(Some(Arc::new(Box::new(sink))));
    }

    /// Hands a decoded message to whatever layer is wired above us. A
    /// missing sink (not yet wired, or already torn down) silently drops
    /// the message -- consistent with §7's "errors on a single incoming
    /// packet are logged+counted and dropped".
    pub fn deliver_up(&self, msg: Message) {
        if let Some(sink) = self.upper.load_full() {
            sink(msg);
        } else {
            log::trace!("dropping message: no upper layer wired");
        }
    }
}
