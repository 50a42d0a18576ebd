//! C10 — Track and the media handler chain (spec §4.8).

pub mod handlers;
pub mod rtcp;
pub mod rtp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;

use crate::description::MediaEntry;
use crate::error::Result;
use crate::message::Message;
use crate::transport::dtls_srtp::DtlsSrtpTransport;

/// A sink handlers use for out-of-band replies (SR, NACK, PLI...), spec
/// §4.8 "a `send(Message)` sink for out-of-band replies".
pub type SendFn<'a> = dyn FnMut(Message) + 'a;

/// One link of the singly-linked media handler chain (spec §4.8/§4.9).
///
/// Handlers are free to transform, split, or drop entries; order among
/// surviving messages is preserved. `request_keyframe`/`request_bitrate`
/// walk toward the tail until a handler returns `true`, meaning it handled
/// the request.
pub trait MediaHandler: Send + Sync {
    fn on_media(&self, _description: &MediaEntry) {}

    fn incoming(&self, msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        msgs
    }

    fn outgoing(&self, msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        msgs
    }

    fn request_keyframe(&self, _send: &mut SendFn) -> bool {
        false
    }

    fn request_bitrate(&self, _bps: u64, _send: &mut SendFn) -> bool {
        false
    }
}

/// A mutex-guarded singly-linked chain. Mutation (push) takes the lock;
/// traversal clones the `Arc` head and walks lock-free (spec §4.10
/// "shared-resource policy": "per-handler chain mutation takes an internal
/// mutex; traversal is lock-free via shared ownership of the head").
#[derive(Default)]
pub struct HandlerChain {
    head: Mutex<Vec<Arc<dyn MediaHandler>>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        HandlerChain::default()
    }

    pub fn push(&self, handler: Arc<dyn MediaHandler>) {
        self.head.lock().unwrap().push(handler);
    }

    fn snapshot(&self) -> Vec<Arc<dyn MediaHandler>> {
        self.head.lock().unwrap().clone()
    }

    pub fn on_media(&self, description: &MediaEntry) {
        for h in self.snapshot() {
            h.on_media(description);
        }
    }

    pub fn incoming(&self, mut msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        for h in self.snapshot() {
            msgs = h.incoming(msgs, send);
        }
        msgs
    }

    pub fn outgoing(&self, mut msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        for h in self.snapshot() {
            msgs = h.outgoing(msgs, send);
        }
        msgs
    }

    pub fn request_keyframe(&self, send: &mut SendFn) -> bool {
        self.snapshot().iter().any(|h| h.request_keyframe(send))
    }

    pub fn request_bitrate(&self, bps: u64, send: &mut SendFn) -> bool {
        self.snapshot().iter().any(|h| h.request_bitrate(bps, send))
    }
}

type VoidCallback = Box<dyn Fn() + Send + Sync>;
type MessageCallback = Box<dyn Fn(Message) + Send + Sync>;

/// A single media m-line's live state (spec §3 "Track").
pub struct Track {
    description: Mutex<MediaEntry>,
    mid: String,
    is_open: AtomicBool,
    is_closed: AtomicBool,
    recv_queue: Arc<crate::queue::Queue<Message>>,
    pub outgoing_chain: HandlerChain,
    pub incoming_chain: HandlerChain,
    dtls_srtp: Mutex<Weak<DtlsSrtpTransport>>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    on_open: ArcSwapOption<VoidCallback>,
    on_closed: ArcSwapOption<VoidCallback>,
    on_message: ArcSwapOption<MessageCallback>,
}

impl Track {
    pub fn new(description: MediaEntry) -> Arc<Self> {
        let mid = description.mid.clone();
        Arc::new(Track {
            description: Mutex::new(description),
            mid,
            is_open: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_queue: Arc::new(crate::queue::Queue::new(1024)),
            outgoing_chain: HandlerChain::new(),
            incoming_chain: HandlerChain::new(),
            dtls_srtp: Mutex::new(Weak::new()),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            on_open: ArcSwapOption::from(None),
            on_closed: ArcSwapOption::from(None),
            on_message: ArcSwapOption::from(None),
        })
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn description(&self) -> MediaEntry {
        self.description.lock().unwrap().clone()
    }

    pub(crate) fn set_description(&self, description: MediaEntry) {
        *self.description.lock().unwrap() = description;
        let desc = self.description.lock().unwrap().clone();
        self.incoming_chain.on_media(&desc);
        self.outgoing_chain.on_media(&desc);
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        self.description.lock().unwrap().ssrcs.clone()
    }

    pub(crate) fn attach_dtls_srtp(&self, transport: &Arc<DtlsSrtpTransport>) {
        *self.dtls_srtp.lock().unwrap() = Arc::downgrade(transport);
    }

    /// Opened when DTLS-SRTP reaches `Connected` (spec §3 Track lifecycle).
    pub(crate) fn open(&self) {
        if !self.is_open.swap(true, Ordering::SeqCst) {
            if let Some(cb) = self.on_open.load_full() {
                cb();
            }
        }
    }

    pub fn on_open(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_open.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_closed(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_closed.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_message(&self, cb: impl Fn(Message) + Send + Sync + 'static) {
        self.on_message.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn close(&self) {
        if !self.is_closed.swap(true, Ordering::SeqCst) {
            self.recv_queue.stop();
            if let Some(cb) = self.on_closed.load_full() {
                cb();
            }
        }
    }

    /// Runs `msg` head-first through the incoming chain, then delivers
    /// whatever survives to the receive queue and `on_message` (spec
    /// §4.8).
    pub(crate) fn deliver_incoming(self: &Arc<Self>, msg: Message) {
        let dtls_srtp = self.dtls_srtp.lock().unwrap().upgrade();
        let mut reply = |out: Message| {
            if let Some(t) = &dtls_srtp {
                let _ = t.send(&out);
            }
        };
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        let survivors = self.incoming_chain.incoming(vec![msg], &mut reply);
        for m in survivors {
            self.recv_queue.push(m.clone());
            if let Some(cb) = self.on_message.load_full() {
                cb(m);
            }
        }
    }

    pub fn recv(&self) -> Option<Message> {
        self.recv_queue.pop()
    }

    /// Runs `msg` head-first through the outgoing chain (packetizer,
    /// pacing, TWCC...) and sends whatever reaches the tail over SRTP.
    pub fn send(self: &Arc<Self>, msg: Message) -> Result<()> {
        let dtls_srtp = self.dtls_srtp.lock().unwrap().upgrade().ok_or(crate::error::Error::Closed)?;
        let dtls_srtp_for_reply = dtls_srtp.clone();
        let mut reply = move |out: Message| {
            let _ = dtls_srtp_for_reply.send(&out);
        };
        let survivors = self.outgoing_chain.outgoing(vec![msg], &mut reply);
        for m in survivors {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            dtls_srtp.send(&m)?;
        }
        Ok(())
    }

    pub fn request_keyframe(self: &Arc<Self>) -> bool {
        let dtls_srtp = self.dtls_srtp.lock().unwrap().upgrade();
        let mut reply = |out: Message| {
            if let Some(t) = &dtls_srtp {
                let _ = t.send(&out);
            }
        };
        self.outgoing_chain.request_keyframe(&mut reply)
    }

    pub fn request_bitrate(self: &Arc<Self>, bps: u64) -> bool {
        let dtls_srtp = self.dtls_srtp.lock().unwrap().upgrade();
        let mut reply = |out: Message| {
            if let Some(t) = &dtls_srtp {
                let _ = t.send(&out);
            }
        };
        self.outgoing_chain.request_bitrate(bps, &mut reply)
    }
}

/// Builds the SSRC -> mid and payload-type -> mid tables from the local +
/// remote descriptions' media entries, and uses them (in that order, then
/// falls back to scanning RTCP report blocks) to route a packet to its
/// track (spec §4.8).
#[derive(Default)]
pub struct MediaRouter {
    by_ssrc: Mutex<HashMap<u32, String>>,
    by_payload_type: Mutex<HashMap<u8, String>>,
    unrouted_count: AtomicU64,
}

impl MediaRouter {
    pub fn new() -> Self {
        MediaRouter::default()
    }

    pub fn register(&self, entry: &MediaEntry) {
        for ssrc in &entry.ssrcs {
            self.by_ssrc.lock().unwrap().insert(*ssrc, entry.mid.clone());
        }
        for pt in entry.rtpmap.keys() {
            self.by_payload_type.lock().unwrap().entry(*pt).or_insert_with(|| entry.mid.clone());
        }
    }

    pub fn unregister_mid(&self, mid: &str) {
        self.by_ssrc.lock().unwrap().retain(|_, m| m != mid);
        self.by_payload_type.lock().unwrap().retain(|_, m| m != mid);
    }

    /// Routes one RTP packet: SSRC table first, payload type second.
    pub fn route_rtp(&self, ssrc: u32, payload_type: u8) -> Option<String> {
        if let Some(mid) = self.by_ssrc.lock().unwrap().get(&ssrc).cloned() {
            return Some(mid);
        }
        let mid = self.by_payload_type.lock().unwrap().get(&payload_type).cloned();
        if mid.is_none() {
            self.unrouted_count.fetch_add(1, Ordering::Relaxed);
        }
        mid
    }

    /// Routes an RTCP compound packet by distributing it to every mid
    /// referenced by any contained report block (spec §4.8).
    pub fn route_rtcp(&self, packet: &rtcp::RtcpPacket) -> Vec<String> {
        let by_ssrc = self.by_ssrc.lock().unwrap();
        let mut mids: Vec<String> = packet
            .referenced_ssrcs()
            .into_iter()
            .filter_map(|ssrc| by_ssrc.get(&ssrc).cloned())
            .collect();
        mids.sort();
        mids.dedup();
        if mids.is_empty() {
            self.unrouted_count.fetch_add(1, Ordering::Relaxed);
        }
        mids
    }

    pub fn unrouted_count(&self) -> u64 {
        self.unrouted_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::Direction;
    use std::collections::BTreeMap;

    fn entry(mid: &str, ssrc: u32, pt: u8) -> MediaEntry {
        let mut rtpmap = BTreeMap::new();
        rtpmap.insert(
            pt,
            crate::description::RtpCodec {
                payload_type: pt,
                name: "VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                fmtp: None,
                rtcp_fbs: vec![],
            },
        );
        MediaEntry {
            mid: mid.to_string(),
            kind: "video".to_string(),
            direction: Direction::SendRecv,
            rtpmap,
            ssrcs: vec![ssrc],
            bitrate: None,
        }
    }

    #[test]
    fn routes_by_ssrc_before_payload_type() {
        let router = MediaRouter::new();
        router.register(&entry("test", 111, 96));
        assert_eq!(router.route_rtp(111, 96), Some("test".to_string()));
    }

    #[test]
    fn unknown_ssrc_and_pt_counts_as_unrouted() {
        let router = MediaRouter::new();
        router.register(&entry("test", 111, 96));
        assert_eq!(router.route_rtp(999, 5), None);
        assert_eq!(router.unrouted_count(), 1);
    }

    #[test]
    fn rtcp_routes_to_every_referenced_mid() {
        let router = MediaRouter::new();
        router.register(&entry("a", 1, 96));
        router.register(&entry("b", 2, 97));
        let bye = rtcp::RtcpPacket::Bye { ssrcs: vec![1, 2] };
        let mut mids = router.route_rtcp(&bye);
        mids.sort();
        assert_eq!(mids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn track_opens_exactly_once() {
        let track = Track::new(entry("test", 1, 96));
        let opens = Arc::new(AtomicU64::new(0));
        let opens2 = opens.clone();
        track.on_open(move || {
            opens2.fetch_add(1, Ordering::SeqCst);
        });
        track.open();
        track.open();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }
}
