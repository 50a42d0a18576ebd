//! C11 — RTP pipeline handlers, each a [`super::MediaHandler`] link in a
//! [`super::Track`]'s chain (spec §4.9). Specified by contract, not
//! implementation: every handler here matches the named behavior and
//! nothing more.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::message::Message;

use super::rtcp::RtcpPacket;
use super::rtp::RtpPacket;
use super::{MediaHandler, SendFn};

/// Turns encoded frames into RTP packets: increments a sequence number per
/// packet emitted, carries the caller-supplied timestamp, and sets the
/// marker bit on the last fragment of a frame (spec §4.9 "Packetizer").
pub struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    sequence_number: AtomicU16,
}

impl Packetizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Packetizer {
            payload_type,
            ssrc,
            sequence_number: AtomicU16::new(0),
        }
    }
}

impl MediaHandler for Packetizer {
    fn outgoing(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        msgs.into_iter()
            .map(|m| {
                let seq = self.sequence_number.fetch_add(1, Ordering::SeqCst);
                let timestamp = m.frame_info.as_ref().map(|f| f.timestamp).unwrap_or(0);
                let marker = m.frame_info.as_ref().map(|f| f.marker).unwrap_or(true);
                let pkt = RtpPacket {
                    marker,
                    payload_type: self.payload_type,
                    sequence_number: seq,
                    timestamp,
                    ssrc: self.ssrc,
                    extension: None,
                    payload: m.buffer,
                };
                Message::binary(pkt.marshal(), m.stream)
            })
            .collect()
    }
}

struct PendingFrame {
    timestamp: u32,
    fragments: Vec<bytes::Bytes>,
}

/// Reassembles RTP packets into frames: buffers by timestamp, emits when
/// the timestamp changes or the marker bit is seen. A missing middle
/// fragment (detected via a sequence gap inside one timestamp's run)
/// discards the whole frame (spec §4.9 "Depacketizer").
pub struct Depacketizer {
    pending: Mutex<Option<PendingFrame>>,
    last_sequence_number: Mutex<Option<u16>>,
    gap_in_current_frame: std::sync::atomic::AtomicBool,
}

impl Default for Depacketizer {
    fn default() -> Self {
        Depacketizer {
            pending: Mutex::new(None),
            last_sequence_number: Mutex::new(None),
            gap_in_current_frame: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaHandler for Depacketizer {
    fn incoming(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        let mut out = Vec::new();
        let mut pending = self.pending.lock().unwrap();
        let mut last_seq = self.last_sequence_number.lock().unwrap();

        for m in msgs {
            let Ok(pkt) = RtpPacket::unmarshal(&m.buffer) else {
                continue;
            };
            if let Some(prev) = *last_seq {
                if pkt.sequence_number != prev.wrapping_add(1) {
                    self.gap_in_current_frame.store(true, Ordering::SeqCst);
                }
            }
            *last_seq = Some(pkt.sequence_number);

            let needs_flush = pending.as_ref().is_some_and(|p| p.timestamp != pkt.timestamp);
            if needs_flush {
                if let Some(p) = pending.take() {
                    if !self.gap_in_current_frame.swap(false, Ordering::SeqCst) {
                        out.push(Message::binary(p.fragments.concat(), m.stream));
                    }
                }
            }
            let entry = pending.get_or_insert_with(|| PendingFrame {
                timestamp: pkt.timestamp,
                fragments: Vec::new(),
            });
            entry.fragments.push(pkt.payload);

            if pkt.marker {
                let p = pending.take().unwrap();
                if !self.gap_in_current_frame.swap(false, Ordering::SeqCst) {
                    out.push(Message::binary(p.fragments.concat(), m.stream));
                }
            }
        }
        out
    }
}

/// Which RTP epoch the NTP timestamp on outgoing Sender Reports uses
/// (spec Open Question, resolved in DESIGN.md): 1900 is the RFC-correct
/// default, 1970 is offered for callers that want Unix-epoch-relative
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpEpoch {
    Epoch1900,
    Epoch1970,
}

const NTP_UNIX_DELTA_SECS: u64 = 2_208_988_800;

/// Counts outgoing packets/octets per SSRC and emits a Sender Report once
/// `mark_needs_report()` has been called (spec §4.9 "SR Reporter").
pub struct SrReporter {
    ssrc: u32,
    clock_rate: u32,
    epoch: NtpEpoch,
    start_wallclock: Instant,
    start_rtp_timestamp: u32,
    packet_count: AtomicU32,
    octet_count: AtomicU32,
    needs_report: std::sync::atomic::AtomicBool,
}

impl SrReporter {
    pub fn new(ssrc: u32, clock_rate: u32, epoch: NtpEpoch, start_rtp_timestamp: u32) -> Self {
        SrReporter {
            ssrc,
            clock_rate,
            epoch,
            start_wallclock: Instant::now(),
            start_rtp_timestamp,
            packet_count: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            needs_report: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn mark_needs_report(&self) {
        self.needs_report.store(true, Ordering::SeqCst);
    }

    fn ntp_now(&self) -> (u32, u32) {
        let elapsed = self.start_wallclock.elapsed();
        let epoch_offset_secs = match self.epoch {
            NtpEpoch::Epoch1900 => NTP_UNIX_DELTA_SECS,
            NtpEpoch::Epoch1970 => 0,
        };
        let secs = epoch_offset_secs + elapsed.as_secs();
        let frac = ((elapsed.subsec_nanos() as u64) << 32) / 1_000_000_000;
        (secs as u32, frac as u32)
    }

    fn current_rtp_timestamp(&self) -> u32 {
        let elapsed = self.start_wallclock.elapsed();
        let ticks = (elapsed.as_secs_f64() * self.clock_rate as f64) as u32;
        self.start_rtp_timestamp.wrapping_add(ticks)
    }
}

impl MediaHandler for SrReporter {
    fn outgoing(&self, msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        for m in &msgs {
            if let Ok(pkt) = RtpPacket::unmarshal(&m.buffer) {
                self.packet_count.fetch_add(1, Ordering::Relaxed);
                self.octet_count.fetch_add(pkt.payload.len() as u32, Ordering::Relaxed);
            }
        }
        if self.needs_report.swap(false, Ordering::SeqCst) {
            let (ntp_sec, ntp_frac) = self.ntp_now();
            let report = RtcpPacket::SenderReport {
                ssrc: self.ssrc,
                ntp_sec,
                ntp_frac,
                rtp_timestamp: self.current_rtp_timestamp(),
                packet_count: self.packet_count.load(Ordering::Relaxed),
                octet_count: self.octet_count.load(Ordering::Relaxed),
                report_ssrcs: vec![],
            };
            send(Message::binary(report.marshal(), 0));
        }
        msgs
    }
}

/// Keeps a fixed-size ring of the last N outgoing RTP packets by sequence
/// number; on an incoming NACK, retransmits whichever are still in the
/// ring unchanged, silently skipping the rest (spec §4.9 "NACK
/// Responder").
pub struct NackResponder {
    ring: Mutex<VecDeque<(u16, Message)>>,
    capacity: usize,
}

impl NackResponder {
    pub fn new(capacity: usize) -> Self {
        NackResponder {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }
}

impl MediaHandler for NackResponder {
    fn outgoing(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        let mut ring = self.ring.lock().unwrap();
        for m in &msgs {
            if let Ok(pkt) = RtpPacket::unmarshal(&m.buffer) {
                if ring.len() == self.capacity {
                    ring.pop_front();
                }
                ring.push_back((pkt.sequence_number, m.clone()));
            }
        }
        msgs
    }

    fn incoming(&self, msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        let mut survivors = Vec::with_capacity(msgs.len());
        for m in msgs {
            if let Ok(packets) = RtcpPacket::unmarshal_compound(&m.buffer) {
                let mut was_nack = false;
                for p in &packets {
                    if let RtcpPacket::Nack { lost_sequence_numbers, .. } = p {
                        was_nack = true;
                        let ring = self.ring.lock().unwrap();
                        for seq in lost_sequence_numbers {
                            if let Some((_, rtp)) = ring.iter().find(|(s, _)| s == seq) {
                                send(rtp.clone());
                            }
                        }
                    }
                }
                if was_nack {
                    continue;
                }
            }
            survivors.push(m);
        }
        survivors
    }
}

/// Detects sequence-number gaps in the incoming stream; once a gap
/// persists beyond `jitter_window`, sends an RTCP NACK for the missing
/// sequence numbers, up to `max_resends` times each, spaced by
/// `resend_interval` (spec §4.9 "NACK Requester").
pub struct NackRequester {
    sender_ssrc: u32,
    media_ssrc: u32,
    jitter_window: Duration,
    resend_interval: Duration,
    max_resends: u32,
    last_sequence_number: Mutex<Option<u16>>,
    pending: Mutex<std::collections::HashMap<u16, (Instant, u32)>>,
}

impl NackRequester {
    pub fn new(sender_ssrc: u32, media_ssrc: u32, jitter_window: Duration, resend_interval: Duration, max_resends: u32) -> Self {
        NackRequester {
            sender_ssrc,
            media_ssrc,
            jitter_window,
            resend_interval,
            max_resends,
            last_sequence_number: Mutex::new(None),
            pending: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl MediaHandler for NackRequester {
    fn incoming(&self, msgs: Vec<Message>, send: &mut SendFn) -> Vec<Message> {
        let mut last_seq = self.last_sequence_number.lock().unwrap();
        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();

        for m in &msgs {
            let Ok(pkt) = RtpPacket::unmarshal(&m.buffer) else {
                continue;
            };
            pending.remove(&pkt.sequence_number);
            if let Some(prev) = *last_seq {
                let mut expected = prev.wrapping_add(1);
                while expected != pkt.sequence_number {
                    pending.entry(expected).or_insert((now, 0));
                    expected = expected.wrapping_add(1);
                }
            }
            let is_newer = match *last_seq {
                Some(prev) => seq_is_newer(pkt.sequence_number, prev),
                None => true,
            };
            if is_newer {
                *last_seq = Some(pkt.sequence_number);
            }
        }

        let mut due = Vec::new();
        for (seq, (first_seen, resends)) in pending.iter_mut() {
            if now.duration_since(*first_seen) >= self.jitter_window && *resends < self.max_resends {
                due.push(*seq);
                *resends += 1;
                *first_seen = now + self.resend_interval - self.jitter_window;
            }
        }
        if !due.is_empty() {
            let nack = RtcpPacket::Nack {
                sender_ssrc: self.sender_ssrc,
                media_ssrc: self.media_ssrc,
                lost_sequence_numbers: due,
            };
            send(Message::binary(nack.marshal(), 0));
        }
        msgs
    }
}

fn seq_is_newer(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) != 0 && a.wrapping_sub(b) < 0x8000
}

/// Invokes `on_pli` on an incoming PLI or FIR (spec §4.9 "PLI Handler").
pub struct PliHandler<F: Fn() + Send + Sync> {
    on_pli: F,
}

impl<F: Fn() + Send + Sync> PliHandler<F> {
    pub fn new(on_pli: F) -> Self {
        PliHandler { on_pli }
    }
}

impl<F: Fn() + Send + Sync> MediaHandler for PliHandler<F> {
    fn incoming(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        let mut survivors = Vec::with_capacity(msgs.len());
        for m in msgs {
            if let Ok(packets) = RtcpPacket::unmarshal_compound(&m.buffer) {
                if packets.iter().any(|p| matches!(p, RtcpPacket::Pli { .. } | RtcpPacket::Fir { .. })) {
                    (self.on_pli)();
                    continue;
                }
            }
            survivors.push(m);
        }
        survivors
    }

    fn request_keyframe(&self, send: &mut SendFn) -> bool {
        send(Message::binary(RtcpPacket::Pli { sender_ssrc: 0, media_ssrc: 0 }.marshal(), 0));
        true
    }
}

/// Decodes incoming REMB and invokes `on_remb(bps)` (spec §4.9 "REMB
/// Handler").
pub struct RembHandler<F: Fn(u64) + Send + Sync> {
    on_remb: F,
}

impl<F: Fn(u64) + Send + Sync> RembHandler<F> {
    pub fn new(on_remb: F) -> Self {
        RembHandler { on_remb }
    }
}

impl<F: Fn(u64) + Send + Sync> MediaHandler for RembHandler<F> {
    fn incoming(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        let mut survivors = Vec::with_capacity(msgs.len());
        for m in msgs {
            if let Ok(packets) = RtcpPacket::unmarshal_compound(&m.buffer) {
                let mut was_remb = false;
                for p in &packets {
                    if let RtcpPacket::Remb { bitrate_bps, .. } = p {
                        (self.on_remb)(*bitrate_bps);
                        was_remb = true;
                    }
                }
                if was_remb {
                    continue;
                }
            }
            survivors.push(m);
        }
        survivors
    }

    fn request_bitrate(&self, bps: u64, send: &mut SendFn) -> bool {
        send(Message::binary(RtcpPacket::Remb { sender_ssrc: 0, ssrcs: vec![], bitrate_bps: bps }.marshal(), 0));
        true
    }
}

/// Token-bucketed outgoing sender: queue is size-capped, on overflow the
/// queue is dropped and an overflow callback invoked (spec §4.9 "Pacing
/// Handler"). `drain()` is meant to be called by a caller-owned timer on
/// `send_interval`.
pub struct PacingHandler<F: Fn() + Send + Sync> {
    bits_per_second: u64,
    queue: Mutex<VecDeque<Message>>,
    max_queue_len: usize,
    tokens: Mutex<(Instant, f64)>,
    on_overflow: F,
}

impl<F: Fn() + Send + Sync> PacingHandler<F> {
    pub fn new(bits_per_second: u64, max_queue_len: usize, on_overflow: F) -> Self {
        PacingHandler {
            bits_per_second,
            queue: Mutex::new(VecDeque::new()),
            max_queue_len,
            tokens: Mutex::new((Instant::now(), 0.0)),
            on_overflow,
        }
    }

    fn refill(&self) -> f64 {
        let mut guard = self.tokens.lock().unwrap();
        let (last, tokens) = *guard;
        let elapsed = last.elapsed().as_secs_f64();
        let new_tokens = (tokens + elapsed * self.bits_per_second as f64).min(self.bits_per_second as f64);
        *guard = (Instant::now(), new_tokens);
        new_tokens
    }

    /// Releases as many queued packets as the current token balance
    /// allows, sending each via `send`.
    pub fn drain(&self, send: &mut SendFn) {
        let mut available = self.refill();
        let mut queue = self.queue.lock().unwrap();
        while let Some(front) = queue.front() {
            let cost = (front.len() * 8) as f64;
            if cost > available {
                break;
            }
            available -= cost;
            send(queue.pop_front().unwrap());
        }
        *self.tokens.lock().unwrap() = (Instant::now(), available);
    }
}

impl<F: Fn() + Send + Sync> MediaHandler for PacingHandler<F> {
    fn outgoing(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        let mut queue = self.queue.lock().unwrap();
        for m in msgs {
            if queue.len() >= self.max_queue_len {
                queue.clear();
                (self.on_overflow)();
                break;
            }
            queue.push_back(m);
        }
        Vec::new()
    }
}

/// Stamps outgoing RTP packets with a monotonic 16-bit sequence number in
/// a one-byte header extension at `extension_id`, for RFC 8888/TWCC (spec
/// §4.9 "TWCC Handler").
pub struct TwccHandler {
    extension_id: u8,
    counter: AtomicU64,
}

impl TwccHandler {
    pub fn new(extension_id: u8) -> Self {
        TwccHandler {
            extension_id,
            counter: AtomicU64::new(0),
        }
    }
}

impl MediaHandler for TwccHandler {
    fn outgoing(&self, msgs: Vec<Message>, _send: &mut SendFn) -> Vec<Message> {
        msgs.into_iter()
            .map(|m| {
                let Ok(mut pkt) = RtpPacket::unmarshal(&m.buffer) else {
                    return m;
                };
                let seq = self.counter.fetch_add(1, Ordering::SeqCst) as u16;
                pkt.extension = Some((self.extension_id, (seq & 0xff) as u8));
                Message::binary(pkt.marshal(), m.stream)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frameinfo::FrameInfo;

    #[test]
    fn packetizer_increments_sequence_number_per_packet() {
        let p = Packetizer::new(96, 1234);
        let mut send = |_: Message| {};
        let out = p.outgoing(
            vec![
                Message::binary(vec![1, 2, 3], 0).with_frame_info(FrameInfo { timestamp: 100, marker: true, ..Default::default() }),
                Message::binary(vec![4, 5, 6], 0).with_frame_info(FrameInfo { timestamp: 200, marker: true, ..Default::default() }),
            ],
            &mut send,
        );
        let a = RtpPacket::unmarshal(&out[0].buffer).unwrap();
        let b = RtpPacket::unmarshal(&out[1].buffer).unwrap();
        assert_eq!(a.sequence_number, 0);
        assert_eq!(b.sequence_number, 1);
        assert_eq!(a.ssrc, 1234);
    }

    #[test]
    fn depacketizer_emits_frame_on_marker() {
        let d = Depacketizer::new();
        let mut send = |_: Message| {};
        let pkt1 = RtpPacket { marker: false, payload_type: 96, sequence_number: 0, timestamp: 100, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"ab") };
        let pkt2 = RtpPacket { marker: true, payload_type: 96, sequence_number: 1, timestamp: 100, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"cd") };
        let out = d.incoming(
            vec![Message::binary(pkt1.marshal(), 0), Message::binary(pkt2.marshal(), 0)],
            &mut send,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].buffer.as_ref(), b"abcd");
    }

    #[test]
    fn depacketizer_discards_frame_with_missing_middle_fragment() {
        let d = Depacketizer::new();
        let mut send = |_: Message| {};
        let pkt1 = RtpPacket { marker: false, payload_type: 96, sequence_number: 0, timestamp: 100, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"ab") };
        // sequence number 2 instead of 1: a fragment went missing.
        let pkt3 = RtpPacket { marker: true, payload_type: 96, sequence_number: 2, timestamp: 100, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"cd") };
        let out = d.incoming(
            vec![Message::binary(pkt1.marshal(), 0), Message::binary(pkt3.marshal(), 0)],
            &mut send,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn sr_reporter_only_emits_when_marked() {
        let reporter = SrReporter::new(7, 90000, NtpEpoch::Epoch1900, 0);
        let mut sent = Vec::new();
        let mut send = |m: Message| sent.push(m);
        let pkt = RtpPacket { marker: true, payload_type: 96, sequence_number: 0, timestamp: 0, ssrc: 7, extension: None, payload: bytes::Bytes::from_static(b"x") };
        reporter.outgoing(vec![Message::binary(pkt.marshal(), 0)], &mut send);
        assert!(sent.is_empty());
        reporter.mark_needs_report();
        reporter.outgoing(vec![], &mut send);
        assert_eq!(sent.len(), 1);
        let decoded = RtcpPacket::unmarshal_compound(&sent[0].buffer).unwrap();
        assert!(matches!(decoded[0], RtcpPacket::SenderReport { ssrc: 7, packet_count: 1, .. }));
    }

    #[test]
    fn nack_responder_retransmits_only_ringed_packets() {
        let responder = NackResponder::new(4);
        let mut noop = |_: Message| {};
        let pkt = RtpPacket { marker: true, payload_type: 96, sequence_number: 5, timestamp: 0, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"x") };
        responder.outgoing(vec![Message::binary(pkt.marshal(), 0)], &mut noop);

        let mut resent = Vec::new();
        let mut send = |m: Message| resent.push(m);
        let nack = RtcpPacket::Nack { sender_ssrc: 1, media_ssrc: 1, lost_sequence_numbers: vec![5, 6] };
        responder.incoming(vec![Message::binary(nack.marshal(), 0)], &mut send);
        assert_eq!(resent.len(), 1);
    }

    #[test]
    fn pli_handler_invokes_callback_and_consumes_message() {
        let fired = std::sync::atomic::AtomicUsize::new(0);
        let handler = PliHandler::new(|| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        let mut noop = |_: Message| {};
        let pli = RtcpPacket::Pli { sender_ssrc: 1, media_ssrc: 2 };
        let out = handler.incoming(vec![Message::binary(pli.marshal(), 0)], &mut noop);
        assert!(out.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remb_handler_decodes_bitrate() {
        let seen = Mutex::new(0u64);
        let handler = RembHandler::new(|bps| *seen.lock().unwrap() = bps);
        let mut noop = |_: Message| {};
        let remb = RtcpPacket::Remb { sender_ssrc: 1, ssrcs: vec![2], bitrate_bps: 1_000_000 };
        handler.incoming(vec![Message::binary(remb.marshal(), 0)], &mut noop);
        assert!(*seen.lock().unwrap() > 0);
    }

    #[test]
    fn pacing_handler_drops_queue_and_fires_overflow_on_full() {
        let fired = std::sync::atomic::AtomicUsize::new(0);
        let handler = PacingHandler::new(8, 1, || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        let mut noop = |_: Message| {};
        handler.outgoing(vec![Message::binary(vec![0; 100], 0), Message::binary(vec![0; 100], 0)], &mut noop);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn twcc_handler_stamps_monotonic_extension() {
        let handler = TwccHandler::new(3);
        let mut noop = |_: Message| {};
        let pkt = RtpPacket { marker: true, payload_type: 96, sequence_number: 0, timestamp: 0, ssrc: 1, extension: None, payload: bytes::Bytes::from_static(b"x") };
        let out = handler.outgoing(vec![Message::binary(pkt.marshal(), 0), Message::binary(pkt.marshal(), 0)], &mut noop);
        let a = RtpPacket::unmarshal(&out[0].buffer).unwrap();
        let b = RtpPacket::unmarshal(&out[1].buffer).unwrap();
        assert_eq!(a.extension.unwrap().0, 3);
        assert_ne!(a.extension.unwrap().1, b.extension.unwrap().1);
    }
}
