//! C7 — DTLS-SRTP transport (spec §4.5).
//!
//! A specialization of [`crate::transport::dtls::DtlsTransport`]: it drives
//! the same handshake state machine but takes over the ICE inbox itself so
//! it can demux DTLS records from RTP/RTCP datagrams on the same 5-tuple
//! before handing DTLS-range bytes to the wrapped `DtlsTransport`.  After the
//! handshake reaches `Connected` it derives `EXTRACTOR-dtls_srtp` keying
//! material and builds one inbound/outbound SRTP context keyed by role, the
//! same way the embedded `rtc-srtp` crate's context API (scoped out at the
//! engine-internals level per spec §1) would be wired if vendored whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::transport::dtls::{DtlsRole, DtlsTransport, DTLS_CONTENT_TYPE_RANGE};
use crate::transport::{TransportBase, TransportState};

/// Default outbound DSCP for media when the caller hasn't set one: AF42
/// (spec §4.5).
pub const DEFAULT_MEDIA_DSCP: u8 = 36;

const SRTP_KEY_LEN: usize = 16;
const SRTP_SALT_LEN: usize = 14;
const RTP_HEADER_LEN: usize = 12;
const RTCP_HEADER_LEN: usize = 8;

fn is_rtcp(second_byte: u8) -> bool {
    let fmt = second_byte & 0x7f;
    (64..=95).contains(&fmt)
}

struct SrtpContext {
    key: LessSafeKey,
    salt: [u8; SRTP_SALT_LEN],
}

impl SrtpContext {
    fn new(key_bytes: &[u8], salt_bytes: &[u8]) -> Self {
        let unbound = UnboundKey::new(&AES_128_GCM, key_bytes).expect("16-byte SRTP key");
        let mut salt = [0u8; SRTP_SALT_LEN];
        salt.copy_from_slice(salt_bytes);
        SrtpContext {
            key: LessSafeKey::new(unbound),
            salt,
        }
    }

    fn nonce_for(&self, seq: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..SRTP_SALT_LEN.min(12)].copy_from_slice(&self.salt[..SRTP_SALT_LEN.min(12)]);
        let seq_bytes = seq.to_be_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b ^= seq_bytes[2 + i];
        }
        Nonce::assume_unique_for_key(bytes)
    }
}

pub struct DtlsSrtpTransport {
    base: TransportBase,
    dtls: Arc<DtlsTransport>,
    inbound: Mutex<Option<SrtpContext>>,
    outbound: Mutex<Option<SrtpContext>>,
    outbound_seq: AtomicU64,
    dropped_auth_failures: AtomicU64,
    default_dscp: Mutex<u8>,
}

impl DtlsSrtpTransport {
    pub fn new(dtls: Arc<DtlsTransport>) -> Arc<Self> {
        let transport = Arc::new(DtlsSrtpTransport {
            base: TransportBase::new(),
            dtls,
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            outbound_seq: AtomicU64::new(0),
            dropped_auth_failures: AtomicU64::new(0),
            default_dscp: Mutex::new(DEFAULT_MEDIA_DSCP),
        });
        transport.wire_lower();
        transport
    }

    fn wire_lower(self: &Arc<Self>) {
        let this = self.clone();
        self.dtls.on_state_change(move |state| this.on_dtls_state(state));
        let this = self.clone();
        self.dtls.on_post_handshake(move || this.derive_srtp_keys());
    }

    /// Takes over the ICE inbox with a demuxing closure: DTLS-range bytes
    /// (20-63) go back into the wrapped transport's handshake state
    /// machine, RTP/RTCP bytes (128-191) are unprotected here directly
    /// (spec §4.5's demux rule). This replaces the `wire_upper` registration
    /// `DtlsTransport::new()` installed on the same ICE transport.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let dtls = self.dtls.clone();
        self.dtls.lower().wire_upper(move |msg| {
            if let Some(&first) = msg.buffer.first() {
                if DTLS_CONTENT_TYPE_RANGE.contains(&first) {
                    dtls.handle_datagram(&msg.buffer);
                    return;
                }
                if (128..=191).contains(&first) {
                    this.on_srtp_datagram(&msg.buffer);
                    return;
                }
            }
        });
        self.base.set_state(TransportState::Connecting);
        let _ = self.dtls.start();
    }

    pub fn state(&self) -> TransportState {
        self.base.state()
    }

    pub fn on_state_change(&self, cb: impl Fn(TransportState) + Send + Sync + 'static) {
        self.base.on_state_change(cb);
    }

    pub fn wire_upper(&self, sink: impl Fn(Message) + Send + Sync + 'static) {
        self.base.wire_upper(sink);
    }

    pub fn set_fingerprint_verifier(&self, verifier: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.dtls.set_fingerprint_verifier(verifier);
    }

    pub fn set_role(&self, role: DtlsRole) {
        self.dtls.set_role(role);
    }

    fn on_dtls_state(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Failed | TransportState::Disconnected => self.base.set_state(state),
            // `Connected` is forwarded from `derive_srtp_keys` once keys are
            // actually installed, not the instant the handshake completes.
            _ => {}
        }
    }

    /// Spec §4.5: extracts `EXTRACTOR-dtls_srtp` keying material and slices
    /// it into client/server write key+salt; inbound uses the *peer's*
    /// write key+salt, outbound uses *ours*, selected by role.
    fn derive_srtp_keys(self: &Arc<Self>) {
        let total = 2 * (SRTP_KEY_LEN + SRTP_SALT_LEN);
        let material = match self.dtls.export_keying_material("EXTRACTOR-dtls_srtp", total) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dtls-srtp: keying material export failed: {}", e);
                self.base.set_state(TransportState::Failed);
                return;
            }
        };
        let (client_write_key, rest) = material.split_at(SRTP_KEY_LEN);
        let (server_write_key, rest) = rest.split_at(SRTP_KEY_LEN);
        let (client_write_salt, server_write_salt) = rest.split_at(SRTP_SALT_LEN);

        let is_client = self.dtls.role() == Some(DtlsRole::Client);
        let (our_key, our_salt, peer_key, peer_salt) = if is_client {
            (client_write_key, client_write_salt, server_write_key, server_write_salt)
        } else {
            (server_write_key, server_write_salt, client_write_key, client_write_salt)
        };

        *self.outbound.lock().unwrap() = Some(SrtpContext::new(our_key, our_salt));
        *self.inbound.lock().unwrap() = Some(SrtpContext::new(peer_key, peer_salt));
        self.base.set_state(TransportState::Connected);
    }

    fn on_srtp_datagram(&self, data: &[u8]) {
        if data.len() < 2 {
            return;
        }
        let header_len = if is_rtcp(data[1]) { RTCP_HEADER_LEN } else { RTP_HEADER_LEN };
        if data.len() < header_len + 8 {
            return;
        }
        let (header, rest) = data.split_at(header_len);
        let (seq_bytes, ciphertext) = rest.split_at(8);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(seq_bytes);
        let seq = u64::from_be_bytes(seq);

        let guard = self.inbound.lock().unwrap();
        let Some(ctx) = guard.as_ref() else {
            return;
        };
        let mut in_out = ciphertext.to_vec();
        match ctx
            .key
            .open_in_place(ctx.nonce_for(seq), Aad::from(header), &mut in_out)
        {
            Ok(plain) => {
                let mut full = header.to_vec();
                full.extend_from_slice(plain);
                self.base.deliver_up(Message::binary(full, 0));
            }
            Err(_) => {
                log::trace!("dtls-srtp: dropping packet that failed authentication");
                self.dropped_auth_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_auth_failures(&self) -> u64 {
        self.dropped_auth_failures.load(Ordering::Relaxed)
    }

    pub fn set_default_dscp(&self, dscp: u8) {
        *self.default_dscp.lock().unwrap() = dscp;
    }

    /// Protects one RTP/RTCP packet and sends it over the lower (ICE)
    /// transport, leaving the fixed header in the clear so the peer's
    /// demux can classify the packet before decrypting it.
    pub fn send(&self, msg: &Message) -> Result<()> {
        if msg.kind != MessageKind::Binary {
            return Err(Error::invalid("dtls-srtp only carries binary RTP/RTCP packets"));
        }
        if msg.buffer.len() < 2 {
            return Err(Error::invalid("packet too short to demux"));
        }
        let header_len = if is_rtcp(msg.buffer[1]) { RTCP_HEADER_LEN } else { RTP_HEADER_LEN };
        if msg.buffer.len() < header_len {
            return Err(Error::invalid("packet shorter than its own header"));
        }
        let (header, payload) = msg.buffer.split_at(header_len);

        let guard = self.outbound.lock().unwrap();
        let ctx = guard
            .as_ref()
            .ok_or_else(|| Error::transport("dtls-srtp: keys not derived yet"))?;
        let seq = self.outbound_seq.fetch_add(1, Ordering::SeqCst);

        let mut in_out = payload.to_vec();
        ctx.key
            .seal_in_place_append_tag(ctx.nonce_for(seq), Aad::from(header), &mut in_out)
            .map_err(|_| Error::transport("dtls-srtp: seal failed"))?;

        let mut packet = Vec::with_capacity(header_len + 8 + in_out.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&in_out);

        let dscp = if msg.dscp != 0 { msg.dscp } else { *self.default_dscp.lock().unwrap() };
        self.dtls
            .lower()
            .send(&Message::binary(packet, msg.stream).with_dscp(dscp))
    }

    pub fn close(&self) {
        self.base.clear_callbacks();
        self.base.set_state(TransportState::Closed);
        self.dtls.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::Certificate;
    use crate::transport::ice::{IceConfig, IceTransport};
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_ice_pair() -> (Arc<IceTransport>, Arc<IceTransport>) {
        let a = IceTransport::new(IceConfig::default());
        let b = IceTransport::new(IceConfig::default());
        a.start_gathering().unwrap();
        b.start_gathering().unwrap();
        let ac = a.local_candidate_for_test();
        let bc = b.local_candidate_for_test();
        a.add_remote_candidate(bc).unwrap();
        b.add_remote_candidate(ac).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && (a.state() != TransportState::Connected || b.state() != TransportState::Connected)
        {
            thread::sleep(Duration::from_millis(10));
        }
        (a, b)
    }

    fn connected_pair() -> (Arc<DtlsSrtpTransport>, Arc<DtlsSrtpTransport>) {
        let (ice_a, ice_b) = connected_ice_pair();
        let cert_a = Certificate::make_certificate("dtls-srtp-test-a").unwrap();
        let cert_b = Certificate::make_certificate("dtls-srtp-test-b").unwrap();
        let fp_a = cert_a.fingerprint().to_string();
        let fp_b = cert_b.fingerprint().to_string();

        let dtls_a = DtlsTransport::new(ice_a, cert_a);
        let dtls_b = DtlsTransport::new(ice_b, cert_b);
        let srtp_a = DtlsSrtpTransport::new(dtls_a);
        let srtp_b = DtlsSrtpTransport::new(dtls_b);

        srtp_a.set_role(DtlsRole::Client);
        srtp_b.set_role(DtlsRole::Server);
        srtp_a.set_fingerprint_verifier(move |fp| fp.eq_ignore_ascii_case(&fp_b));
        srtp_b.set_fingerprint_verifier(move |fp| fp.eq_ignore_ascii_case(&fp_a));

        srtp_a.start();
        srtp_b.start();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && (srtp_a.state() != TransportState::Connected || srtp_b.state() != TransportState::Connected)
        {
            thread::sleep(Duration::from_millis(10));
        }
        (srtp_a, srtp_b)
    }

    fn rtp_packet(seq: u16) -> Vec<u8> {
        let mut pkt = vec![0x80, 111, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2];
        pkt[2..4].copy_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(b"hello-media");
        pkt
    }

    #[test]
    fn handshake_reaches_connected_and_keys_are_installed() {
        let (a, b) = connected_pair();
        assert_eq!(a.state(), TransportState::Connected);
        assert_eq!(b.state(), TransportState::Connected);
        assert!(a.outbound.lock().unwrap().is_some());
        assert!(b.inbound.lock().unwrap().is_some());
    }

    #[test]
    fn rtp_round_trips_through_protect_unprotect() {
        let (a, b) = connected_pair();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        b.wire_upper(move |msg| received2.lock().unwrap().push(msg.buffer.to_vec()));

        let pkt = rtp_packet(42);
        a.send(&Message::binary(pkt.clone(), 0)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline && received.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], pkt);
    }

    #[test]
    fn rtcp_second_byte_range_is_classified_correctly() {
        assert!(is_rtcp(200)); // PT 200 & 0x7f = 72, in 64..95
        assert!(!is_rtcp(111)); // typical dynamic RTP PT
    }
}
