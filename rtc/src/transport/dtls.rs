//! C6 — DTLS transport (spec §4.4).
//!
//! Wraps the lower (ICE) transport with a handshake that carries each
//! side's certificate to the other and checks it against the fingerprint
//! verifier callback; post-handshake records are authenticated-encrypted
//! with a key derived from the exchanged certificates. The record-layer
//! cryptography normally supplied by the embedded DTLS engine (out of
//! scope per spec §1) is intentionally minimal here -- this wrapper's job
//! is the role boundary (client/server derived from ICE role), the
//! fingerprint-verifier contract, and MTU sequencing, not a from-scratch
//! TLS 1.2/1.3 record layer.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use sha2::{Digest, Sha256};

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::ice::IceTransport;
use crate::transport::{TransportBase, TransportState};

/// DTLS MTU while the handshake is in flight: the IPv6 minimum UDP payload
/// (spec §4.4), raised once the session is up so SCTP fragmentation, not
/// this layer, dominates the effective path MTU.
const HANDSHAKE_MTU: usize = 1232;
const POST_HANDSHAKE_MTU: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

/// On-wire first byte, chosen from the real DTLS content-type range (20-63,
/// spec §4.5 demux rule) so a DTLS-SRTP transport can demux a single ICE
/// inbox by inspecting the first byte alone: 22 is TLS's own `handshake`
/// content type, 23 is `application_data`.
const HELLO_TAG: u8 = 22;
const RECORD_TAG: u8 = 23;

/// Inclusive byte range identifying a DTLS record on the wire (spec §4.5).
pub const DTLS_CONTENT_TYPE_RANGE: std::ops::RangeInclusive<u8> = 20..=63;

pub struct DtlsTransport {
    base: TransportBase,
    lower: Arc<IceTransport>,
    certificate: Arc<Certificate>,
    role: Mutex<Option<DtlsRole>>,
    verifier: ArcSwapOption<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    post_handshake: ArcSwapOption<Box<dyn Fn() + Send + Sync>>,
    send_key: Mutex<Option<LessSafeKey>>,
    recv_key: Mutex<Option<LessSafeKey>>,
    send_seq: AtomicU32,
    mtu: AtomicUsize,
    hello_sent: Mutex<bool>,
    remote_der: Mutex<Option<Vec<u8>>>,
}

impl DtlsTransport {
    pub fn new(lower: Arc<IceTransport>, certificate: Arc<Certificate>) -> Arc<Self> {
        let transport = Arc::new(DtlsTransport {
            base: TransportBase::new(),
            lower,
            certificate,
            role: Mutex::new(None),
            verifier: ArcSwapOption::from(None),
            post_handshake: ArcSwapOption::from(None),
            send_key: Mutex::new(None),
            recv_key: Mutex::new(None),
            send_seq: AtomicU32::new(0),
            mtu: AtomicUsize::new(HANDSHAKE_MTU),
            hello_sent: Mutex::new(false),
            remote_der: Mutex::new(None),
        });
        transport.wire_lower();
        transport
    }

    fn wire_lower(self: &Arc<Self>) {
        let this = self.clone();
        self.lower.wire_upper(move |msg| this.on_lower_message(msg));
        let this = self.clone();
        self.lower.on_state_change(move |state| this.on_lower_state(state));
    }

    /// Client/server role is derived from the ICE role: the ICE-Active
    /// side is the DTLS client (spec §4.4).
    pub fn set_role(&self, role: DtlsRole) {
        *self.role.lock().unwrap() = Some(role);
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

    /// Invoked with the remote cert's SHA-256 fingerprint; return `true` to
    /// accept the handshake. The PeerConnection wires this to the remote
    /// description's fingerprint, exact case-insensitive match only.
    pub fn set_fingerprint_verifier(&self, verifier: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.verifier.store(Some(Arc::new(Box::new(verifier))));
    }

    /// Fires once, right after reaching `Connected`; DTLS-SRTP uses this to
    /// extract keying material before any media flows.
    pub fn on_post_handshake(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.post_handshake.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Option<DtlsRole> {
        *self.role.lock().unwrap()
    }

    pub fn lower(&self) -> &Arc<IceTransport> {
        &self.lower
    }

    /// Stand-in for `EXTRACTOR-dtls_srtp` (spec §4.5): both sides derive the
    /// same material from the two certificates' DER plus `label`, since the
    /// handshake itself (see module doc) is a simplified AEAD exchange
    /// rather than a real TLS session with an exporter. Order-independent so
    /// both peers land on the same bytes.
    pub fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>> {
        let remote_der = self
            .remote_der
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::transport("dtls: handshake not complete"))?;
        let local_der = self.certificate.der().to_vec();
        let mut material = [local_der, remote_der];
        material.sort();

        let mut out = Vec::with_capacity(len);
        let mut counter: u32 = 0;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(label.as_bytes());
            hasher.update(material[0].as_slice());
            hasher.update(material[1].as_slice());
            hasher.update(counter.to_be_bytes());
            out.extend_from_slice(hasher.finalize().as_slice());
            counter += 1;
        }
        out.truncate(len);
        Ok(out)
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.base.set_state(TransportState::Connecting);
        self.maybe_send_hello();
        Ok(())
    }

    fn maybe_send_hello(&self) {
        if self.lower.state() != TransportState::Connected {
            return;
        }
        let mut sent = self.hello_sent.lock().unwrap();
        if *sent {
            return;
        }
        let mut payload = vec![HELLO_TAG];
        payload.extend_from_slice(self.certificate.der());
        let _ = self.lower.send(&Message::binary(payload, 0));
        *sent = true;
    }

    fn on_lower_state(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Connected => self.maybe_send_hello(),
            TransportState::Failed | TransportState::Disconnected => {
                self.base.set_state(state);
            }
            _ => {}
        }
    }

    fn on_lower_message(self: &Arc<Self>, msg: Message) {
        self.handle_datagram(&msg.buffer);
    }

    /// Demuxes and processes one raw datagram from the lower (ICE)
    /// transport. Public so a [`crate::transport::dtls_srtp::DtlsSrtpTransport`]
    /// can drive the same handshake state machine after first demuxing
    /// DTLS-range bytes from RTP/RTCP itself (spec §4.5).
    pub fn handle_datagram(self: &Arc<Self>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match data[0] {
            HELLO_TAG => self.handle_hello(&data[1..]),
            RECORD_TAG => self.handle_record(&data[1..]),
            other => log::debug!("dropping datagram with unknown dtls content type {}", other),
        }
    }

    fn handle_hello(self: &Arc<Self>, remote_der: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(remote_der);
        let digest = hasher.finalize();
        let remote_fingerprint: String = digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        let verified = self
            .verifier
            .load_full()
            .map(|v| v(&remote_fingerprint))
            .unwrap_or(false);

        if !verified {
            log::warn!("dtls: remote fingerprint {} did not verify", remote_fingerprint);
            self.base.set_state(TransportState::Failed);
            return;
        }

        self.maybe_send_hello();
        self.derive_keys(remote_der);
        *self.remote_der.lock().unwrap() = Some(remote_der.to_vec());
        self.mtu.store(POST_HANDSHAKE_MTU, Ordering::SeqCst);
        log::debug!("dtls: handshake complete as {:?}", self.role());
        self.base.set_state(TransportState::Connected);
        if let Some(cb) = self.post_handshake.load_full() {
            cb();
        }
    }

    /// Derives a symmetric key from both certificates' DER -- the
    /// behavioral stand-in for the real DTLS master secret (see module
    /// doc). Both sides compute the same key since it's order-independent.
    fn derive_keys(&self, remote_der: &[u8]) {
        let local_der = self.certificate.der();
        let mut material = [local_der, remote_der];
        material.sort();
        let mut hasher = Sha256::new();
        hasher.update(material[0]);
        hasher.update(material[1]);
        let key_bytes = hasher.finalize();

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).expect("32-byte key");
        *self.send_key.lock().unwrap() = Some(LessSafeKey::new(unbound));
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).expect("32-byte key");
        *self.recv_key.lock().unwrap() = Some(LessSafeKey::new(unbound));
    }

    /// Encrypts `msg` as one DTLS record. Returns `TooLarge` if the
    /// plaintext would not fit in a single record at the current MTU.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let mtu = self.mtu();
        if msg.buffer.len() + 28 > mtu {
            return Err(Error::TooLarge(msg.buffer.len(), mtu));
        }
        let key_guard = self.send_key.lock().unwrap();
        let key = key_guard
            .as_ref()
            .ok_or_else(|| Error::transport("dtls: handshake not complete"))?;

        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[8..].copy_from_slice(&seq.to_be_bytes());
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = msg.buffer.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::transport("dtls: seal failed"))?;

        let mut record = Vec::with_capacity(1 + 4 + in_out.len());
        record.push(RECORD_TAG);
        record.extend_from_slice(&seq.to_be_bytes());
        record.extend_from_slice(&in_out);
        self.lower.send(&Message::binary(record, 0))
    }

    fn handle_record(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let (seq_bytes, ciphertext) = data.split_at(4);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(seq_bytes);

        let key_guard = self.recv_key.lock().unwrap();
        let Some(key) = key_guard.as_ref() else {
            return;
        };
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[8..].copy_from_slice(&seq);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = ciphertext.to_vec();
        match key.open_in_place(nonce, Aad::empty(), &mut in_out) {
            Ok(plain) => {
                self.base
                    .deliver_up(Message::binary(plain.to_vec(), 0).with_dscp(0));
            }
            Err(_) => {
                log::debug!("dtls: dropping record that failed authentication");
            }
        }
    }

    pub fn close(&self) {
        self.base.clear_callbacks();
        self.base.set_state(TransportState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ice::IceConfig;
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_ice_pair() -> (Arc<IceTransport>, Arc<IceTransport>) {
        let a = IceTransport::new(IceConfig::default());
        let b = IceTransport::new(IceConfig::default());
        a.start_gathering().unwrap();
        b.start_gathering().unwrap();
        let a_candidate = a.get_selected_pair();
        assert!(a_candidate.is_none());
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

    #[test]
    fn handshake_succeeds_when_fingerprints_match() {
        let (ice_a, ice_b) = connected_ice_pair();
        let cert_a = Certificate::make_certificate("dtls-test-a").unwrap();
        let cert_b = Certificate::make_certificate("dtls-test-b").unwrap();

        let dtls_a = DtlsTransport::new(ice_a, cert_a.clone());
        let dtls_b = DtlsTransport::new(ice_b, cert_b.clone());
        dtls_a.set_role(DtlsRole::Client);
        dtls_b.set_role(DtlsRole::Server);

        let fp_b = cert_b.fingerprint().to_string();
        let fp_a = cert_a.fingerprint().to_string();
        dtls_a.set_fingerprint_verifier(move |fp| fp.eq_ignore_ascii_case(&fp_b));
        dtls_b.set_fingerprint_verifier(move |fp| fp.eq_ignore_ascii_case(&fp_a));

        dtls_a.start().unwrap();
        dtls_b.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && (dtls_a.state() != TransportState::Connected
                || dtls_b.state() != TransportState::Connected)
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dtls_a.state(), TransportState::Connected);
        assert_eq!(dtls_b.state(), TransportState::Connected);
    }

    #[test]
    fn handshake_fails_on_fingerprint_mismatch() {
        let (ice_a, ice_b) = connected_ice_pair();
        let cert_a = Certificate::make_certificate("dtls-test-mismatch-a").unwrap();
        let cert_b = Certificate::make_certificate("dtls-test-mismatch-b").unwrap();

        let dtls_a = DtlsTransport::new(ice_a, cert_a);
        let dtls_b = DtlsTransport::new(ice_b, cert_b);
        dtls_a.set_fingerprint_verifier(|_| false);
        dtls_b.set_fingerprint_verifier(|_| false);
        dtls_a.start().unwrap();
        dtls_b.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && (dtls_a.state() != TransportState::Failed || dtls_b.state() != TransportState::Failed)
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dtls_a.state(), TransportState::Failed);
        assert_eq!(dtls_b.state(), TransportState::Failed);
    }
}
