//! C12 — PeerConnection: the signaling state machine and transport
//! orchestrator everything else in this crate is wired up underneath
//! (spec §3 "PeerConnection", §4.10).
//!
//! Owns exactly one ICE transport, one DTLS transport, and (depending on
//! what's been negotiated) an SCTP transport and/or a DTLS-SRTP transport
//! layered over it -- all BUNDLEd onto the single ICE 5-tuple (spec §4.2).
//! Construction of the lower layers is lazy and event-driven: ICE comes up
//! on the first local/remote description, DTLS once ICE reaches `Connected`,
//! and SCTP/DTLS-SRTP once DTLS is `Connected` and the negotiated
//! descriptions actually call for them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use arc_swap::ArcSwapOption;

use crate::candidate::Candidate;
use crate::certificate::Certificate;
use crate::configuration::Configuration;
use crate::data_channel::{DataChannel, DataChannelRegistry, DataChannelState, ParityRole};
use crate::data_channel::dcep;
use crate::description::{
    ApplicationEntry, Description, DescriptionType, Direction, Entry, MediaEntry, SetupRole,
};
use crate::error::{Error, Result};
use crate::media::{rtcp, MediaRouter, Track};
use crate::message::{Message, MessageKind};
use crate::reliability::Reliability;
use crate::transport::dtls::{DtlsRole, DtlsTransport};
use crate::transport::dtls_srtp::DtlsSrtpTransport;
use crate::transport::ice::{IceConfig, IceRole, IceTransport};
use crate::transport::sctp::SctpTransport;
use crate::transport::TransportState;

/// Aggregate connection state a caller actually cares about (spec §4.10):
/// derived from the ICE/DTLS/SCTP/DTLS-SRTP transports, not a transport
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerConnectionState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl PeerConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerConnectionState::New,
            1 => PeerConnectionState::Connecting,
            2 => PeerConnectionState::Connected,
            3 => PeerConnectionState::Disconnected,
            4 => PeerConnectionState::Failed,
            _ => PeerConnectionState::Closed,
        }
    }
}

/// The offer/answer/rollback state machine (spec §4.10 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
}

/// Parameters for [`PeerConnection::create_data_channel`].
#[derive(Debug, Clone, Default)]
pub struct DataChannelInit {
    pub protocol: String,
    pub reliability: Reliability,
    /// Pre-agreed on both sides out of band; skips DCEP entirely (spec
    /// §4.7).
    pub negotiated: bool,
    /// Required when `negotiated` is set; otherwise a hint honored verbatim
    /// if present, allocated from the current parity otherwise.
    pub id: Option<u16>,
}

struct SignalingInner {
    state: SignalingState,
    local: Option<Description>,
    remote: Option<Description>,
    /// The last description pair that actually reached `Stable`, restored
    /// verbatim by a local rollback (spec §4.10, §8 scenario 5).
    current_local: Option<Description>,
    final_role: Option<SetupRole>,
}

type VoidCallback = Box<dyn Fn() + Send + Sync>;
type DescriptionCallback = Box<dyn Fn(Description) + Send + Sync>;
type CandidateCallback = Box<dyn Fn(Candidate) + Send + Sync>;
type StateCallback = Box<dyn Fn(PeerConnectionState) + Send + Sync>;
type TransportStateCallback = Box<dyn Fn(TransportState) + Send + Sync>;
type SignalingStateCallback = Box<dyn Fn(SignalingState) + Send + Sync>;
type DataChannelCallback = Box<dyn Fn(Arc<DataChannel>) + Send + Sync>;
type TrackCallback = Box<dyn Fn(Arc<Track>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_local_description: ArcSwapOption<DescriptionCallback>,
    on_local_candidate: ArcSwapOption<CandidateCallback>,
    on_state_change: ArcSwapOption<StateCallback>,
    on_ice_state_change: ArcSwapOption<TransportStateCallback>,
    on_gathering_state_change: ArcSwapOption<Box<dyn Fn(crate::transport::ice::GatheringState) + Send + Sync>>,
    on_signaling_state_change: ArcSwapOption<SignalingStateCallback>,
    on_data_channel: ArcSwapOption<DataChannelCallback>,
    on_track: ArcSwapOption<TrackCallback>,
}

impl Callbacks {
    fn clear(&self) {
        self.on_local_description.store(None);
        self.on_local_candidate.store(None);
        self.on_state_change.store(None);
        self.on_ice_state_change.store(None);
        self.on_gathering_state_change.store(None);
        self.on_signaling_state_change.store(None);
        self.on_data_channel.store(None);
        self.on_track.store(None);
    }
}

fn random_ice_token(len: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARS[(rand::random::<u32>() as usize) % CHARS.len()] as char)
        .collect()
}

/// One WebRTC connection (spec §3 "PeerConnection"). Owns the signaling
/// state machine, the lazily-built transport stack, and every
/// `DataChannel`/`Track` negotiated over it.
pub struct PeerConnection {
    config: Configuration,
    certificate: Arc<Certificate>,
    ice_ufrag: String,
    ice_pwd: String,
    state: AtomicU8,
    signaling: Mutex<SignalingInner>,
    local_entries: Mutex<Vec<Entry>>,
    ice: ArcSwapOption<IceTransport>,
    dtls: ArcSwapOption<DtlsTransport>,
    dtls_srtp: ArcSwapOption<DtlsSrtpTransport>,
    sctp: ArcSwapOption<SctpTransport>,
    data_channels: DataChannelRegistry,
    pending_channels: Mutex<Vec<Arc<DataChannel>>>,
    tracks: Mutex<HashMap<String, Weak<Track>>>,
    pending_tracks: Mutex<Vec<Arc<Track>>>,
    media_router: MediaRouter,
    /// Flipped by `add_track`/`create_data_channel` (spec §4.10); only an
    /// `Offer` built from `Stable` ever consumes it.
    negotiation_needed: AtomicBool,
    callbacks: Callbacks,
}

impl PeerConnection {
    pub fn new(config: Configuration) -> Result<Arc<Self>> {
        let certificate = Certificate::make_certificate(crate::constants::GENERATED_CERTIFICATE_ORIGIN)?;
        Ok(Arc::new(PeerConnection {
            config,
            certificate,
            ice_ufrag: random_ice_token(8),
            ice_pwd: random_ice_token(24),
            state: AtomicU8::new(PeerConnectionState::New as u8),
            signaling: Mutex::new(SignalingInner {
                state: SignalingState::Stable,
                local: None,
                remote: None,
                current_local: None,
                final_role: None,
            }),
            local_entries: Mutex::new(Vec::new()),
            ice: ArcSwapOption::from(None),
            dtls: ArcSwapOption::from(None),
            dtls_srtp: ArcSwapOption::from(None),
            sctp: ArcSwapOption::from(None),
            data_channels: DataChannelRegistry::new(),
            pending_channels: Mutex::new(Vec::new()),
            tracks: Mutex::new(HashMap::new()),
            pending_tracks: Mutex::new(Vec::new()),
            media_router: MediaRouter::new(),
            negotiation_needed: AtomicBool::new(false),
            callbacks: Callbacks::default(),
        }))
    }

    pub fn state(&self) -> PeerConnectionState {
        PeerConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling.lock().unwrap().state
    }

    fn set_state(self: &Arc<Self>, new_state: PeerConnectionState) {
        let prev = self.state.swap(new_state as u8, Ordering::SeqCst);
        if prev != new_state as u8 {
            log::debug!(
                "peer connection state: {:?} -> {:?}",
                PeerConnectionState::from_u8(prev),
                new_state
            );
            if let Some(cb) = self.callbacks.on_state_change.load_full() {
                cb(new_state);
            }
        }
    }

    fn set_signaling_state(&self, sig: &mut SignalingInner, new_state: SignalingState) {
        if sig.state == new_state {
            return;
        }
        log::debug!("signaling state: {:?} -> {:?}", sig.state, new_state);
        sig.state = new_state;
        if let Some(cb) = self.callbacks.on_signaling_state_change.load_full() {
            cb(new_state);
        }
    }

    // -- callback registration (spec §6 API surface) --

    pub fn on_local_description(&self, cb: impl Fn(Description) + Send + Sync + 'static) {
        self.callbacks.on_local_description.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_local_candidate(&self, cb: impl Fn(Candidate) + Send + Sync + 'static) {
        self.callbacks.on_local_candidate.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_state_change(&self, cb: impl Fn(PeerConnectionState) + Send + Sync + 'static) {
        self.callbacks.on_state_change.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_ice_state_change(&self, cb: impl Fn(TransportState) + Send + Sync + 'static) {
        self.callbacks.on_ice_state_change.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_gathering_state_change(
        &self,
        cb: impl Fn(crate::transport::ice::GatheringState) + Send + Sync + 'static,
    ) {
        self.callbacks.on_gathering_state_change.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_signaling_state_change(&self, cb: impl Fn(SignalingState) + Send + Sync + 'static) {
        self.callbacks.on_signaling_state_change.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_data_channel(&self, cb: impl Fn(Arc<DataChannel>) + Send + Sync + 'static) {
        self.callbacks.on_data_channel.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn on_track(&self, cb: impl Fn(Arc<Track>) + Send + Sync + 'static) {
        self.callbacks.on_track.store(Some(Arc::new(Box::new(cb))));
    }

    // -- ICE orchestration --

    fn ensure_ice_created(self: &Arc<Self>, is_offerer: bool) {
        if self.ice.load_full().is_some() {
            return;
        }
        let ice = IceTransport::new(IceConfig {
            trickle_timeout: self.config.ice_trickle_timeout,
        });
        ice.set_role(if is_offerer { IceRole::Controlling } else { IceRole::Controlled });

        let this = self.clone();
        ice.on_candidate(move |c| {
            if let Some(cb) = this.callbacks.on_local_candidate.load_full() {
                cb(c);
            }
        });
        let this = self.clone();
        ice.on_gathering_state(move |s| {
            if let Some(cb) = this.callbacks.on_gathering_state_change.load_full() {
                cb(s);
            }
        });
        let this = self.clone();
        ice.on_state_change(move |s| this.on_ice_transport_state(s));

        self.ice.store(Some(ice.clone()));
        let _ = ice.start_gathering();
    }

    fn on_ice_transport_state(self: &Arc<Self>, state: TransportState) {
        if let Some(cb) = self.callbacks.on_ice_state_change.load_full() {
            cb(state);
        }
        match state {
            TransportState::Connected | TransportState::Completed => self.start_dtls_if_needed(),
            TransportState::Failed => self.transition_to_failed(),
            _ => {}
        }
        self.maybe_update_peer_connection_state();
    }

    /// Adds a trickled remote candidate (spec §4.3). The ICE transport must
    /// already exist -- i.e. a description has been set on this connection
    /// at least once.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        let ice = self.ice.load_full().ok_or_else(|| Error::invalid("no ICE transport yet"))?;
        ice.add_remote_candidate(candidate)
    }

    // -- DTLS / SCTP / DTLS-SRTP orchestration --

    fn resolve_roles(&self) -> (DtlsRole, ParityRole) {
        match self.signaling.lock().unwrap().final_role {
            Some(SetupRole::Active) => (DtlsRole::Client, ParityRole::Active),
            _ => (DtlsRole::Server, ParityRole::Passive),
        }
    }

    /// Resolves which side is the DTLS client/server once both descriptions
    /// are known (spec §4.4/§4.7, §9 "DTLS role derived from ICE role").
    fn resolve_final_role(&self, sig: &mut SignalingInner) {
        if sig.final_role.is_some() {
            return;
        }
        let (Some(local), Some(remote)) = (&sig.local, &sig.remote) else {
            return;
        };
        let role = if local.typ == DescriptionType::Offer {
            match remote.role {
                SetupRole::Active => SetupRole::Passive,
                _ => SetupRole::Active,
            }
        } else {
            local.role
        };
        sig.final_role = Some(role);
    }

    fn has_media(&self, sig: &SignalingInner) -> bool {
        sig.local.as_ref().map(|d| d.media_entries().next().is_some()).unwrap_or(false)
            || sig.remote.as_ref().map(|d| d.media_entries().next().is_some()).unwrap_or(false)
    }

    fn has_application(&self, sig: &SignalingInner) -> bool {
        sig.local.as_ref().and_then(|d| d.application_entry()).is_some()
            && sig.remote.as_ref().and_then(|d| d.application_entry()).is_some()
    }

    fn start_dtls_if_needed(self: &Arc<Self>) {
        if self.dtls.load_full().is_some() {
            return;
        }
        let Some(ice) = self.ice.load_full() else { return };
        let (has_media, has_remote_fp) = {
            let sig = self.signaling.lock().unwrap();
            (self.has_media(&sig), sig.remote.as_ref().map(|d| d.fingerprint.clone()))
        };

        let dtls = DtlsTransport::new(ice.clone(), self.certificate.clone());
        let (dtls_role, _) = self.resolve_roles();
        dtls.set_role(dtls_role);
        if let Some(fp) = has_remote_fp {
            dtls.set_fingerprint_verifier(move |got| got.eq_ignore_ascii_case(&fp));
        }
        let this = self.clone();
        dtls.on_state_change(move |s| this.on_dtls_state_change(s));

        if has_media {
            let dtls_srtp = DtlsSrtpTransport::new(dtls.clone());
            let this = self.clone();
            dtls_srtp.on_state_change(move |s| this.on_dtls_srtp_state_change(s));
            let this = self.clone();
            dtls_srtp.wire_upper(move |msg| this.forward_media(msg));
            self.dtls_srtp.store(Some(dtls_srtp.clone()));
            self.dtls.store(Some(dtls));
            dtls_srtp.start();
        } else {
            self.dtls.store(Some(dtls.clone()));
            let _ = dtls.start();
        }
    }

    fn on_dtls_state_change(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Connected => self.start_sctp_if_needed(),
            TransportState::Failed => self.transition_to_failed(),
            _ => {}
        }
        self.maybe_update_peer_connection_state();
    }

    fn start_sctp_if_needed(self: &Arc<Self>) {
        if self.sctp.load_full().is_some() {
            return;
        }
        let Some(dtls) = self.dtls.load_full() else { return };
        let (needed, remote_port) = {
            let sig = self.signaling.lock().unwrap();
            (
                self.has_application(&sig),
                sig.remote.as_ref().and_then(|d| d.application_entry()).map(|a| a.sctp_port),
            )
        };
        if !needed {
            return;
        }
        let sctp = SctpTransport::new(dtls.clone());
        if let Some(port) = remote_port {
            sctp.set_remote_port(port);
        }
        let this = self.clone();
        sctp.on_state_change(move |s| this.on_sctp_state_change(s));
        let this = self.clone();
        sctp.wire_upper(move |msg| this.on_sctp_message(msg));
        // `SctpTransport::new` syncs from an already-connected lower DTLS
        // transport inside its own constructor, before the callback above
        // is registered -- catch that transition here instead of missing it.
        let already_connected = sctp.state() == TransportState::Connected;
        self.sctp.store(Some(sctp));
        if already_connected {
            self.on_sctp_state_change(TransportState::Connected);
        }
    }

    fn on_sctp_state_change(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Connected => {
                let (_, parity) = self.resolve_roles();
                self.data_channels.set_role(parity);
                let sctp = self.sctp.load_full().unwrap();
                let pending: Vec<_> = std::mem::take(&mut *self.pending_channels.lock().unwrap());
                for ch in pending {
                    ch.attach_sctp(&sctp);
                    let _ = ch.start_handshake();
                }
            }
            TransportState::Failed => self.transition_to_failed(),
            _ => {}
        }
        self.maybe_update_peer_connection_state();
    }

    fn on_dtls_srtp_state_change(self: &Arc<Self>, state: TransportState) {
        match state {
            TransportState::Connected => {
                let dtls_srtp = self.dtls_srtp.load_full().unwrap();
                let pending: Vec<_> = std::mem::take(&mut *self.pending_tracks.lock().unwrap());
                for t in pending {
                    t.attach_dtls_srtp(&dtls_srtp);
                    t.open();
                }
            }
            TransportState::Failed => self.transition_to_failed(),
            _ => {}
        }
        self.maybe_update_peer_connection_state();
    }

    fn transition_to_failed(self: &Arc<Self>) {
        self.set_state(PeerConnectionState::Failed);
    }

    fn maybe_update_peer_connection_state(self: &Arc<Self>) {
        if self.state() == PeerConnectionState::Closed || self.state() == PeerConnectionState::Failed {
            return;
        }
        let ice_ok = self.ice.load_full().map(|t| t.state().is_up()).unwrap_or(false);
        let dtls_ok = self.dtls.load_full().map(|t| t.state() == TransportState::Connected).unwrap_or(false);
        let media_ok = self
            .dtls_srtp
            .load_full()
            .map(|t| t.state() == TransportState::Connected)
            .unwrap_or(true);
        let sctp_needed = self.has_application(&self.signaling.lock().unwrap());
        let sctp_ok = if sctp_needed {
            self.sctp.load_full().map(|t| t.state() == TransportState::Connected).unwrap_or(false)
        } else {
            true
        };
        if ice_ok && dtls_ok && media_ok && sctp_ok {
            self.set_state(PeerConnectionState::Connected);
        } else if self.state() == PeerConnectionState::New {
            self.set_state(PeerConnectionState::Connecting);
        }
    }

    // -- media/data-channel registration helpers --

    fn register_track(self: &Arc<Self>, track: &Arc<Track>) {
        self.media_router.register(&track.description());
        self.tracks.lock().unwrap().insert(track.mid().to_string(), Arc::downgrade(track));
        if let Some(dtls_srtp) = self.dtls_srtp.load_full() {
            track.attach_dtls_srtp(&dtls_srtp);
            if dtls_srtp.state() == TransportState::Connected {
                track.open();
            }
        } else {
            self.pending_tracks.lock().unwrap().push(track.clone());
        }
    }

    fn get_track(&self, mid: &str) -> Option<Arc<Track>> {
        self.tracks.lock().unwrap().get(mid).and_then(Weak::upgrade)
    }

    fn register_channel(self: &Arc<Self>, channel: &Arc<DataChannel>, stream: u16) {
        self.data_channels.insert(stream, channel);
        if let Some(sctp) = self.sctp.load_full() {
            channel.attach_sctp(&sctp);
            if sctp.state() == TransportState::Connected {
                let _ = channel.start_handshake();
            } else {
                self.pending_channels.lock().unwrap().push(channel.clone());
            }
        } else {
            self.pending_channels.lock().unwrap().push(channel.clone());
        }
    }

    /// Adds an outgoing Application entry to the next offer/answer if one
    /// isn't already present (spec §4.10: "SCTP created... AND local+remote
    /// descriptions have an Application entry").
    fn ensure_application_entry(&self) {
        let mut entries = self.local_entries.lock().unwrap();
        if entries.iter().any(|e| matches!(e, Entry::Application(_))) {
            return;
        }
        let mid = entries.len().to_string();
        entries.push(Entry::Application(ApplicationEntry {
            mid,
            sctp_port: self.config.sctp_port,
            max_message_size: self.config.max_message_size,
        }));
    }

    // -- user-facing data channel / track creation (spec §6) --

    pub fn create_data_channel(
        self: &Arc<Self>,
        label: impl Into<String>,
        init: Option<DataChannelInit>,
    ) -> Result<Arc<DataChannel>> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::Closed);
        }
        let init = init.unwrap_or_default();
        if !init.reliability.is_valid() {
            return Err(Error::invalid("max_packet_lifetime and max_retransmits are mutually exclusive"));
        }
        let stream = self.data_channels.allocate(init.id)?;
        let initial_state = if init.negotiated { DataChannelState::Open } else { DataChannelState::Opening };
        let channel = DataChannel::new(
            stream,
            init.id.is_some(),
            label.into(),
            init.protocol,
            init.reliability,
            init.negotiated,
            initial_state,
        );

        self.ensure_application_entry();
        self.register_channel(&channel, stream);
        self.negotiation_needed.store(true, Ordering::SeqCst);
        Ok(channel)
    }

    /// Adds a locally-originated media track (spec §6 "add_track"). `mid`
    /// defaults to the next free index if unset.
    pub fn add_track(self: &Arc<Self>, kind: impl Into<String>, mid: Option<String>) -> Result<Arc<Track>> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::Closed);
        }
        let mut local_entries = self.local_entries.lock().unwrap();
        let mid = mid.unwrap_or_else(|| local_entries.len().to_string());
        let entry = MediaEntry {
            mid: mid.clone(),
            kind: kind.into(),
            direction: Direction::SendRecv,
            rtpmap: BTreeMap::new(),
            ssrcs: vec![rand::random::<u32>() & 0x7fff_ffff],
            bitrate: None,
        };
        local_entries.push(Entry::Media(entry.clone()));
        drop(local_entries);

        let track = Track::new(entry);
        self.register_track(&track);
        self.negotiation_needed.store(true, Ordering::SeqCst);
        Ok(track)
    }

    // -- local/remote description exchange (spec §4.10) --

    /// Builds a local description for `typ` (spec §6 "set_local_description"
    /// without an explicit offer/answer already in hand -- mirrors
    /// `create_offer`/`create_answer` collapsed into one call per the
    /// signaling table, since the type to produce is fully determined by
    /// the current signaling state).
    pub fn set_local_description(self: &Arc<Self>, typ: DescriptionType) -> Result<Description> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::Closed);
        }
        let mut sig = self.signaling.lock().unwrap();

        if typ == DescriptionType::Rollback {
            if sig.state != SignalingState::HaveLocalOffer {
                return Err(Error::invalid("rollback only valid from have-local-offer"));
            }
            let restored = sig
                .current_local
                .clone()
                .ok_or_else(|| Error::invalid("no prior local description to restore"))?;
            sig.local = Some(restored.clone());
            self.set_signaling_state(&mut sig, SignalingState::Stable);
            return Ok(restored);
        }

        let is_offerer = matches!(sig.state, SignalingState::Stable) || typ == DescriptionType::Offer;
        drop(sig);
        self.ensure_ice_created(is_offerer);
        let mut sig = self.signaling.lock().unwrap();

        let resolved_type = match sig.state {
            SignalingState::Stable => DescriptionType::Offer,
            SignalingState::HaveRemoteOffer => match typ {
                DescriptionType::Offer => {
                    return Err(Error::invalid("an offer is already pending from the remote side"));
                }
                DescriptionType::Pranswer => DescriptionType::Pranswer,
                _ => DescriptionType::Answer,
            },
            SignalingState::HaveLocalOffer => {
                return Err(Error::invalid("a local description is already outstanding"));
            }
            SignalingState::HaveLocalPranswer => match typ {
                DescriptionType::Pranswer => DescriptionType::Pranswer,
                _ => DescriptionType::Answer,
            },
            SignalingState::HaveRemotePranswer => DescriptionType::Answer,
        };

        if sig.state == SignalingState::Stable
            && resolved_type == DescriptionType::Offer
            && !self.negotiation_needed.load(Ordering::SeqCst)
        {
            return Err(Error::invalid("no negotiation is needed"));
        }

        let desc = self.build_local_description(resolved_type, &sig)?;
        sig.local = Some(desc.clone());

        let next_state = match (sig.state, resolved_type) {
            (SignalingState::Stable, DescriptionType::Offer) => {
                self.negotiation_needed.store(false, Ordering::SeqCst);
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveRemoteOffer, DescriptionType::Pranswer) => SignalingState::HaveLocalPranswer,
            (_, DescriptionType::Answer) => {
                sig.current_local = Some(desc.clone());
                SignalingState::Stable
            }
            _ => sig.state,
        };
        self.resolve_final_role(&mut sig);
        self.set_signaling_state(&mut sig, next_state);
        drop(sig);

        if let Some(cb) = self.callbacks.on_local_description.load_full() {
            cb(desc.clone());
        }
        Ok(desc)
    }

    fn build_local_description(&self, typ: DescriptionType, sig: &SignalingInner) -> Result<Description> {
        let role = if typ == DescriptionType::Offer { SetupRole::ActPass } else { SetupRole::Active };
        let mut desc = Description::new(typ, role);
        desc.ice_ufrag = self.ice_ufrag.clone();
        desc.ice_pwd = self.ice_pwd.clone();
        desc.fingerprint = self.certificate.fingerprint().to_string();

        desc.entries = if typ == DescriptionType::Offer {
            self.local_entries.lock().unwrap().clone()
        } else {
            let remote = sig.remote.as_ref().ok_or_else(|| Error::invalid("no remote offer to answer"))?;
            self.reciprocate_entries(remote)
        };
        Ok(desc)
    }

    /// Builds the answer's entries by walking the remote offer's m-lines in
    /// order, matching each against an unclaimed local entry of the same
    /// kind where one exists (spec §4.10 "reciprocation"). A remote media
    /// entry with no matching local track still gets a `Track` via
    /// `on_track` so the caller can receive it even without having called
    /// `add_track` first.
    fn reciprocate_entries(self: &PeerConnection, remote: &Description) -> Vec<Entry> {
        let local_entries = self.local_entries.lock().unwrap().clone();
        let has_local_app = local_entries.iter().any(|e| matches!(e, Entry::Application(_)));
        let mut media_pool: Vec<MediaEntry> = local_entries
            .iter()
            .filter_map(|e| match e {
                Entry::Media(m) => Some(m.clone()),
                _ => None,
            })
            .collect();

        let mut out = Vec::with_capacity(remote.entries.len());
        for remote_entry in &remote.entries {
            match remote_entry {
                Entry::Application(remote_app) => {
                    out.push(Entry::Application(ApplicationEntry {
                        mid: remote_app.mid.clone(),
                        sctp_port: self.config.sctp_port,
                        max_message_size: self.config.max_message_size.min(remote_app.max_message_size),
                    }));
                    let _ = has_local_app;
                }
                Entry::Media(remote_media) => {
                    let matched = media_pool.iter().position(|m| m.kind == remote_media.kind);
                    let (ssrcs, rtpmap) = match matched {
                        Some(i) => {
                            let m = media_pool.remove(i);
                            (m.ssrcs, m.rtpmap)
                        }
                        None => (Vec::new(), BTreeMap::new()),
                    };
                    let entry = MediaEntry {
                        mid: remote_media.mid.clone(),
                        kind: remote_media.kind.clone(),
                        direction: remote_media.direction.reversed(),
                        rtpmap,
                        ssrcs,
                        bitrate: None,
                    };
                    self.reciprocate_track(&entry, matched.is_some());
                    out.push(Entry::Media(entry));
                }
            }
        }
        out
    }

    fn reciprocate_track(self: &PeerConnection, entry: &MediaEntry, was_locally_added: bool) {
        if self.tracks.lock().unwrap().contains_key(&entry.mid) {
            return;
        }
        let track = Track::new(entry.clone());
        self.media_router.register(entry);
        self.tracks.lock().unwrap().insert(entry.mid.clone(), Arc::downgrade(&track));
        if let Some(dtls_srtp) = self.dtls_srtp.load_full() {
            track.attach_dtls_srtp(&dtls_srtp);
            if dtls_srtp.state() == TransportState::Connected {
                track.open();
            }
        } else {
            self.pending_tracks.lock().unwrap().push(track.clone());
        }
        if !was_locally_added {
            if let Some(cb) = self.callbacks.on_track.load_full() {
                cb(track);
            }
        }
    }

    /// Applies a description from the remote side (spec §6
    /// "set_remote_description"). Validates it, checks for a self-loop, and
    /// advances the signaling state per the §4.10 table.
    pub fn set_remote_description(self: &Arc<Self>, desc: Description) -> Result<()> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::Closed);
        }
        desc.validate_as_remote()?;

        let mut sig = self.signaling.lock().unwrap();
        if let Some(local) = &sig.local {
            if local.is_self_loop(&desc) {
                return Err(Error::invalid("remote description is a self-loop"));
            }
        }

        let is_offerer = sig.state == SignalingState::Stable && desc.typ != DescriptionType::Offer;
        let creates_ice = self.ice.load_full().is_none();

        let next_state = match (sig.state, desc.typ) {
            (SignalingState::Stable, DescriptionType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, DescriptionType::Answer) => {
                sig.current_local = sig.local.clone();
                SignalingState::Stable
            }
            (SignalingState::HaveLocalOffer, DescriptionType::Pranswer) => SignalingState::HaveRemotePranswer,
            (SignalingState::HaveRemotePranswer, DescriptionType::Answer) => {
                sig.current_local = sig.local.clone();
                SignalingState::Stable
            }
            // An incoming offer while we already have one outstanding is an
            // implicit rollback of our own offer (spec §4.10).
            (SignalingState::HaveLocalOffer, DescriptionType::Offer) => SignalingState::HaveRemoteOffer,
            _ => return Err(Error::invalid("remote description not valid in the current signaling state")),
        };

        let candidates = desc.candidates.clone();
        sig.remote = Some(desc);
        self.resolve_final_role(&mut sig);
        self.set_signaling_state(&mut sig, next_state);
        drop(sig);

        self.ensure_ice_created(is_offerer);
        let _ = creates_ice;
        if let Some(ice) = self.ice.load_full() {
            for c in candidates {
                let _ = ice.add_remote_candidate(c);
            }
        }
        Ok(())
    }

    // -- media/SCTP demux for the transport stack above --

    fn forward_media(self: &Arc<Self>, msg: Message) {
        if msg.buffer.len() < 2 {
            return;
        }
        let second_byte = msg.buffer[1];
        let is_rtcp = (second_byte & 0x7f) >= 64 && (second_byte & 0x7f) <= 95;
        if is_rtcp {
            let Ok(packets) = rtcp::RtcpPacket::unmarshal_compound(&msg.buffer) else {
                log::debug!("dropping malformed RTCP packet");
                return;
            };
            // Collect the mids targeted by any packet in the compound and
            // deliver the whole compound to each one exactly once; a
            // per-(packet, mid) delivery would re-run the full incoming
            // chain per match and double-fire PLI/NACK handling when two
            // packets in the same compound address the same mid.
            let mut mids: Vec<String> = packets.iter().flat_map(|p| self.media_router.route_rtcp(p)).collect();
            mids.sort();
            mids.dedup();
            for mid in mids {
                if let Some(track) = self.get_track(&mid) {
                    track.deliver_incoming(msg.clone());
                }
            }
        } else {
            let Ok(rtp) = crate::media::rtp::RtpPacket::unmarshal(&msg.buffer) else {
                log::debug!("dropping malformed RTP packet");
                return;
            };
            if let Some(mid) = self.media_router.route_rtp(rtp.ssrc, rtp.payload_type) {
                if let Some(track) = self.get_track(&mid) {
                    track.deliver_incoming(msg);
                }
            } else {
                log::trace!("dropping RTP packet for unrouted ssrc {}", rtp.ssrc);
            }
        }
    }

    fn on_sctp_message(self: &Arc<Self>, msg: Message) {
        if let Some(channel) = self.data_channels.get(msg.stream) {
            channel.handle_incoming(msg);
            return;
        }
        if msg.kind != MessageKind::Control || msg.buffer.first() != Some(&dcep::DCEP_OPEN) {
            return;
        }
        if !self.data_channels.is_remote_initiated_parity(msg.stream) {
            log::warn!("DCEP OPEN on stream {} with wrong parity, resetting", msg.stream);
            if let Some(sctp) = self.sctp.load_full() {
                let _ = sctp.reset_stream(msg.stream);
            }
            return;
        }
        let Ok(open) = dcep::Open::decode(&msg.buffer[1..]) else {
            log::debug!("dropping malformed DCEP OPEN on stream {}", msg.stream);
            return;
        };
        log::debug!("remote opened data channel {:?} on stream {}", open.label, msg.stream);
        let channel = DataChannel::new(
            msg.stream,
            false,
            open.label,
            open.protocol,
            open.reliability,
            false,
            DataChannelState::Opening,
        );
        // Remote-initiated: attach directly and ACK, rather than
        // `register_channel`'s locally-originated `start_handshake` path,
        // which would send a second, spurious DCEP OPEN on this stream.
        self.data_channels.insert(msg.stream, &channel);
        if let Some(sctp) = self.sctp.load_full() {
            channel.attach_sctp(&sctp);
        }
        let _ = channel.accept_remote_open();
        if let Some(cb) = self.callbacks.on_data_channel.load_full() {
            cb(channel);
        }
    }

    /// Tears down SCTP, then DTLS(-SRTP), then ICE, in that order (spec
    /// §4.10 "ordered teardown"). Idempotent.
    pub fn close(self: &Arc<Self>) {
        let prev = self.state.swap(PeerConnectionState::Closed as u8, Ordering::SeqCst);
        if prev == PeerConnectionState::Closed as u8 {
            return;
        }
        log::debug!("peer connection closing");
        if let Some(cb) = self.callbacks.on_state_change.load_full() {
            cb(PeerConnectionState::Closed);
        }
        self.callbacks.clear();

        for weak in self.tracks.lock().unwrap().values() {
            if let Some(t) = weak.upgrade() {
                t.close();
            }
        }

        let sctp = self.sctp.swap(None);
        let dtls_srtp = self.dtls_srtp.swap(None);
        let dtls = self.dtls.swap(None);
        let ice = self.ice.swap(None);
        thread::spawn(move || {
            if let Some(s) = sctp {
                s.close();
            }
            if let Some(d) = dtls_srtp {
                d.close();
            } else if let Some(d) = dtls {
                d.close();
            }
            if let Some(i) = ice {
                i.close();
            }
        });
    }
}
