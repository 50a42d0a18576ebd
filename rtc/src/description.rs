//! C3 — session description (spec §3 "Description", §6 "SDP").
//!
//! This is a hand-rolled codec for exactly the attribute subset §6 commits
//! to (BUNDLE-everything-on-one-transport, one Application entry, per-PT
//! media attributes). It is not a general-purpose SDP library -- the SDP
//! text serializer beyond these behavioral contracts is out of scope.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::candidate::Candidate;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionType {
    Unspec,
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl DescriptionType {
    fn as_str(self) -> &'static str {
        match self {
            DescriptionType::Unspec => "unspec",
            DescriptionType::Offer => "offer",
            DescriptionType::Answer => "answer",
            DescriptionType::Pranswer => "pranswer",
            DescriptionType::Rollback => "rollback",
        }
    }
}

/// DTLS setup role, carried as `a=setup:{active|passive|actpass}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRole {
    ActPass,
    Passive,
    Active,
}

impl SetupRole {
    fn as_str(self) -> &'static str {
        match self {
            SetupRole::ActPass => "actpass",
            SetupRole::Passive => "passive",
            SetupRole::Active => "active",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "actpass" => Ok(SetupRole::ActPass),
            "passive" => Ok(SetupRole::Passive),
            "active" => Ok(SetupRole::Active),
            other => Err(Error::protocol(format!("unknown setup role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "sendrecv" => Ok(Direction::SendRecv),
            "sendonly" => Ok(Direction::SendOnly),
            "recvonly" => Ok(Direction::RecvOnly),
            "inactive" => Ok(Direction::Inactive),
            other => Err(Error::protocol(format!("unknown direction: {other}"))),
        }
    }

    /// Direction as seen from the other side of the same m-line.
    pub fn reversed(self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => other,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Direction::Inactive)
    }
}

/// `a=rtpmap:<pt> <name>/<clock_rate>[/<params>]`, keyed by payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u32>,
    pub fmtp: Option<String>,
    pub rtcp_fbs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub mid: String,
    pub kind: String, // "audio" | "video"
    pub direction: Direction,
    pub rtpmap: BTreeMap<u8, RtpCodec>,
    pub ssrcs: Vec<u32>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationEntry {
    pub mid: String,
    pub sctp_port: u16,
    pub max_message_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Application(ApplicationEntry),
    Media(MediaEntry),
}

impl Entry {
    pub fn mid(&self) -> &str {
        match self {
            Entry::Application(a) => &a.mid,
            Entry::Media(m) => &m.mid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Description {
    pub typ: DescriptionType,
    pub role: SetupRole,
    pub session_id: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
    pub ended: bool,
    pub entries: Vec<Entry>,
    pub candidates: Vec<Candidate>,
}

impl Description {
    pub fn new(typ: DescriptionType, role: SetupRole) -> Self {
        Description {
            typ,
            role,
            session_id: rand::random::<u64>() & 0x7fff_ffff_ffff_ffff,
            ice_ufrag: String::new(),
            ice_pwd: String::new(),
            fingerprint: String::new(),
            ended: false,
            entries: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// The single Application entry, if any. Invariant (spec §3): exactly
    /// one or none.
    pub fn application_entry(&self) -> Option<&ApplicationEntry> {
        self.entries.iter().find_map(|e| match e {
            Entry::Application(a) => Some(a),
            _ => None,
        })
    }

    pub fn media_entries(&self) -> impl Iterator<Item = &MediaEntry> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Media(m) => Some(m),
            _ => None,
        })
    }

    pub fn entry_by_mid(&self, mid: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.mid() == mid)
    }

    /// Validates the invariants spec §3/§4.10 require of a description
    /// received from the remote side.
    pub fn validate_as_remote(&self) -> Result<()> {
        if self.ice_ufrag.is_empty() || self.ice_pwd.is_empty() {
            return Err(Error::protocol("remote description missing ice-ufrag/ice-pwd"));
        }
        if self.fingerprint.is_empty() {
            return Err(Error::protocol("remote description missing fingerprint"));
        }
        if self.entries.is_empty() {
            return Err(Error::protocol("remote description has no m-lines"));
        }
        let has_active_mline = self.entries.iter().any(|e| match e {
            Entry::Application(_) => true,
            Entry::Media(m) => m.direction.is_active(),
        });
        if !has_active_mline {
            return Err(Error::protocol("remote description has no active m-lines"));
        }
        if self.typ == DescriptionType::Answer && self.role == SetupRole::ActPass {
            return Err(Error::protocol("answer must not use setup:actpass"));
        }
        let mut seen_mids = std::collections::HashSet::new();
        for e in &self.entries {
            if !seen_mids.insert(e.mid().to_string()) {
                return Err(Error::protocol(format!("duplicate mid {}", e.mid())));
            }
        }
        let app_count = self.entries.iter().filter(|e| matches!(e, Entry::Application(_))).count();
        if app_count > 1 {
            return Err(Error::protocol("more than one application entry"));
        }
        Ok(())
    }

    /// True if `other`'s ice-ufrag+pwd match ours -- a self-loop per §4.10.
    pub fn is_self_loop(&self, other: &Description) -> bool {
        self.ice_ufrag == other.ice_ufrag && self.ice_pwd == other.ice_pwd
    }

    pub fn to_sdp(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "v=0");
        let _ = writeln!(s, "o=- {} 2 IN IP4 0.0.0.0", self.session_id);
        let _ = writeln!(s, "s=-");
        let _ = writeln!(s, "t=0 0");

        let bundle_mids: Vec<&str> = self.entries.iter().map(|e| e.mid()).collect();
        if !bundle_mids.is_empty() {
            let _ = writeln!(s, "a=group:BUNDLE {}", bundle_mids.join(" "));
        }
        let _ = writeln!(s, "a=ice-ufrag:{}", self.ice_ufrag);
        let _ = writeln!(s, "a=ice-pwd:{}", self.ice_pwd);
        if !self.ended {
            let _ = writeln!(s, "a=ice-options:trickle");
        }
        let _ = writeln!(s, "a=fingerprint:sha-256 {}", self.fingerprint);
        let _ = writeln!(s, "a=setup:{}", self.role.as_str());

        for entry in &self.entries {
            match entry {
                Entry::Application(app) => {
                    let _ = writeln!(s, "m=application 9 UDP/DTLS/SCTP webrtc-datachannel");
                    let _ = writeln!(s, "c=IN IP4 0.0.0.0");
                    let _ = writeln!(s, "a=mid:{}", app.mid);
                    let _ = writeln!(s, "a=sctp-port:{}", app.sctp_port);
                    let _ = writeln!(s, "a=max-message-size:{}", app.max_message_size);
                }
                Entry::Media(m) => {
                    let pts: Vec<String> = m.rtpmap.keys().map(|pt| pt.to_string()).collect();
                    let _ = writeln!(
                        s,
                        "m={} 9 UDP/TLS/RTP/SAVPF {}",
                        m.kind,
                        pts.join(" ")
                    );
                    let _ = writeln!(s, "c=IN IP4 0.0.0.0");
                    let _ = writeln!(s, "a=mid:{}", m.mid);
                    let _ = writeln!(s, "a={}", m.direction.as_str());
                    for codec in m.rtpmap.values() {
                        if let Some(ch) = codec.channels {
                            let _ = writeln!(
                                s,
                                "a=rtpmap:{} {}/{}/{}",
                                codec.payload_type, codec.name, codec.clock_rate, ch
                            );
                        } else {
                            let _ = writeln!(
                                s,
                                "a=rtpmap:{} {}/{}",
                                codec.payload_type, codec.name, codec.clock_rate
                            );
                        }
                        if let Some(fmtp) = &codec.fmtp {
                            let _ = writeln!(s, "a=fmtp:{} {}", codec.payload_type, fmtp);
                        }
                        for fb in &codec.rtcp_fbs {
                            let _ = writeln!(s, "a=rtcp-fb:{} {}", codec.payload_type, fb);
                        }
                    }
                    for ssrc in &m.ssrcs {
                        let _ = writeln!(s, "a=ssrc:{ssrc}");
                    }
                    if let Some(bitrate) = m.bitrate {
                        let _ = writeln!(s, "b=AS:{bitrate}");
                    }
                }
            }
        }

        for candidate in &self.candidates {
            let _ = writeln!(s, "a={}", candidate.to_sdp_line());
        }
        if self.ended {
            let _ = writeln!(s, "a=end-of-candidates");
        }

        s
    }

    pub fn from_sdp(typ: DescriptionType, text: &str) -> Result<Self> {
        let mut desc = Description::new(typ, SetupRole::ActPass);
        let mut current_media: Option<MediaEntry> = None;
        let mut current_app: Option<ApplicationEntry> = None;
        let mut in_media_section = false;

        let flush = |desc: &mut Description,
                     current_media: &mut Option<MediaEntry>,
                     current_app: &mut Option<ApplicationEntry>| {
            if let Some(m) = current_media.take() {
                desc.entries.push(Entry::Media(m));
            }
            if let Some(a) = current_app.take() {
                desc.entries.push(Entry::Application(a));
            }
        };

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (tag, rest) = line.split_at(2.min(line.len()));
            match tag {
                "m=" => {
                    flush(&mut desc, &mut current_media, &mut current_app);
                    in_media_section = true;
                    let mut parts = rest.split_whitespace();
                    let kind = parts.next().unwrap_or_default();
                    if kind == "application" {
                        current_app = Some(ApplicationEntry {
                            mid: String::new(),
                            sctp_port: 5000,
                            max_message_size: 65536,
                        });
                    } else {
                        let pts: Vec<u8> = parts
                            .clone()
                            .skip(3)
                            .filter_map(|p| p.parse().ok())
                            .collect();
                        let mut rtpmap = BTreeMap::new();
                        for pt in pts {
                            rtpmap.insert(
                                pt,
                                RtpCodec {
                                    payload_type: pt,
                                    name: String::new(),
                                    clock_rate: 0,
                                    channels: None,
                                    fmtp: None,
                                    rtcp_fbs: Vec::new(),
                                },
                            );
                        }
                        current_media = Some(MediaEntry {
                            mid: String::new(),
                            kind: kind.to_string(),
                            direction: Direction::SendRecv,
                            rtpmap,
                            ssrcs: Vec::new(),
                            bitrate: None,
                        });
                    }
                }
                _ if line.starts_with("a=ice-ufrag:") => {
                    desc.ice_ufrag = line["a=ice-ufrag:".len()..].to_string();
                }
                _ if line.starts_with("a=ice-pwd:") => {
                    desc.ice_pwd = line["a=ice-pwd:".len()..].to_string();
                }
                _ if line.starts_with("a=ice-options:") && line.contains("trickle") && !in_media_section =>
                {
                    desc.ended = false;
                }
                _ if line.starts_with("a=fingerprint:") => {
                    let v = &line["a=fingerprint:".len()..];
                    desc.fingerprint = v
                        .split_once(' ')
                        .map(|(_, hex)| hex.to_string())
                        .unwrap_or_else(|| v.to_string());
                }
                _ if line.starts_with("a=setup:") && !in_media_section => {
                    desc.role = SetupRole::parse(&line["a=setup:".len()..])?;
                }
                _ if line.starts_with("a=mid:") => {
                    let mid = line["a=mid:".len()..].to_string();
                    if let Some(m) = current_media.as_mut() {
                        m.mid = mid;
                    } else if let Some(a) = current_app.as_mut() {
                        a.mid = mid;
                    }
                }
                _ if line.starts_with("a=sctp-port:") => {
                    if let Some(a) = current_app.as_mut() {
                        a.sctp_port = line["a=sctp-port:".len()..]
                            .parse()
                            .map_err(|_| Error::protocol("bad sctp-port"))?;
                    }
                }
                _ if line.starts_with("a=max-message-size:") => {
                    if let Some(a) = current_app.as_mut() {
                        a.max_message_size = line["a=max-message-size:".len()..]
                            .parse()
                            .map_err(|_| Error::protocol("bad max-message-size"))?;
                    }
                }
                _ if line.starts_with("a=sendrecv")
                    || line.starts_with("a=sendonly")
                    || line.starts_with("a=recvonly")
                    || line.starts_with("a=inactive") =>
                {
                    if let Some(m) = current_media.as_mut() {
                        m.direction = Direction::parse(&line[2..])?;
                    }
                }
                _ if line.starts_with("a=rtpmap:") => {
                    let v = &line["a=rtpmap:".len()..];
                    if let Some((pt_str, rest)) = v.split_once(' ') {
                        if let Ok(pt) = pt_str.parse::<u8>() {
                            let mut it = rest.splitn(3, '/');
                            let name = it.next().unwrap_or_default().to_string();
                            let clock_rate: u32 = it.next().and_then(|c| c.parse().ok()).unwrap_or(0);
                            let channels = it.next().and_then(|c| c.parse().ok());
                            if let Some(m) = current_media.as_mut() {
                                let codec = m.rtpmap.entry(pt).or_insert(RtpCodec {
                                    payload_type: pt,
                                    name: String::new(),
                                    clock_rate: 0,
                                    channels: None,
                                    fmtp: None,
                                    rtcp_fbs: Vec::new(),
                                });
                                codec.name = name;
                                codec.clock_rate = clock_rate;
                                codec.channels = channels;
                            }
                        }
                    }
                }
                _ if line.starts_with("a=fmtp:") => {
                    let v = &line["a=fmtp:".len()..];
                    if let Some((pt_str, params)) = v.split_once(' ') {
                        if let (Ok(pt), Some(m)) = (pt_str.parse::<u8>(), current_media.as_mut()) {
                            if let Some(codec) = m.rtpmap.get_mut(&pt) {
                                codec.fmtp = Some(params.to_string());
                            }
                        }
                    }
                }
                _ if line.starts_with("a=rtcp-fb:") => {
                    let v = &line["a=rtcp-fb:".len()..];
                    if let Some((pt_str, fb)) = v.split_once(' ') {
                        if let (Ok(pt), Some(m)) = (pt_str.parse::<u8>(), current_media.as_mut()) {
                            if let Some(codec) = m.rtpmap.get_mut(&pt) {
                                codec.rtcp_fbs.push(fb.to_string());
                            }
                        }
                    }
                }
                _ if line.starts_with("a=ssrc:") => {
                    let v = &line["a=ssrc:".len()..];
                    let ssrc_str = v.split_whitespace().next().unwrap_or_default();
                    if let (Ok(ssrc), Some(m)) = (ssrc_str.parse::<u32>(), current_media.as_mut()) {
                        if !m.ssrcs.contains(&ssrc) {
                            m.ssrcs.push(ssrc);
                        }
                    }
                }
                _ if line.starts_with("b=AS:") => {
                    if let Some(m) = current_media.as_mut() {
                        m.bitrate = line["b=AS:".len()..].parse().ok();
                    }
                }
                _ if line.starts_with("a=candidate:") => {
                    desc.candidates.push(Candidate::parse_sdp_line(line)?);
                }
                _ if line.starts_with("a=end-of-candidates") => {
                    desc.ended = true;
                }
                _ => {}
            }
        }
        flush(&mut desc, &mut current_media, &mut current_app);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_description() -> Description {
        let mut desc = Description::new(DescriptionType::Offer, SetupRole::ActPass);
        desc.ice_ufrag = "ufrag1".to_string();
        desc.ice_pwd = "password1234567890123".to_string();
        desc.fingerprint = "AB:CD:EF".to_string();
        let mut rtpmap = BTreeMap::new();
        rtpmap.insert(
            96,
            RtpCodec {
                payload_type: 96,
                name: "VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                fmtp: None,
                rtcp_fbs: vec!["nack".to_string(), "goog-remb".to_string()],
            },
        );
        desc.entries.push(Entry::Media(MediaEntry {
            mid: "0".to_string(),
            kind: "video".to_string(),
            direction: Direction::SendRecv,
            rtpmap,
            ssrcs: vec![12345],
            bitrate: None,
        }));
        desc.entries.push(Entry::Application(ApplicationEntry {
            mid: "1".to_string(),
            sctp_port: 5000,
            max_message_size: 262144,
        }));
        desc.candidates.push(Candidate::new(
            "1",
            1,
            crate::candidate::TransportType::Udp,
            2130706431,
            std::net::IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            54321,
            crate::candidate::CandidateType::Host,
            None,
            None,
        ));
        desc
    }

    #[test]
    fn round_trips_fingerprint_ufrag_pwd_and_entries() {
        let desc = sample_description();
        let text = desc.to_sdp();
        let parsed = Description::from_sdp(DescriptionType::Offer, &text).unwrap();

        assert_eq!(parsed.fingerprint, desc.fingerprint);
        assert_eq!(parsed.ice_ufrag, desc.ice_ufrag);
        assert_eq!(parsed.ice_pwd, desc.ice_pwd);
        assert_eq!(parsed.entries.len(), desc.entries.len());
        for (a, b) in desc.entries.iter().zip(parsed.entries.iter()) {
            assert_eq!(a.mid(), b.mid());
        }
        match (&desc.entries[0], &parsed.entries[0]) {
            (Entry::Media(a), Entry::Media(b)) => {
                assert_eq!(a.direction, b.direction);
                assert_eq!(a.ssrcs, b.ssrcs);
                assert_eq!(a.rtpmap, b.rtpmap);
            }
            _ => panic!("expected media entries"),
        }
    }

    #[test]
    fn round_trips_a_non_default_direction() {
        let mut desc = sample_description();
        if let Entry::Media(m) = &mut desc.entries[0] {
            m.direction = Direction::RecvOnly;
        }
        let parsed = Description::from_sdp(DescriptionType::Offer, &desc.to_sdp()).unwrap();
        match &parsed.entries[0] {
            Entry::Media(m) => assert_eq!(m.direction, Direction::RecvOnly),
            _ => panic!("expected media entry"),
        }
    }

    #[test]
    fn exactly_one_application_entry_is_findable() {
        let desc = sample_description();
        assert!(desc.application_entry().is_some());
        assert_eq!(desc.media_entries().count(), 1);
    }

    #[test]
    fn validate_as_remote_rejects_missing_fields() {
        let mut desc = sample_description();
        desc.ice_pwd.clear();
        assert!(desc.validate_as_remote().is_err());
    }

    #[test]
    fn validate_as_remote_rejects_actpass_answer() {
        let mut desc = sample_description();
        desc.typ = DescriptionType::Answer;
        desc.role = SetupRole::ActPass;
        assert!(desc.validate_as_remote().is_err());
    }

    #[test]
    fn validate_as_remote_rejects_duplicate_mids() {
        let mut desc = sample_description();
        let dup = desc.entries[0].clone();
        desc.entries.push(dup);
        assert!(desc.validate_as_remote().is_err());
    }

    #[test]
    fn self_loop_detection_matches_on_ufrag_and_pwd() {
        let a = sample_description();
        let mut b = sample_description();
        assert!(a.is_self_loop(&b));
        b.ice_ufrag = "different".to_string();
        assert!(!a.is_self_loop(&b));
    }

    #[test]
    fn ended_true_omits_trickle_and_emits_end_of_candidates() {
        let mut desc = sample_description();
        desc.ended = true;
        let text = desc.to_sdp();
        assert!(text.contains("a=end-of-candidates"));
        assert!(!text.contains("a=ice-options:trickle"));
    }
}
