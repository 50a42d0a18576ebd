//! ICE candidate value type (spec §3 "Candidate").
//!
//! Parsing only recognizes the `a=candidate:` attribute grammar (RFC 8839
//! §5.1); DNS resolution of `raddr`/host names is left to the ICE transport
//! (C5), which is the only thing allowed to do I/O.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            other => Err(Error::protocol(format!("unknown candidate typ: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Udp,
    Tcp,
}

impl TransportType {
    fn as_str(self) -> &'static str {
        match self {
            TransportType::Udp => "udp",
            TransportType::Tcp => "tcp",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportType::Udp),
            "tcp" => Ok(TransportType::Tcp),
            other => Err(Error::protocol(format!("unknown candidate transport: {other}"))),
        }
    }
}

/// An ICE candidate, carrying both the original SDP attribute text and its
/// resolved fields. Immutable once constructed: a candidate is either
/// produced already-resolved by the ICE agent, or parsed+resolved on input.
#[derive(Debug, Clone)]
pub struct Candidate {
    foundation: String,
    component: u16,
    transport_type: TransportType,
    priority: u32,
    address: IpAddr,
    port: u16,
    typ: CandidateType,
    family: AddressFamily,
    related_address: Option<IpAddr>,
    related_port: Option<u16>,
}

impl Candidate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        foundation: impl Into<String>,
        component: u16,
        transport_type: TransportType,
        priority: u32,
        address: IpAddr,
        port: u16,
        typ: CandidateType,
        related_address: Option<IpAddr>,
        related_port: Option<u16>,
    ) -> Self {
        let family = match address {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        };
        Candidate {
            foundation: foundation.into(),
            component,
            transport_type,
            priority,
            address,
            port,
            typ,
            family,
            related_address,
            related_port,
        }
    }

    pub fn typ(&self) -> CandidateType {
        self.typ
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }

    /// Parses the value of an `a=candidate:` line (without the `a=` or
    /// `candidate:` prefix already stripped by the caller is also accepted).
    pub fn parse_sdp_line(line: &str) -> Result<Self> {
        let line = line
            .strip_prefix("a=candidate:")
            .or_else(|| line.strip_prefix("candidate:"))
            .unwrap_or(line);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::protocol("malformed candidate line"));
        }
        let foundation = fields[0].to_string();
        let component: u16 = fields[1]
            .parse()
            .map_err(|_| Error::protocol("bad candidate component"))?;
        let transport_type = TransportType::parse(fields[2])?;
        let priority: u32 = fields[3]
            .parse()
            .map_err(|_| Error::protocol("bad candidate priority"))?;
        let address: IpAddr = fields[4]
            .parse()
            .map_err(|_| Error::protocol("candidate address is not numeric (DNS resolution happens in the ICE transport)"))?;
        let port: u16 = fields[5]
            .parse()
            .map_err(|_| Error::protocol("bad candidate port"))?;
        if fields[6] != "typ" {
            return Err(Error::protocol("candidate line missing 'typ'"));
        }
        let typ = CandidateType::parse(fields[7])?;

        let mut related_address = None;
        let mut related_port = None;
        let mut i = 8;
        while i + 1 < fields.len() {
            match fields[i] {
                "raddr" => {
                    related_address = fields[i + 1].parse().ok();
                }
                "rport" => {
                    related_port = fields[i + 1].parse().ok();
                }
                _ => {}
            }
            i += 2;
        }

        Ok(Candidate::new(
            foundation,
            component,
            transport_type,
            priority,
            address,
            port,
            typ,
            related_address,
            related_port,
        ))
    }

    pub fn to_sdp_line(&self) -> String {
        let mut s = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport_type.as_str(),
            self.priority,
            self.address,
            self.port,
            self.typ.as_str(),
        );
        if let (Some(raddr), Some(rport)) = (self.related_address, self.related_port) {
            s.push_str(&format!(" raddr {raddr} rport {rport}"));
        }
        s
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sdp_line())
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.to_sdp_line() == other.to_sdp_line()
    }
}
impl Eq for Candidate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_host_candidate() {
        let line = "candidate:1 1 udp 2130706431 192.168.1.5 54321 typ host";
        let c = Candidate::parse_sdp_line(line).unwrap();
        assert_eq!(c.typ(), CandidateType::Host);
        assert_eq!(c.to_sdp_line(), line);
    }

    #[test]
    fn round_trips_relayed_candidate_with_related_address() {
        let line = "candidate:2 1 udp 16777215 203.0.113.1 3478 typ relay raddr 192.168.1.5 rport 54321";
        let c = Candidate::parse_sdp_line(line).unwrap();
        assert_eq!(c.typ(), CandidateType::Relayed);
        assert_eq!(c.to_sdp_line(), line);
    }

    #[test]
    fn rejects_non_numeric_address() {
        let line = "candidate:1 1 udp 2130706431 example.invalid 54321 typ host";
        assert!(Candidate::parse_sdp_line(line).is_err());
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(Candidate::parse_sdp_line("candidate:1 1 udp").is_err());
    }
}
