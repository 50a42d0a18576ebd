//! Connection-wide configuration passed to [`crate::peer_connection::PeerConnection::new`]
//! (spec ambient-stack addition: every knob a caller sets up front rather
//! than threading through individual constructors).

use std::time::Duration;

/// Whether ICE may use relayed (TURN) candidates, or must (spec §8
/// scenario 6 "TURN-only (relayed)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPolicy {
    #[default]
    All,
    Relay,
}

/// One ICE server entry; `credential`/`username` are only meaningful for a
/// TURN server.
#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub ice_servers: Vec<IceServer>,
    pub transport_policy: TransportPolicy,
    /// Mirrors [`crate::transport::ice::IceConfig::trickle_timeout`]; kept
    /// here too so a caller configures it in one place (spec §9 Open
    /// Question: "ICE trickle timeout 30s default, configurable").
    pub ice_trickle_timeout: Duration,
    /// NTP epoch the SR Reporter stamps into outgoing Sender Reports
    /// (spec §4.9/§9 Open Question, default is the RFC-correct 1900).
    pub sr_ntp_epoch: crate::media::handlers::NtpEpoch,
    /// `a=max-message-size` advertised on the Application m-line.
    pub max_message_size: u64,
    pub sctp_port: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            ice_servers: Vec::new(),
            transport_policy: TransportPolicy::All,
            ice_trickle_timeout: Duration::from_secs(30),
            sr_ntp_epoch: crate::media::handlers::NtpEpoch::Epoch1900,
            max_message_size: 256 * 1024,
            sctp_port: crate::transport::sctp::DEFAULT_SCTP_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_allows_all_candidate_types() {
        let config = Configuration::default();
        assert_eq!(config.transport_policy, TransportPolicy::All);
        assert_eq!(config.ice_trickle_timeout, Duration::from_secs(30));
    }
}
