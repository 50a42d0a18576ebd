//! Partial-reliability policy attached to a [`crate::message::Message`] or a
//! [`crate::data_channel::DataChannel`] (spec §3 "Reliability").
//!
//! Invariant: at most one of `max_packet_lifetime`/`max_retransmits` is set
//! -- a channel is either fully reliable, or PR-SCTP TTL-limited, or
//! PR-SCTP retransmit-limited, never both at once (spec §8 "Reliability
//! mutual exclusion").

use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reliability {
    /// If true, out-of-order delivery is allowed (SCTP UNORDERED).
    pub unordered: bool,

    /// Time window during which (re)transmissions may occur.
    pub max_packet_lifetime: Option<Duration>,

    /// Maximum number of retransmissions attempted.
    pub max_retransmits: Option<u32>,
}

impl Reliability {
    pub fn reliable() -> Self {
        Reliability::default()
    }

    pub fn unordered() -> Self {
        Reliability {
            unordered: true,
            ..Default::default()
        }
    }

    pub fn with_max_packet_lifetime(unordered: bool, lifetime: Duration) -> Self {
        Reliability {
            unordered,
            max_packet_lifetime: Some(lifetime),
            max_retransmits: None,
        }
    }

    pub fn with_max_retransmits(unordered: bool, retransmits: u32) -> Self {
        Reliability {
            unordered,
            max_packet_lifetime: None,
            max_retransmits: Some(retransmits),
        }
    }

    /// Spec §8: `not (max_packet_lifetime.some and max_retransmits.some)`.
    pub fn is_valid(&self) -> bool {
        !(self.max_packet_lifetime.is_some() && self.max_retransmits.is_some())
    }

    pub fn is_reliable(&self) -> bool {
        self.max_packet_lifetime.is_none() && self.max_retransmits.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_reliable_and_valid() {
        let r = Reliability::default();
        assert!(r.is_reliable());
        assert!(r.is_valid());
    }

    #[test]
    fn setting_both_lifetime_and_retransmits_is_invalid() {
        let mut r = Reliability::with_max_retransmits(true, 2);
        r.max_packet_lifetime = Some(Duration::from_millis(222));
        assert!(!r.is_valid());
    }

    #[test]
    fn either_alone_is_valid_and_unreliable() {
        let lifetime = Reliability::with_max_packet_lifetime(true, Duration::from_millis(222));
        assert!(lifetime.is_valid());
        assert!(!lifetime.is_reliable());

        let rexmit = Reliability::with_max_retransmits(true, 2);
        assert!(rexmit.is_valid());
        assert!(!rexmit.is_reliable());
    }
}
