//! Partial-reliability policies are carried end to end: each channel's
//! `Reliability` is visible on both the creating and the accepting side, and
//! mutually-exclusive settings are rejected at creation time (spec §8
//! "Reliability mutual exclusion").

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{handshake, new_pc, wait_until};
use rtc::peer_connection::DataChannelInit;
use rtc::reliability::Reliability;

#[test]
fn invalid_reliability_is_rejected_at_creation() {
    let pc = new_pc();
    let mut reliability = Reliability::with_max_retransmits(false, 3);
    reliability.max_packet_lifetime = Some(Duration::from_millis(500));
    let init = DataChannelInit {
        reliability,
        ..Default::default()
    };
    assert!(pc.create_data_channel("bad", Some(init)).is_err());
    pc.close();
}

#[test]
fn unordered_retransmit_limited_channel_delivers_and_reports_its_policy() {
    let offerer = new_pc();
    let answerer = new_pc();

    let reliability = Reliability::with_max_retransmits(true, 0);
    let init = DataChannelInit {
        reliability: reliability.clone(),
        ..Default::default()
    };
    let offerer_channel = offerer.create_data_channel("unreliable", Some(init)).unwrap();
    assert!(offerer_channel.reliability().is_valid());
    assert!(!offerer_channel.reliability().is_reliable());

    let seen_reliability = Arc::new(Mutex::new(None));
    let sr = seen_reliability.clone();
    answerer.on_data_channel(move |remote_channel| {
        *sr.lock().unwrap() = Some(remote_channel.reliability().clone());
    });

    handshake(&offerer, &answerer);
    wait_until(Duration::from_secs(10), || offerer_channel.is_open());

    offerer_channel.send_text("best effort").unwrap();
    wait_until(Duration::from_secs(10), || {
        seen_reliability.lock().unwrap().is_some()
    });
    assert_eq!(seen_reliability.lock().unwrap().as_ref(), Some(&reliability));

    offerer.close();
    answerer.close();
}
