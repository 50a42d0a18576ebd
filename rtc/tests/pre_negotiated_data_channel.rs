//! A pre-negotiated (`negotiated: true`, matching id) channel is `Open` on
//! both sides without any DCEP OPEN/ACK ever crossing the wire, once the
//! underlying SCTP association comes up.

mod common;

use std::time::Duration;

use common::{handshake, new_pc, wait_until};
use rtc::peer_connection::{DataChannelInit, PeerConnectionState};

#[test]
fn negotiated_channel_opens_without_dcep_and_exchanges_messages() {
    let offerer = new_pc();
    let answerer = new_pc();

    let init = DataChannelInit {
        negotiated: true,
        id: Some(7),
        ..Default::default()
    };
    let offerer_channel = offerer.create_data_channel("neg", Some(init.clone())).unwrap();
    let answerer_channel = answerer.create_data_channel("neg", Some(init)).unwrap();

    // Negotiated channels are considered open as soon as they're created,
    // well before any transport exists.
    assert!(offerer_channel.is_open());
    assert!(answerer_channel.is_open());

    handshake(&offerer, &answerer);
    wait_until(Duration::from_secs(10), || {
        offerer.state() == PeerConnectionState::Connected
    });

    offerer_channel.send_text("ping").unwrap();
    wait_until(Duration::from_secs(10), || {
        answerer_channel.recv().is_some()
    });
    let msg = answerer_channel.recv().unwrap();
    assert_eq!(msg.as_str().unwrap(), "ping");

    offerer.close();
    answerer.close();
}
