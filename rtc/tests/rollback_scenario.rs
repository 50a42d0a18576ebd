//! A local rollback from `HaveLocalOffer` restores the last description pair
//! that reached `Stable`, undoing an in-flight renegotiation (spec §4.10,
//! §8 scenario 5).

mod common;

use common::new_pc;
use rtc::description::DescriptionType;
use rtc::peer_connection::SignalingState;

#[test]
fn rollback_restores_prior_stable_local_description() {
    let offerer = new_pc();
    let answerer = new_pc();

    offerer.create_data_channel("initial", None).unwrap();
    let offer1 = offerer.set_local_description(DescriptionType::Offer).unwrap();
    answerer.set_remote_description(offer1.clone()).unwrap();
    let answer1 = answerer.set_local_description(DescriptionType::Unspec).unwrap();
    offerer.set_remote_description(answer1).unwrap();
    assert_eq!(offerer.signaling_state(), SignalingState::Stable);

    // Start a renegotiation the offerer then thinks better of: add a media
    // track, which changes the next offer's entries.
    offerer.add_track("video", Some("1".to_string())).unwrap();
    let renegotiated_offer = offerer.set_local_description(DescriptionType::Offer).unwrap();
    assert_eq!(offerer.signaling_state(), SignalingState::HaveLocalOffer);
    assert_ne!(renegotiated_offer.to_sdp(), offer1.to_sdp());

    let rolled_back = offerer.set_local_description(DescriptionType::Rollback).unwrap();
    assert_eq!(offerer.signaling_state(), SignalingState::Stable);
    assert_eq!(rolled_back.to_sdp(), offer1.to_sdp());

    offerer.close();
    answerer.close();
}
