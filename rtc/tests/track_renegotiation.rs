//! `on_track` fires exactly once per newly-negotiated remote media entry,
//! across a renegotiation that adds a second track to an already-`Stable`
//! connection (spec §8 "track renegotiation").

mod common;

use std::sync::{Arc, Mutex};

use common::{handshake, new_pc};
use rtc::description::DescriptionType;

#[test]
fn on_track_fires_once_per_mid_across_renegotiation() {
    let offerer = new_pc();
    let answerer = new_pc();

    offerer.add_track("video", Some("0".to_string())).unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    answerer.on_track(move |t| seen2.lock().unwrap().push(t.mid().to_string()));

    handshake(&offerer, &answerer);
    assert_eq!(*seen.lock().unwrap(), vec!["0".to_string()]);

    // Renegotiate: offerer adds a second track; the first mid must not fire
    // `on_track` again.
    offerer.add_track("audio", Some("1".to_string())).unwrap();
    let offer2 = offerer.set_local_description(DescriptionType::Offer).unwrap();
    answerer.set_remote_description(offer2).unwrap();
    let answer2 = answerer.set_local_description(DescriptionType::Unspec).unwrap();
    offerer.set_remote_description(answer2).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["0".to_string(), "1".to_string()]);

    offerer.close();
    answerer.close();
}
