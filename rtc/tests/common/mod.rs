//! Shared signaling glue for the integration tests below: a minimal
//! in-process "signaling server" that just calls the other side's methods
//! directly, since the scenarios here only care about the `rtc` side of the
//! exchange.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtc::candidate::Candidate;
use rtc::configuration::Configuration;
use rtc::description::DescriptionType;
use rtc::peer_connection::{PeerConnection, PeerConnectionState};

pub const DEADLINE: Duration = Duration::from_secs(10);

pub fn new_pc() -> Arc<PeerConnection> {
    PeerConnection::new(Configuration::default()).unwrap()
}

/// Runs a full offer/answer exchange between `offerer` and `answerer`,
/// collecting trickled candidates on each side and exchanging them once both
/// ICE transports exist, then blocks until both sides report `Connected`.
pub fn handshake(offerer: &Arc<PeerConnection>, answerer: &Arc<PeerConnection>) {
    let offerer_candidates: Arc<Mutex<Vec<Candidate>>> = Arc::new(Mutex::new(Vec::new()));
    let answerer_candidates: Arc<Mutex<Vec<Candidate>>> = Arc::new(Mutex::new(Vec::new()));

    let oc = offerer_candidates.clone();
    offerer.on_local_candidate(move |c| oc.lock().unwrap().push(c));
    let ac = answerer_candidates.clone();
    answerer.on_local_candidate(move |c| ac.lock().unwrap().push(c));

    let offer = offerer.set_local_description(DescriptionType::Offer).unwrap();
    answerer.set_remote_description(offer).unwrap();
    let answer = answerer.set_local_description(DescriptionType::Unspec).unwrap();
    offerer.set_remote_description(answer).unwrap();

    for c in offerer_candidates.lock().unwrap().drain(..) {
        answerer.add_remote_candidate(c).unwrap();
    }
    for c in answerer_candidates.lock().unwrap().drain(..) {
        offerer.add_remote_candidate(c).unwrap();
    }

    wait_until(DEADLINE, || {
        offerer.state() == PeerConnectionState::Connected
            && answerer.state() == PeerConnectionState::Connected
    });
    assert_eq!(offerer.state(), PeerConnectionState::Connected);
    assert_eq!(answerer.state(), PeerConnectionState::Connected);
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
