//! End-to-end data-channel connectivity between two in-process
//! `PeerConnection`s: offer/answer, ICE over loopback, DTLS, SCTP, DCEP
//! OPEN/ACK, then a message round trip in both directions.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{handshake, new_pc, wait_until};
use rtc::message::MessageKind;

#[test]
fn data_channel_opens_and_exchanges_messages() {
    let offerer = new_pc();
    let answerer = new_pc();

    let channel = offerer.create_data_channel("chat", None).unwrap();
    let channel_open = Arc::new(AtomicBool::new(false));
    let co = channel_open.clone();
    channel.on_open(move || co.store(true, Ordering::SeqCst));

    let received_by_answerer: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let ra = received_by_answerer.clone();
    answerer.on_data_channel(move |remote_channel| {
        let ra2 = ra.clone();
        remote_channel.on_message(move |msg| {
            if msg.kind == MessageKind::String {
                ra2.lock().unwrap().push(msg.as_str().unwrap().to_string());
            }
        });
        remote_channel.send_text("hello from answerer").unwrap();
    });

    handshake(&offerer, &answerer);

    wait_until(Duration::from_secs(10), || channel_open.load(Ordering::SeqCst));
    assert!(channel.is_open());

    channel.send_text("hello from offerer").unwrap();

    wait_until(Duration::from_secs(10), || {
        !received_by_answerer.lock().unwrap().is_empty()
    });
    assert_eq!(
        received_by_answerer.lock().unwrap().as_slice(),
        ["hello from offerer"]
    );

    offerer.close();
    answerer.close();
}
