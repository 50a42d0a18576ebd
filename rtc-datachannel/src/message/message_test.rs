use super::*;

#[test]
fn round_trips_open() {
    let msg = Message::DataChannelOpen(DataChannelOpen {
        channel_type: ChannelType::PartialReliableRexmit,
        priority: 128,
        reliability_parameter: 3,
        label: b"chat".to_vec(),
        protocol: b"".to_vec(),
    });
    let bytes = msg.marshal().unwrap();
    let mut b = &bytes[..];
    let back = Message::unmarshal(&mut b).unwrap();
    assert_eq!(msg, back);
}

#[test]
fn round_trips_ack() {
    let msg = Message::DataChannelAck(DataChannelAck);
    let bytes = msg.marshal().unwrap();
    let mut b = &bytes[..];
    let back = Message::unmarshal(&mut b).unwrap();
    assert_eq!(msg, back);
}

#[test]
fn round_trips_close() {
    let msg = Message::DataChannelClose(DataChannelClose);
    let bytes = msg.marshal().unwrap();
    let mut b = &bytes[..];
    let back = Message::unmarshal(&mut b).unwrap();
    assert_eq!(msg, back);
}

#[test]
fn rejects_unknown_message_type() {
    let bytes = [0x7fu8];
    let mut b = &bytes[..];
    assert!(Message::unmarshal(&mut b).is_err());
}
