use std::time::Duration;

/// Per-frame metadata a caller attaches to an outgoing [`crate::message::Message`]
/// so the [`crate::media::handlers::Packetizer`] knows the RTP clock-rate
/// timestamp and whether this is the frame's last fragment (spec §4.9
/// "Packetizer": "timestamp (supplied by caller in clock-rate units)...
/// marker bit ... last fragment of a frame").
#[derive(Debug, Default, Clone)]
pub struct FrameInfo {
    pub timestamp: u32,
    pub payload_type: u8,
    pub timestamp_seconds: Option<Duration>,
    pub marker: bool,
}

impl FrameInfo {
    pub fn new(timestamp: u32, payload_type: u8, timestamp_seconds: Option<Duration>) -> FrameInfo {
        Self {
            timestamp,
            payload_type,
            timestamp_seconds,
            marker: true,
        }
    }
}
