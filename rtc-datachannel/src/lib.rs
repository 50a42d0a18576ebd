#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! DCEP (draft-ietf-rtcweb-data-protocol) wire messages: marshal/unmarshal
//! for the OPEN/ACK/CLOSE control messages `rtc`'s own data channel state
//! machine (`rtc::data_channel`) sends and parses on the SCTP stream.

pub mod message;

pub use message::message_channel_open::ChannelType;
pub use message::Message;
