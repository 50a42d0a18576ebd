#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod candidate;
pub mod certificate;
pub mod configuration;
pub mod constants;
pub mod data_channel;
pub mod description;
pub mod error;
pub mod frameinfo;
pub mod media;
pub mod message;
pub mod peer_connection;
pub mod queue;
pub mod reliability;
pub mod transport;

pub use configuration::Configuration;
pub use peer_connection::PeerConnection;
