//! Error taxonomy for the `rtc` crate (see spec §7).
//!
//! Kinds are coarse on purpose: callers branch on the kind, not the message.
//! `Invalid` is a caller precondition violation, the rest are runtime faults
//! discovered while driving the transports or the signaling state machine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Bad argument or state precondition violated by the caller.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A lower transport reported a failure. Recoverable if the owning
    /// transport is below `Connected`, fatal otherwise.
    #[error("transport: {0}")]
    Transport(String),

    /// The peer violated SDP/DCEP/RTP framing.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Operation attempted on an object that has already been closed.
    #[error("closed")]
    Closed,

    /// Message exceeds the negotiated or current MTU.
    #[error("too large: {0} > {1}")]
    TooLarge(usize, usize),

    /// Out of streams, out of memory on SCTP, and similar exhaustion faults.
    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error(transparent)]
    Shared(#[from] shared::error::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    /// Whether this error, observed on a transport below `Connected`, is
    /// recoverable (worth retrying) rather than fatal to the connection.
    pub fn is_recoverable_pre_connect(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
