use signal_bus::BusError;
use thiserror::Error;

use crate::media::MediaError;
use crate::types::{PeerId, SignalingState};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("unexpected signaling state {state} for {operation}")]
    WrongSignalingState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("no connection tracked for peer {0}")]
    UnknownPeer(PeerId),
    #[error("local media unavailable: {0}")]
    Media(#[from] MediaError),
    #[error("signal transport error: {0}")]
    Transport(#[from] BusError),
    #[error("connection closed")]
    Closed,
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> HandshakeError {
    HandshakeError::Setup(err.to_string())
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> HandshakeError {
    HandshakeError::Negotiation(err.to_string())
}
