//! Tunnel Protocol Definitions
//!
//! This crate defines the wire frame format of the tunnel data plane, the
//! streaming reassembler that turns arbitrarily-chunked transport messages
//! back into frame-level events, and the JSON control messages exchanged on
//! manage channels.

pub mod control;
pub mod frame;
pub mod reassembly;

pub use control::{ControlMessage, Mode, OriginateData, Role, COMMAND_ORIGINATE};
pub use frame::{
    encode_data_chunk, Frame, FrameOption, SessionStatus, TargetNetwork, DATA_CHUNK_SIZE,
    FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE,
};
pub use reassembly::{Reassembler, TunnelEvent};

use thiserror::Error;

/// Protocol errors
///
/// Every variant except `Control` indicates a structurally invalid byte
/// stream and is fatal to the tunnel that produced it.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid session status: {0:#04x}")]
    InvalidStatus(u8),

    #[error("invalid frame option: {0:#04x}")]
    InvalidOption(u8),

    #[error("invalid target network: {0:#04x}")]
    InvalidNetwork(u8),

    #[error("frame length {0} shorter than frame header")]
    FrameTooShort(usize),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("keep frame declares inline payload of {0} bytes")]
    KeepWithPayload(usize),

    #[error("new-session frame is missing its target")]
    MissingTarget,

    #[error("destination is not valid UTF-8")]
    InvalidDestination(#[from] std::str::Utf8Error),

    #[error("control message codec: {0}")]
    Control(#[from] serde_json::Error),
}
