//! Frame encoding/decoding for the tunnel data plane
//!
//! Wire layout, big-endian:
//!
//! ```text
//! +----------------+----------------+--------+--------+
//! |  frame length  |   session id   | status | option |
//! +----------------+----------------+--------+--------+
//! |                     payload                       |
//! +---------------------------------------------------+
//! ```
//!
//! The frame length covers everything after itself. `New` frames carry a
//! 1-byte network tag plus the UTF-8 destination as payload. `End` and
//! `KeepAlive` frames are header-only. `Keep` frames are header-only too:
//! the data they announce follows the frame as a separate 2-byte
//! length-prefixed block, which may straddle any number of transport
//! messages (see [`crate::reassembly`]).

use crate::ProtoError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header after the length prefix: session id + status + option
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the length prefix in front of frames and continuation blocks
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Fixed block size for destination-to-tunnel data chunking
pub const DATA_CHUNK_SIZE: usize = 4096;

/// Session lifecycle status carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    New = 0x01,
    Keep = 0x02,
    End = 0x03,
    KeepAlive = 0x04,
}

impl TryFrom<u8> for SessionStatus {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(SessionStatus::New),
            0x02 => Ok(SessionStatus::Keep),
            0x03 => Ok(SessionStatus::End),
            0x04 => Ok(SessionStatus::KeepAlive),
            _ => Err(ProtoError::InvalidStatus(value)),
        }
    }
}

/// Frame option byte, distinguishing data frames from error signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameOption {
    Data = 0x01,
    Error = 0x02,
}

impl TryFrom<u8> for FrameOption {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            0x01 => Ok(FrameOption::Data),
            0x02 => Ok(FrameOption::Error),
            _ => Err(ProtoError::InvalidOption(value)),
        }
    }
}

/// Network tag carried by `New` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetNetwork {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for TargetNetwork {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            0x01 => Ok(TargetNetwork::Tcp),
            0x02 => Ok(TargetNetwork::Udp),
            _ => Err(ProtoError::InvalidNetwork(value)),
        }
    }
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session_id: u16,
    pub status: SessionStatus,
    pub option: FrameOption,
    pub payload: Bytes,
}

impl Frame {
    /// Create a `New` frame opening a session toward `destination`
    pub fn new_session(session_id: u16, network: TargetNetwork, destination: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + destination.len());
        payload.put_u8(network as u8);
        payload.extend_from_slice(destination.as_bytes());
        Self {
            session_id,
            status: SessionStatus::New,
            option: FrameOption::Data,
            payload: payload.freeze(),
        }
    }

    /// Create a clean `End` frame for a session
    pub fn end(session_id: u16) -> Self {
        Self {
            session_id,
            status: SessionStatus::End,
            option: FrameOption::Data,
            payload: Bytes::new(),
        }
    }

    /// Create an `End` frame signalling session failure
    pub fn end_error(session_id: u16) -> Self {
        Self {
            session_id,
            status: SessionStatus::End,
            option: FrameOption::Error,
            payload: Bytes::new(),
        }
    }

    /// Create a transport keep-alive frame
    pub fn keep_alive() -> Self {
        Self {
            session_id: 0,
            status: SessionStatus::KeepAlive,
            option: FrameOption::Data,
            payload: Bytes::new(),
        }
    }

    /// Parse the network tag and destination out of a `New` frame payload
    pub fn target(&self) -> Result<(TargetNetwork, &str), ProtoError> {
        if self.payload.is_empty() {
            return Err(ProtoError::MissingTarget);
        }
        let network = TargetNetwork::try_from(self.payload[0])?;
        let destination = std::str::from_utf8(&self.payload[1..])?;
        Ok((network, destination))
    }

    /// Encode the frame, length prefix included
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let frame_len = FRAME_HEADER_SIZE + self.payload.len();
        if frame_len > u16::MAX as usize {
            return Err(ProtoError::FrameTooLarge(frame_len));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame_len);
        buf.put_u16(frame_len as u16);
        buf.put_u16(self.session_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(self.option as u8);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`, consuming it
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// truncated input is never an error. The continuation block following a
    /// `Keep` frame is not part of the frame and is left in the buffer.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtoError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if frame_len < FRAME_HEADER_SIZE {
            return Err(ProtoError::FrameTooShort(frame_len));
        }
        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let session_id = buf.get_u16();
        let status = SessionStatus::try_from(buf.get_u8())?;
        let option = FrameOption::try_from(buf.get_u8())?;

        let payload_len = frame_len - FRAME_HEADER_SIZE;
        if status == SessionStatus::Keep && payload_len != 0 {
            return Err(ProtoError::KeepWithPayload(payload_len));
        }
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            session_id,
            status,
            option,
            payload,
        }))
    }
}

/// Encode one chunk of session data as a `Keep` unit
///
/// Produces the header frame followed by the 2-byte length-prefixed data
/// block. Callers split destination reads into blocks of at most
/// [`DATA_CHUNK_SIZE`] bytes before calling this.
pub fn encode_data_chunk(session_id: u16, chunk: &[u8]) -> Bytes {
    debug_assert!(chunk.len() <= DATA_CHUNK_SIZE);

    let mut buf =
        BytesMut::with_capacity(LENGTH_PREFIX_SIZE + FRAME_HEADER_SIZE + LENGTH_PREFIX_SIZE + chunk.len());
    buf.put_u16(FRAME_HEADER_SIZE as u16);
    buf.put_u16(session_id);
    buf.put_u8(SessionStatus::Keep as u8);
    buf.put_u8(FrameOption::Data as u8);
    buf.put_u16(chunk.len() as u16);
    buf.extend_from_slice(chunk);
    buf.freeze()
}
