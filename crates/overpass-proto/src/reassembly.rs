//! Streaming reassembly of tunnel frames
//!
//! One transport message may carry zero, one, or many logical units, and one
//! unit may span many messages. The reassembler owns the carry-over between
//! calls and drains a single buffer across phase transitions within one
//! `feed`, so callers simply hand it every message in arrival order.

use crate::frame::{Frame, FrameOption, SessionStatus, TargetNetwork};
use crate::{ProtoError, FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE};
use bytes::{Buf, Bytes, BytesMut};

/// A fully-reassembled frame-level event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A peer wants a session opened toward `destination`
    NewSession {
        session_id: u16,
        network: TargetNetwork,
        destination: String,
    },
    /// One complete continuation block of session data
    Data { session_id: u16, payload: Bytes },
    /// A session was ended, cleanly or with an error
    End {
        session_id: u16,
        option: FrameOption,
    },
    /// Transport-level keep-alive, no state change
    KeepAlive,
}

enum Phase {
    /// Waiting for a complete frame header (and inline payload, if any)
    FrameHeader,
    /// Waiting for the rest of a `Keep` continuation block
    ContinuationData { session_id: u16, pending: usize },
}

/// Stateful parser turning arbitrarily-chunked bytes into [`TunnelEvent`]s
///
/// Single-threaded per tunnel; all errors are fatal to the tunnel and the
/// reassembler must not be fed again after reporting one.
pub struct Reassembler {
    phase: Phase,
    /// Unconsumed bytes carried between calls; never contains bytes already
    /// delivered in an event
    buffer: BytesMut,
    /// Partial continuation block being collected
    accumulator: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            phase: Phase::FrameHeader,
            buffer: BytesMut::new(),
            accumulator: BytesMut::new(),
        }
    }

    /// Consume one transport message and return every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TunnelEvent>, ProtoError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            match self.phase {
                Phase::ContinuationData {
                    session_id,
                    pending,
                } => {
                    if self.buffer.len() < pending {
                        let taken = self.buffer.len();
                        self.accumulator.extend_from_slice(&self.buffer.split());
                        self.phase = Phase::ContinuationData {
                            session_id,
                            pending: pending - taken,
                        };
                        return Ok(events);
                    }

                    let tail = self.buffer.split_to(pending);
                    self.accumulator.extend_from_slice(&tail);
                    events.push(TunnelEvent::Data {
                        session_id,
                        payload: self.accumulator.split().freeze(),
                    });
                    self.phase = Phase::FrameHeader;
                }
                Phase::FrameHeader => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(events);
                    }
                    let frame_len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                    if frame_len < FRAME_HEADER_SIZE {
                        return Err(ProtoError::FrameTooShort(frame_len));
                    }
                    if self.buffer.len() < LENGTH_PREFIX_SIZE + frame_len {
                        return Ok(events);
                    }

                    // A Keep frame only makes sense together with the length
                    // of the block it announces; hold off until both arrived.
                    let status = SessionStatus::try_from(self.buffer[4])?;
                    if status == SessionStatus::Keep
                        && self.buffer.len() < LENGTH_PREFIX_SIZE + frame_len + LENGTH_PREFIX_SIZE
                    {
                        return Ok(events);
                    }

                    let Some(frame) = Frame::decode(&mut self.buffer)? else {
                        return Ok(events);
                    };

                    match frame.status {
                        SessionStatus::New => {
                            let (network, destination) = frame.target()?;
                            events.push(TunnelEvent::NewSession {
                                session_id: frame.session_id,
                                network,
                                destination: destination.to_owned(),
                            });
                        }
                        SessionStatus::End => events.push(TunnelEvent::End {
                            session_id: frame.session_id,
                            option: frame.option,
                        }),
                        SessionStatus::KeepAlive => events.push(TunnelEvent::KeepAlive),
                        SessionStatus::Keep => {
                            let pending =
                                u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                            self.buffer.advance(LENGTH_PREFIX_SIZE);
                            self.phase = Phase::ContinuationData {
                                session_id: frame.session_id,
                                pending,
                            };
                        }
                    }
                }
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
