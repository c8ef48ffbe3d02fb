//! Control-channel messages and connection vocabulary
//!
//! Manage channels carry JSON messages instructing a named agent to originate
//! a rendezvous session. Field names are part of the wire format, as are the
//! role/mode strings conveyed as query parameters when a tunnel connection is
//! established.

use crate::ProtoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Command asking an agent to originate a session
pub const COMMAND_ORIGINATE: u32 = 0x01;

/// A message sent over a manage channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "Command")]
    pub command: u32,
    #[serde(rename = "Data")]
    pub data: OriginateData,
}

/// Payload of [`COMMAND_ORIGINATE`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginateData {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "Mux")]
    pub mux: bool,
}

impl ControlMessage {
    /// Build an originate command for `code` targeting `addr` over TCP
    pub fn originate(code: &str, addr: &str, mux: bool) -> Self {
        Self {
            command: COMMAND_ORIGINATE,
            data: OriginateData {
                code: code.to_owned(),
                addr: addr.to_owned(),
                network: "tcp".to_owned(),
                mux,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Role a tunnel connection announces when it arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manage,
    Agent,
    Connector,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manage => "manage",
            Role::Agent => "Agent",
            Role::Connector => "Connector",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manage" => Ok(Role::Manage),
            "Agent" => Ok(Role::Agent),
            "Connector" => Ok(Role::Connector),
            other => Err(format!("unknown role: {other:?}")),
        }
    }
}

/// How a tunnel connection wants its bytes handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    DirectMux,
    Forward,
    ForwardMux,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::DirectMux => "directMux",
            Mode::Forward => "forward",
            Mode::ForwardMux => "forwardMux",
        }
    }

    /// Direct modes carry their destination and bypass the rendezvous broker
    pub fn is_direct(&self) -> bool {
        matches!(self, Mode::Direct | Mode::DirectMux)
    }

    /// Mux modes multiplex sessions over the connection
    pub fn is_mux(&self) -> bool {
        matches!(self, Mode::DirectMux | Mode::ForwardMux)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Mode::Direct),
            "directMux" => Ok(Mode::DirectMux),
            "forward" => Ok(Mode::Forward),
            "forwardMux" => Ok(Mode::ForwardMux),
            other => Err(format!("unknown mode: {other:?}")),
        }
    }
}
