/// Wire-level types shared by the debug protocol clients
///
/// This module defines the JDWP packet model, the decoded version reply
/// and the protocol variant selector.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Header of a framed JDWP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Request (or VM-originated event) addressed by command set and command
    Command { command_set: u8, command: u8 },
    /// Reply to an earlier command; `error_code == 0` means the payload is data
    Reply { error_code: u16 },
}

/// A single length-prefixed JDWP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub flags: u8,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a command packet
    pub fn command(id: u32, command_set: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: 0x00,
            kind: PacketKind::Command { command_set, command },
            payload,
        }
    }

    /// Build a reply packet
    pub fn reply(id: u32, error_code: u16, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: crate::codec::FLAG_REPLY,
            kind: PacketKind::Reply { error_code },
            payload,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, PacketKind::Reply { .. })
    }

    /// Error code carried by a reply, `None` for commands
    pub fn error_code(&self) -> Option<u16> {
        match self.kind {
            PacketKind::Reply { error_code } => Some(error_code),
            PacketKind::Command { .. } => None,
        }
    }
}

/// Payload of a VirtualMachine.Version reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReply {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

/// The wire protocol spoken by a debuggee's debug port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVariant {
    /// Length-prefixed binary frames after a literal handshake (JDWP)
    BinaryFramed,
    /// JSON-RPC objects over a raw socket (delve)
    JsonRpc,
    /// Line-oriented text commands (ruby-debug-ide)
    LineText,
}

impl ProtocolVariant {
    /// Select the protocol for a debuggee language
    pub fn for_language(language: &str) -> Option<Self> {
        match language.trim().to_ascii_lowercase().as_str() {
            "java" => Some(ProtocolVariant::BinaryFramed),
            "go" | "golang" => Some(ProtocolVariant::JsonRpc),
            "ruby" => Some(ProtocolVariant::LineText),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolVariant::BinaryFramed => "jdwp",
            ProtocolVariant::JsonRpc => "json-rpc",
            ProtocolVariant::LineText => "line-text",
        };
        write!(f, "{}", s)
    }
}
