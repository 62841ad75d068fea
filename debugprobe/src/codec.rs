/// JDWP packet framing
///
/// Frames are `length:u32 | id:u32 | flags:u8 | (command_set:u8 command:u8 | error_code:u16) | payload`,
/// all big-endian. The decoder is the reassembly point for TCP chunking: it
/// returns `None` until a whole frame is buffered and leaves any remainder in
/// place for the next call.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{Packet, PacketKind, VersionReply};
use crate::{ProbeError, Result};

pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// VirtualMachine command set and the commands used by the probe
pub const VIRTUAL_MACHINE: u8 = 1;
pub const VM_VERSION: u8 = 1;
pub const VM_DISPOSE: u8 = 6;
pub const VM_SUSPEND: u8 = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec
    }

    /// Decode every complete frame currently buffered.
    ///
    /// An empty result means the buffer holds only a partial frame (or
    /// nothing); the partial bytes stay in `src`.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.decode(src)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Encode a packet into a standalone frame
    pub fn encode_to_vec(&mut self, packet: Packet) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + packet.payload.len());
        self.encode(packet, &mut buf)?;
        Ok(buf.to_vec())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProbeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < HEADER_LEN {
            return Err(ProbeError::decode(
                format!("frame length {} shorter than header", length),
                src,
            ));
        }
        if length > MAX_FRAME_LEN {
            return Err(ProbeError::decode(
                format!("frame length {} exceeds limit", length),
                src,
            ));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        frame.advance(4);
        let id = frame.get_u32();
        let flags = frame.get_u8();
        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: frame.get_u16(),
            }
        } else {
            PacketKind::Command {
                command_set: frame.get_u8(),
                command: frame.get_u8(),
            }
        };

        Ok(Some(Packet {
            id,
            flags,
            kind,
            payload: frame.to_vec(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProbeError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let length = HEADER_LEN + packet.payload.len();
        if length > MAX_FRAME_LEN {
            return Err(ProbeError::decode(
                format!("outgoing frame length {} exceeds limit", length),
                &packet.payload,
            ));
        }

        dst.reserve(length);
        dst.put_u32(length as u32);
        dst.put_u32(packet.id);
        match packet.kind {
            PacketKind::Command { command_set, command } => {
                dst.put_u8(packet.flags & !FLAG_REPLY);
                dst.put_u8(command_set);
                dst.put_u8(command);
            }
            PacketKind::Reply { error_code } => {
                dst.put_u8(packet.flags | FLAG_REPLY);
                dst.put_u16(error_code);
            }
        }
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

/// Sequential big-endian cursor over a reply payload
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    raw: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, raw: buf }
    }

    fn ensure(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProbeError::decode(
                format!(
                    "truncated payload reading {}: need {} bytes, have {}",
                    what,
                    n,
                    self.buf.remaining()
                ),
                self.raw,
            ));
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "int")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "length")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.ensure(len, "string")?;
        let s = String::from_utf8(self.buf[..len].to_vec())
            .map_err(|e| ProbeError::decode(format!("invalid utf-8 string: {}", e), self.raw))?;
        self.buf.advance(len);
        Ok(s)
    }
}

impl VersionReply {
    /// Parse a VirtualMachine.Version reply payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(VersionReply {
            description: r.read_string()?,
            jdwp_major: r.read_i32()?,
            jdwp_minor: r.read_i32()?,
            vm_version: r.read_string()?,
            vm_name: r.read_string()?,
        })
    }

    /// Serialize into the reply payload layout
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.description);
        buf.put_i32(self.jdwp_major);
        buf.put_i32(self.jdwp_minor);
        put_string(&mut buf, &self.vm_version);
        put_string(&mut buf, &self.vm_name);
        buf.to_vec()
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}
