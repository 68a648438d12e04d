//! Datagram channel layout: the per-packet header, the typed chunks that
//! make up a payload, and the ACK packet the client sends back.
//!
//! A datagram is `[UdpHeader][chunk...][padding]` where `UdpHeader.size` is
//! the exact byte count of all chunks. Bytes past `size` are undefined.

use crate::hashing::{fnv1a, StringId};
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::wire::geometry::{element_size, GeomKind};
use crate::PACKET_SIZE_BYTES;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Largest chunk payload a single datagram can carry.
pub const MAX_CHUNK_BYTES: usize = PACKET_SIZE_BYTES - UdpHeader::SIZE;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChunkType {
    GeomUpdate = 0x01,
    PointLightUpdate = 0x02,
    TransformUpdate = 0x03,
    Ack = 0x04,
}

impl ChunkType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ChunkType> {
        match byte {
            0x01 => Some(ChunkType::GeomUpdate),
            0x02 => Some(ChunkType::PointLightUpdate),
            0x03 => Some(ChunkType::TransformUpdate),
            0x04 => Some(ChunkType::Ack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UdpHeader {
    /// Monotonic generation stamped by the sender; receivers drop datagrams
    /// older than the newest one seen.
    pub packet_gen: u64,
    /// Sum of all chunk bytes in the payload.
    pub size: u32,
}

impl UdpHeader {
    pub const SIZE: usize = 12;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u64::<LittleEndian>(self.packet_gen)?;
        stream.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<UdpHeader> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        Ok(UdpHeader {
            packet_gen: buffer.read_u64::<LittleEndian>()?,
            size: buffer.read_u32::<LittleEndian>()?,
        })
    }
}

/// Header of a `GEOM_UPDATE` chunk. `length * element-size` payload bytes
/// follow immediately after it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GeomUpdateHeader {
    pub model_id: StringId,
    pub kind: GeomKind,
    /// First vertex/index to modify.
    pub start: u32,
    /// Amount of vertices/indices to modify.
    pub len: u32,
}

impl GeomUpdateHeader {
    pub const SIZE: usize = 13;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.model_id)?;
        stream.write_u8(self.kind as u8)?;
        stream.write_u32::<LittleEndian>(self.start)?;
        stream.write_u32::<LittleEndian>(self.len)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<GeomUpdateHeader> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let model_id = buffer.read_u32::<LittleEndian>()?;
        let kind = GeomKind::from_byte(buffer.read_u8()?)
            .ok_or(NetError::Fatal(ErrorType::UnknownChunk))?;

        Ok(GeomUpdateHeader {
            model_id,
            kind,
            start: buffer.read_u32::<LittleEndian>()?,
            len: buffer.read_u32::<LittleEndian>()?,
        })
    }

    /// Byte length of the payload that follows this header.
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.len as usize * element_size(self.kind)
    }

    /// Deterministic key of the targeted range. Identical edits collapse to
    /// the same serial, both in the server's persistent queue and in the
    /// client's ACKs.
    pub fn serial_id(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.encode(&mut &mut bytes[..]).expect("sized buffer");
        fnv1a(&bytes)
    }
}

/// Header-only chunk updating a light's colour and intensity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLightUpdateHeader {
    pub light_id: StringId,
    pub color: [f32; 3],
    pub intensity: f32,
}

impl PointLightUpdateHeader {
    pub const SIZE: usize = 20;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.light_id)?;
        for &channel in &self.color {
            stream.write_f32::<LittleEndian>(channel)?;
        }
        stream.write_f32::<LittleEndian>(self.intensity)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<PointLightUpdateHeader> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let light_id = buffer.read_u32::<LittleEndian>()?;
        let mut color = [0.0f32; 3];
        for channel in color.iter_mut() {
            *channel = buffer.read_f32::<LittleEndian>()?;
        }

        Ok(PointLightUpdateHeader {
            light_id,
            color,
            intensity: buffer.read_f32::<LittleEndian>()?,
        })
    }
}

/// Header-only chunk carrying a node's finished column-major matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdateHeader {
    pub node_id: StringId,
    pub matrix: [f32; 16],
}

impl TransformUpdateHeader {
    pub const SIZE: usize = 68;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.node_id)?;
        for &value in &self.matrix {
            stream.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<TransformUpdateHeader> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let node_id = buffer.read_u32::<LittleEndian>()?;
        let mut matrix = [0.0f32; 16];
        for value in matrix.iter_mut() {
            *value = buffer.read_f32::<LittleEndian>()?;
        }

        Ok(TransformUpdateHeader { node_id, matrix })
    }
}

/// One decoded chunk, borrowing its payload from the datagram buffer.
#[derive(Debug, PartialEq)]
pub enum Chunk<'a> {
    Geom {
        header: GeomUpdateHeader,
        payload: &'a [u8],
    },
    PointLight(PointLightUpdateHeader),
    Transform(TransformUpdateHeader),
}

/// Reads the next update chunk, advancing `buffer` past it.
pub fn read_chunk<'a>(buffer: &mut &'a [u8]) -> NetResult<Chunk<'a>> {
    if buffer.is_empty() {
        return Err(NetError::Wait);
    }

    let type_byte = buffer.read_u8()?;
    match ChunkType::from_byte(type_byte) {
        Some(ChunkType::GeomUpdate) => {
            let header = GeomUpdateHeader::decode(buffer)?;
            let payload_bytes = header.payload_bytes();
            if buffer.len() < payload_bytes {
                return Err(NetError::Wait);
            }

            let (payload, rest) = buffer.split_at(payload_bytes);
            *buffer = rest;

            Ok(Chunk::Geom { header, payload })
        }
        Some(ChunkType::PointLightUpdate) => {
            Ok(Chunk::PointLight(PointLightUpdateHeader::decode(buffer)?))
        }
        Some(ChunkType::TransformUpdate) => {
            Ok(Chunk::Transform(TransformUpdateHeader::decode(buffer)?))
        }
        _ => Err(NetError::Fatal(ErrorType::UnknownChunk)),
    }
}

/// Checks that walking `payload` consumes it exactly, chunk by chunk. Any
/// shortfall is reported as a chunk overrun so the whole datagram is dropped.
pub fn validate_chunks(payload: &[u8]) -> NetResult<()> {
    let mut cursor = payload;
    while !cursor.is_empty() {
        read_chunk(&mut cursor).map_err(|err| match err {
            NetError::Wait => NetError::Fatal(ErrorType::ChunkOverrun),
            other => other,
        })?;
    }
    Ok(())
}

/// ACK packet, client to server: `[ACK][n][serial ids]`. One packet fits in
/// one datagram; pending ids beyond `MAX_ACKS` go into further packets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AckPacket {
    pub acks: Vec<u32>,
}

impl AckPacket {
    pub const HEADER_SIZE: usize = 3;
    /// Most serial ids one datagram can carry.
    pub const MAX_ACKS: usize = (PACKET_SIZE_BYTES - Self::HEADER_SIZE) / 4;

    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.acks.len() * 4
    }

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        debug_assert!(self.acks.len() <= Self::MAX_ACKS);

        stream.write_u8(ChunkType::Ack as u8)?;
        stream.write_u16::<LittleEndian>(self.acks.len() as u16)?;
        for &ack in &self.acks {
            stream.write_u32::<LittleEndian>(ack)?;
        }
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<AckPacket> {
        if buffer.len() < Self::HEADER_SIZE {
            return Err(NetError::Wait);
        }

        if buffer.read_u8()? != ChunkType::Ack as u8 {
            return Err(NetError::Fatal(ErrorType::UnknownChunk));
        }

        let count = buffer.read_u16::<LittleEndian>()? as usize;
        if count > Self::MAX_ACKS {
            return Err(NetError::Fatal(ErrorType::SizeOverflow));
        }
        if buffer.len() < count * 4 {
            return Err(NetError::Truncated);
        }

        let mut acks = Vec::with_capacity(count);
        for _ in 0..count {
            acks.push(buffer.read_u32::<LittleEndian>()?);
        }

        Ok(AckPacket { acks })
    }
}
