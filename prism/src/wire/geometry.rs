//! Geometry element layout. Vertices and indices are the payload of geometry
//! update chunks and the unit the staging buffers are addressed in.

use crate::net::support::{NetError, NetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

pub type Index = u32;

pub const VERTEX_SIZE: usize = 32;
pub const INDEX_SIZE: usize = 4;

impl Vertex {
    pub const SIZE: usize = VERTEX_SIZE;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        for &value in self.pos.iter().chain(self.normal.iter()).chain(self.uv.iter()) {
            stream.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<Vertex> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let mut vertex = Vertex::default();
        for slot in vertex
            .pos
            .iter_mut()
            .chain(vertex.normal.iter_mut())
            .chain(vertex.uv.iter_mut())
        {
            *slot = buffer.read_f32::<LittleEndian>()?;
        }

        Ok(vertex)
    }
}

/// Byte size of one element of the given geometry kind.
#[inline]
pub fn element_size(kind: GeomKind) -> usize {
    match kind {
        GeomKind::Vertex => VERTEX_SIZE,
        GeomKind::Index => INDEX_SIZE,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum GeomKind {
    Vertex = 0,
    Index = 1,
}

impl GeomKind {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<GeomKind> {
        match byte {
            0 => Some(GeomKind::Vertex),
            1 => Some(GeomKind::Index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_roundtrip() {
        let vertex = Vertex {
            pos: [1.0, -2.5, 3.25],
            normal: [0.0, 1.0, 0.0],
            uv: [0.5, 0.75],
        };

        let mut bytes = Vec::new();
        vertex.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Vertex::SIZE);

        let mut slice = &bytes[..];
        let back = Vertex::decode(&mut slice).unwrap();
        assert_eq!(back, vertex);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_vertex_decode_short_buffer() {
        let mut slice = &[0u8; VERTEX_SIZE - 1][..];
        assert_eq!(Vertex::decode(&mut slice).unwrap_err(), NetError::Wait);
    }

    #[test]
    fn test_kind_bytes() {
        assert_eq!(GeomKind::from_byte(0), Some(GeomKind::Vertex));
        assert_eq!(GeomKind::from_byte(1), Some(GeomKind::Index));
        assert_eq!(GeomKind::from_byte(2), None);
        assert_eq!(element_size(GeomKind::Vertex), 32);
        assert_eq!(element_size(GeomKind::Index), 4);
    }
}
