//! Reliable channel layout: the one-byte message types and the resource info
//! structs that follow resource-type messages. Bulk bytes (texture pixels,
//! shader code, model material/mesh tables) trail the info struct until its
//! declared size is consumed.

use crate::hashing::StringId;
use crate::net::support::{ErrorType, NetError, NetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MsgType {
    Helo = 0x01,
    HeloAck = 0x02,
    Ready = 0x03,
    Keepalive = 0x04,
    Disconnect = 0x05,
    StartRsrcExchange = 0x06,
    RsrcExchangeAck = 0x07,
    RsrcTexture = 0x08,
    RsrcMaterial = 0x0a,
    RsrcModel = 0x0b,
    RsrcPointLight = 0x0c,
    RsrcShader = 0x0d,
    EndRsrcExchange = 0x1f,
    StartStreaming = 0x20,
    EndStreaming = 0x21,
    ReqModel = 0x22,
}

impl MsgType {
    pub fn from_byte(byte: u8) -> Option<MsgType> {
        match byte {
            0x01 => Some(MsgType::Helo),
            0x02 => Some(MsgType::HeloAck),
            0x03 => Some(MsgType::Ready),
            0x04 => Some(MsgType::Keepalive),
            0x05 => Some(MsgType::Disconnect),
            0x06 => Some(MsgType::StartRsrcExchange),
            0x07 => Some(MsgType::RsrcExchangeAck),
            0x08 => Some(MsgType::RsrcTexture),
            0x0a => Some(MsgType::RsrcMaterial),
            0x0b => Some(MsgType::RsrcModel),
            0x0c => Some(MsgType::RsrcPointLight),
            0x0d => Some(MsgType::RsrcShader),
            0x1f => Some(MsgType::EndRsrcExchange),
            0x20 => Some(MsgType::StartStreaming),
            0x21 => Some(MsgType::EndStreaming),
            0x22 => Some(MsgType::ReqModel),
            _ => None,
        }
    }

    /// Fixed payload length following the type byte, for the message types
    /// that have one. Resource messages stream a variable trailer instead.
    pub fn fixed_payload_len(self) -> usize {
        match self {
            MsgType::ReqModel => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TextureFormat {
    Rgba = 0,
    Grey = 1,
}

impl TextureFormat {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<TextureFormat> {
        match byte {
            0 => Some(TextureFormat::Rgba),
            1 => Some(TextureFormat::Grey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShaderStage {
    Vertex = 0,
    Fragment = 1,
    Geometry = 2,
}

impl ShaderStage {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ShaderStage> {
        match byte {
            0 => Some(ShaderStage::Vertex),
            1 => Some(ShaderStage::Fragment),
            2 => Some(ShaderStage::Geometry),
            _ => None,
        }
    }
}

/// Bits of a light's dynamics mask: a set bit marks the parameter dynamic.
pub const LIGHT_DYN_POSITION: u8 = 1 << 0;
pub const LIGHT_DYN_COLOR: u8 = 1 << 1;
pub const LIGHT_DYN_INTENSITY: u8 = 1 << 2;

/// Info struct of `RSRC_TEXTURE`; `size` bytes of pixel data follow.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TextureInfo {
    pub name: StringId,
    pub format: TextureFormat,
    pub size: u64,
}

impl TextureInfo {
    pub const SIZE: usize = 13;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.name)?;
        stream.write_u8(self.format as u8)?;
        stream.write_u64::<LittleEndian>(self.size)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<TextureInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let name = buffer.read_u32::<LittleEndian>()?;
        let format = TextureFormat::from_byte(buffer.read_u8()?)
            .ok_or(NetError::Fatal(ErrorType::UnknownMessage))?;

        Ok(TextureInfo {
            name,
            format,
            size: buffer.read_u64::<LittleEndian>()?,
        })
    }
}

/// Info struct of `RSRC_MATERIAL`; no trailer. Missing texture references are
/// `SID_NONE`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MaterialInfo {
    pub name: StringId,
    pub diffuse: StringId,
    pub specular: StringId,
    pub normal: StringId,
}

impl MaterialInfo {
    pub const SIZE: usize = 16;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.name)?;
        stream.write_u32::<LittleEndian>(self.diffuse)?;
        stream.write_u32::<LittleEndian>(self.specular)?;
        stream.write_u32::<LittleEndian>(self.normal)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<MaterialInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        Ok(MaterialInfo {
            name: buffer.read_u32::<LittleEndian>()?,
            diffuse: buffer.read_u32::<LittleEndian>()?,
            specular: buffer.read_u32::<LittleEndian>()?,
            normal: buffer.read_u32::<LittleEndian>()?,
        })
    }
}

/// A group of indices in the parent model sharing one material. `material`
/// indexes the parent's material table, -1 for none.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MeshInfo {
    /// Offset into the parent model's indices.
    pub offset: u32,
    /// Amount of indices.
    pub len: u32,
    pub material: i16,
}

impl MeshInfo {
    pub const SIZE: usize = 10;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.offset)?;
        stream.write_u32::<LittleEndian>(self.len)?;
        stream.write_i16::<LittleEndian>(self.material)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<MeshInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        Ok(MeshInfo {
            offset: buffer.read_u32::<LittleEndian>()?,
            len: buffer.read_u32::<LittleEndian>()?,
            material: buffer.read_i16::<LittleEndian>()?,
        })
    }
}

/// Info struct of `RSRC_MODEL`; the trailer is `n_materials` material ids
/// followed by `n_meshes` mesh records. Geometry arrives later on the
/// datagram channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ModelInfo {
    pub name: StringId,
    pub n_vertices: u32,
    pub n_indices: u32,
    pub n_materials: u8,
    pub n_meshes: u8,
}

impl ModelInfo {
    pub const SIZE: usize = 14;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.name)?;
        stream.write_u32::<LittleEndian>(self.n_vertices)?;
        stream.write_u32::<LittleEndian>(self.n_indices)?;
        stream.write_u8(self.n_materials)?;
        stream.write_u8(self.n_meshes)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<ModelInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        Ok(ModelInfo {
            name: buffer.read_u32::<LittleEndian>()?,
            n_vertices: buffer.read_u32::<LittleEndian>()?,
            n_indices: buffer.read_u32::<LittleEndian>()?,
            n_materials: buffer.read_u8()?,
            n_meshes: buffer.read_u8()?,
        })
    }

    /// Byte length of the material + mesh trailer.
    #[inline]
    pub fn trailer_bytes(&self) -> usize {
        self.n_materials as usize * 4 + self.n_meshes as usize * MeshInfo::SIZE
    }
}

/// Info struct of `RSRC_POINT_LIGHT`; no trailer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLightInfo {
    pub name: StringId,
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub intensity: f32,
    /// Fixed/dynamic bitmask, see `LIGHT_DYN_*`.
    pub dyn_mask: u8,
}

impl PointLightInfo {
    pub const SIZE: usize = 33;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.name)?;
        for &value in self.position.iter().chain(self.color.iter()) {
            stream.write_f32::<LittleEndian>(value)?;
        }
        stream.write_f32::<LittleEndian>(self.intensity)?;
        stream.write_u8(self.dyn_mask)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<PointLightInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let name = buffer.read_u32::<LittleEndian>()?;
        let mut position = [0.0f32; 3];
        let mut color = [0.0f32; 3];
        for value in position.iter_mut().chain(color.iter_mut()) {
            *value = buffer.read_f32::<LittleEndian>()?;
        }

        Ok(PointLightInfo {
            name,
            position,
            color,
            intensity: buffer.read_f32::<LittleEndian>()?,
            dyn_mask: buffer.read_u8()?,
        })
    }
}

/// Info struct of `RSRC_SHADER`; `code_size` bytes of SPIR-V follow.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ShaderInfo {
    pub name: StringId,
    pub pass_number: u8,
    pub stage: ShaderStage,
    pub code_size: u64,
}

impl ShaderInfo {
    pub const SIZE: usize = 14;

    pub fn encode<W: Write>(&self, stream: &mut W) -> NetResult<()> {
        stream.write_u32::<LittleEndian>(self.name)?;
        stream.write_u8(self.pass_number)?;
        stream.write_u8(self.stage as u8)?;
        stream.write_u64::<LittleEndian>(self.code_size)?;
        Ok(())
    }

    pub fn decode(buffer: &mut &[u8]) -> NetResult<ShaderInfo> {
        if buffer.len() < Self::SIZE {
            return Err(NetError::Wait);
        }

        let name = buffer.read_u32::<LittleEndian>()?;
        let pass_number = buffer.read_u8()?;
        let stage = ShaderStage::from_byte(buffer.read_u8()?)
            .ok_or(NetError::Fatal(ErrorType::UnknownMessage))?;

        Ok(ShaderInfo {
            name,
            pass_number,
            stage,
            code_size: buffer.read_u64::<LittleEndian>()?,
        })
    }
}
