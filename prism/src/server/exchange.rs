//! Server side of the resource-exchange sub-protocol and the geometry
//! seeding that follows a model into the scene.
//!
//! Resources go out in dependency order: a material's textures before the
//! material, a model's materials before the model, then point lights, then
//! shaders. The per-connection sent set makes re-exchanges idempotent.

use crate::hashing::{StringId, SID_NONE};
use crate::logging;
use crate::net::reliable::{await_event, Msg, ProtocolEvents, ReliableChannel};
use crate::net::support::{NetError, NetResult};
use crate::store::ResourceStore;
use crate::sync::CancelToken;
use crate::wire::geometry::{GeomKind, INDEX_SIZE, VERTEX_SIZE};
use crate::wire::tcp::{
    MaterialInfo, ModelInfo, MsgType, PointLightInfo, ShaderInfo, TextureFormat, TextureInfo,
};
use crate::wire::udp::{GeomUpdateHeader, UdpHeader};
use crate::PACKET_SIZE_BYTES;
use indexmap::IndexSet;
use std::sync::RwLock;
use std::time::Duration;

/// Room for chunk payload in a datagram that already carries the packet
/// header, a chunk type byte and a geometry chunk header.
const CHUNK_PAYLOAD_BUDGET: usize =
    PACKET_SIZE_BYTES - UdpHeader::SIZE - 1 - GeomUpdateHeader::SIZE;

pub const MAX_VERTICES_PER_CHUNK: u32 = (CHUNK_PAYLOAD_BUDGET / VERTEX_SIZE) as u32;
pub const MAX_INDICES_PER_CHUNK: u32 = (CHUNK_PAYLOAD_BUDGET / INDEX_SIZE) as u32;

/// Splits a model's full vertex and index ranges into the maximal chunks a
/// datagram can carry. These seed the persistent queue when the model enters
/// the scene.
pub fn seed_geometry(model_id: StringId, n_vertices: u32, n_indices: u32) -> Vec<GeomUpdateHeader> {
    let mut updates = Vec::new();

    let mut start = 0;
    while start < n_vertices {
        let len = (n_vertices - start).min(MAX_VERTICES_PER_CHUNK);
        updates.push(GeomUpdateHeader {
            model_id,
            kind: GeomKind::Vertex,
            start,
            len,
        });
        start += len;
    }

    let mut start = 0;
    while start < n_indices {
        let len = (n_indices - start).min(MAX_INDICES_PER_CHUNK);
        updates.push(GeomUpdateHeader {
            model_id,
            kind: GeomKind::Index,
            start,
            len,
        });
        start += len;
    }

    updates
}

/// What one exchange run should deliver.
pub struct ExchangeBatch {
    pub models: Vec<StringId>,
    pub include_lights: bool,
    pub include_shaders: bool,
}

pub struct ExchangeCtx<'a> {
    pub events: &'a ProtocolEvents,
    pub cancel: &'a CancelToken,
    pub ack_timeout: Duration,
    pub sent: &'a mut IndexSet<StringId>,
    pub log: &'a logging::Logger,
}

impl<'a> ExchangeCtx<'a> {
    fn await_ack(&self) -> NetResult<()> {
        await_event(
            self.events,
            Msg::RsrcExchangeAck,
            self.cancel,
            self.ack_timeout,
            self.log,
        )
    }
}

/// Runs one resource exchange over the reliable channel: START, the batch
/// contents in dependency order, END. The store read lock is taken per
/// resource and bytes are copied out before hitting the network, so the
/// application stage is never blocked behind a send.
pub fn run_exchange(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    batch: &ExchangeBatch,
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    logging::info!(ctx.log, "starting resource exchange";
                   "models" => batch.models.len(),
                   "lights" => batch.include_lights,
                   "shaders" => batch.include_shaders);

    channel.send(MsgType::StartRsrcExchange)?;
    ctx.await_ack()?;

    for &model_id in &batch.models {
        send_model_closure(channel, store, model_id, ctx)?;
    }

    if batch.include_lights {
        let lights = store.read().expect("store lock poisoned").lights().to_vec();
        for light in lights {
            send_point_light(channel, light, ctx)?;
        }
    }

    if batch.include_shaders {
        let shaders = snapshot_shaders(&store.read().expect("store lock poisoned"));
        for (id, info, code) in shaders {
            send_shader(channel, id, info, &code, ctx)?;
        }
    }

    channel.send(MsgType::EndRsrcExchange)?;
    logging::info!(ctx.log, "resource exchange complete");

    Ok(())
}

/// Sends a model preceded by its dependency closure: the textures of each of
/// its materials, then the materials, then the model record itself.
fn send_model_closure(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    model_id: StringId,
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    // Snapshot the model metadata under one short read lock.
    let (material_ids, info, trailer) = {
        let store = store.read().expect("store lock poisoned");
        let model = store
            .model(model_id)
            .ok_or(NetError::ResourceMissing(model_id))?;

        let info = ModelInfo {
            name: model_id,
            n_vertices: model.n_vertices,
            n_indices: model.n_indices,
            n_materials: model.materials.len() as u8,
            n_meshes: model.meshes.len() as u8,
        };

        let mut trailer = Vec::with_capacity(info.trailer_bytes());
        for &material in &model.materials {
            trailer.extend_from_slice(&material.to_le_bytes());
        }
        for mesh in &model.meshes {
            mesh.encode(&mut trailer)?;
        }

        (model.materials.clone(), info, trailer)
    };

    for material_id in material_ids {
        send_material_closure(channel, store, material_id, ctx)?;
    }

    if ctx.sent.contains(&model_id) {
        return Ok(());
    }

    logging::info!(ctx.log, "sending model"; "id" => model_id,
                   "vertices" => info.n_vertices, "indices" => info.n_indices);

    let mut payload = Vec::with_capacity(ModelInfo::SIZE + trailer.len());
    info.encode(&mut payload)?;
    payload.extend_from_slice(&trailer);

    channel.send_with(MsgType::RsrcModel, &payload)?;
    ctx.await_ack()?;
    ctx.sent.insert(model_id);

    Ok(())
}

fn send_material_closure(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    material_id: StringId,
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    let material = {
        let store = store.read().expect("store lock poisoned");
        store.material(material_id).cloned()
    };

    let material = match material {
        Some(material) => material,
        None => {
            logging::warn!(ctx.log, "model references unknown material"; "id" => material_id);
            return Err(NetError::ResourceMissing(material_id));
        }
    };

    // Textures first, so the receiver never stores a dangling reference.
    for &texture_id in &[material.diffuse, material.specular, material.normal] {
        if texture_id != SID_NONE {
            send_texture(channel, store, texture_id, ctx)?;
        }
    }

    if ctx.sent.contains(&material_id) {
        return Ok(());
    }

    logging::debug!(ctx.log, "sending material"; "id" => material_id);

    let info = MaterialInfo {
        name: material_id,
        diffuse: material.diffuse,
        specular: material.specular,
        normal: material.normal,
    };
    let mut payload = Vec::with_capacity(MaterialInfo::SIZE);
    info.encode(&mut payload)?;

    channel.send_with(MsgType::RsrcMaterial, &payload)?;
    ctx.await_ack()?;
    ctx.sent.insert(material_id);

    Ok(())
}

fn send_texture(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    texture_id: StringId,
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    if ctx.sent.contains(&texture_id) {
        return Ok(());
    }

    let snapshot: Option<(TextureFormat, Vec<u8>)> = {
        let store = store.read().expect("store lock poisoned");
        store
            .texture(texture_id)
            .map(|texture| (texture.format, store.texture_data(texture).to_vec()))
    };

    let (format, data) = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            logging::warn!(ctx.log, "material references unknown texture"; "id" => texture_id);
            return Ok(());
        }
    };

    logging::info!(ctx.log, "sending texture"; "id" => texture_id, "bytes" => data.len());

    let info = TextureInfo {
        name: texture_id,
        format,
        size: data.len() as u64,
    };
    let mut payload = Vec::with_capacity(TextureInfo::SIZE + data.len());
    info.encode(&mut payload)?;
    payload.extend_from_slice(&data);

    channel.send_with(MsgType::RsrcTexture, &payload)?;
    ctx.await_ack()?;
    ctx.sent.insert(texture_id);

    Ok(())
}

fn send_point_light(
    channel: &mut ReliableChannel,
    light: PointLightInfo,
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    if ctx.sent.contains(&light.name) {
        return Ok(());
    }

    logging::info!(ctx.log, "sending point light"; "id" => light.name);

    let mut payload = Vec::with_capacity(PointLightInfo::SIZE);
    light.encode(&mut payload)?;

    channel.send_with(MsgType::RsrcPointLight, &payload)?;
    ctx.await_ack()?;
    ctx.sent.insert(light.name);

    Ok(())
}

fn send_shader(
    channel: &mut ReliableChannel,
    id: StringId,
    info: ShaderInfo,
    code: &[u8],
    ctx: &mut ExchangeCtx<'_>,
) -> NetResult<()> {
    if ctx.sent.contains(&id) {
        return Ok(());
    }

    logging::info!(ctx.log, "sending shader"; "id" => id, "bytes" => code.len());

    let mut payload = Vec::with_capacity(ShaderInfo::SIZE + code.len());
    info.encode(&mut payload)?;
    payload.extend_from_slice(code);

    channel.send_with(MsgType::RsrcShader, &payload)?;
    ctx.await_ack()?;
    ctx.sent.insert(id);

    Ok(())
}

fn snapshot_shaders(store: &ResourceStore) -> Vec<(StringId, ShaderInfo, Vec<u8>)> {
    store
        .shaders()
        .map(|(&id, shader)| {
            let code = store.shader_code(shader).to_vec();
            (
                id,
                ShaderInfo {
                    name: id,
                    pass_number: shader.pass_number,
                    stage: shader.stage,
                    code_size: code.len() as u64,
                },
                code,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_budgets() {
        // 512 - 12 - 1 - 13 = 486 bytes of payload room.
        assert_eq!(CHUNK_PAYLOAD_BUDGET, 486);
        assert_eq!(MAX_VERTICES_PER_CHUNK, 15);
        assert_eq!(MAX_INDICES_PER_CHUNK, 121);
    }

    #[test]
    fn test_seed_geometry_covers_everything() {
        let updates = seed_geometry(1, 64, 10);

        let vertex_total: u32 = updates
            .iter()
            .filter(|update| update.kind == GeomKind::Vertex)
            .map(|update| update.len)
            .sum();
        let index_total: u32 = updates
            .iter()
            .filter(|update| update.kind == GeomKind::Index)
            .map(|update| update.len)
            .sum();

        assert_eq!(vertex_total, 64);
        assert_eq!(index_total, 10);

        // 64 vertices need ceil(64 / 15) = 5 chunks; 10 indices fit in one.
        assert_eq!(updates.len(), 6);

        // Ranges are contiguous and start at zero per kind.
        let mut expected_start = 0;
        for update in updates.iter().filter(|update| update.kind == GeomKind::Vertex) {
            assert_eq!(update.start, expected_start);
            expected_start += update.len;
        }
    }

    #[test]
    fn test_seed_geometry_chunks_fit_datagrams() {
        for update in seed_geometry(2, 1000, 5000) {
            assert!(
                1 + GeomUpdateHeader::SIZE + update.payload_bytes()
                    <= PACKET_SIZE_BYTES - UdpHeader::SIZE
            );
        }
    }

    #[test]
    fn test_seed_geometry_empty_model() {
        assert!(seed_geometry(3, 0, 0).is_empty());
    }
}
