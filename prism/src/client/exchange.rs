//! Client side of the resource exchange: decode each resource packet off the
//! reliable channel, drain its bulk trailer completely, and store the result.

use crate::client::geometry::GeometryStaging;
use crate::logging;
use crate::net::reliable::ReliableChannel;
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::store::{Material, ResourceStore};
use crate::wire::tcp::{
    MaterialInfo, MeshInfo, ModelInfo, MsgType, PointLightInfo, ShaderInfo, TextureInfo,
};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::{Mutex, RwLock};

/// Upper bounds on declared bulk sizes; anything above is a protocol
/// violation, not an allocation request.
const MAX_TEXTURE_BYTES: u64 = 128 * 1024 * 1024;
const MAX_SHADER_BYTES: u64 = 16 * 1024 * 1024;

/// Receives the resource whose type byte was just read, stores it, and
/// leaves the channel positioned at the next message boundary.
pub fn receive_resource(
    channel: &mut ReliableChannel,
    kind: MsgType,
    store: &RwLock<ResourceStore>,
    geometry: &Mutex<GeometryStaging>,
    log: &logging::Logger,
) -> NetResult<()> {
    match kind {
        MsgType::RsrcTexture => receive_texture(channel, store, log),
        MsgType::RsrcMaterial => receive_material(channel, store, log),
        MsgType::RsrcModel => receive_model(channel, store, geometry, log),
        MsgType::RsrcPointLight => receive_point_light(channel, store, log),
        MsgType::RsrcShader => receive_shader(channel, store, log),
        _ => Err(NetError::Fatal(ErrorType::UnexpectedMessage)),
    }
}

fn receive_texture(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut info_bytes = [0u8; TextureInfo::SIZE];
    channel.read_payload(&mut info_bytes)?;
    let info = TextureInfo::decode(&mut &info_bytes[..])?;

    if info.size > MAX_TEXTURE_BYTES {
        logging::error!(log, "texture exceeds size bound";
                        "id" => info.name, "bytes" => info.size);
        return Err(NetError::Fatal(ErrorType::SizeOverflow));
    }

    // The trailer must be drained fully even if the insert below is a
    // duplicate no-op, or the channel loses framing.
    let mut data = vec![0u8; info.size as usize];
    channel.read_payload(&mut data)?;

    logging::info!(log, "received texture"; "id" => info.name, "bytes" => data.len());
    store
        .write()
        .expect("store lock poisoned")
        .insert_texture(info.name, info.format, &data);

    Ok(())
}

fn receive_material(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut info_bytes = [0u8; MaterialInfo::SIZE];
    channel.read_payload(&mut info_bytes)?;
    let info = MaterialInfo::decode(&mut &info_bytes[..])?;

    logging::info!(log, "received material"; "id" => info.name);
    store.write().expect("store lock poisoned").insert_material(
        info.name,
        Material {
            diffuse: info.diffuse,
            specular: info.specular,
            normal: info.normal,
        },
    );

    Ok(())
}

fn receive_model(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    geometry: &Mutex<GeometryStaging>,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut info_bytes = [0u8; ModelInfo::SIZE];
    channel.read_payload(&mut info_bytes)?;
    let info = ModelInfo::decode(&mut &info_bytes[..])?;

    let mut trailer = vec![0u8; info.trailer_bytes()];
    channel.read_payload(&mut trailer)?;

    let mut materials = Vec::with_capacity(info.n_materials as usize);
    for raw in trailer[..info.n_materials as usize * 4].chunks_exact(4) {
        materials.push(LittleEndian::read_u32(raw));
    }

    let mut meshes = Vec::with_capacity(info.n_meshes as usize);
    let mut cursor = &trailer[info.n_materials as usize * 4..];
    for _ in 0..info.n_meshes {
        meshes.push(MeshInfo::decode(&mut cursor)?);
    }

    logging::info!(log, "received model";
                   "id" => info.name,
                   "vertices" => info.n_vertices,
                   "indices" => info.n_indices,
                   "materials" => materials.len(),
                   "meshes" => meshes.len());

    let inserted = store.write().expect("store lock poisoned").insert_model_info(
        info.name,
        info.n_vertices,
        info.n_indices,
        materials,
        meshes,
    );

    if inserted {
        // Geometry arrives later over the datagram channel; reserve its
        // staging region now so those updates have somewhere to land.
        let registered = geometry
            .lock()
            .expect("geometry staging poisoned")
            .register(info.name, info.n_vertices, info.n_indices);
        if !registered {
            logging::error!(log, "no staging room for model geometry"; "id" => info.name);
        }
    }

    Ok(())
}

fn receive_point_light(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut info_bytes = [0u8; PointLightInfo::SIZE];
    channel.read_payload(&mut info_bytes)?;
    let info = PointLightInfo::decode(&mut &info_bytes[..])?;

    logging::info!(log, "received point light"; "id" => info.name);
    store
        .write()
        .expect("store lock poisoned")
        .insert_point_light(info);

    Ok(())
}

fn receive_shader(
    channel: &mut ReliableChannel,
    store: &RwLock<ResourceStore>,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut info_bytes = [0u8; ShaderInfo::SIZE];
    channel.read_payload(&mut info_bytes)?;
    let info = ShaderInfo::decode(&mut &info_bytes[..])?;

    if info.code_size > MAX_SHADER_BYTES {
        logging::error!(log, "shader exceeds size bound";
                        "id" => info.name, "bytes" => info.code_size);
        return Err(NetError::Fatal(ErrorType::SizeOverflow));
    }

    let mut code = vec![0u8; info.code_size as usize];
    channel.read_payload(&mut code)?;

    logging::info!(log, "received shader"; "id" => info.name, "bytes" => code.len());
    store.write().expect("store lock poisoned").insert_shader(
        info.name,
        info.stage,
        info.pass_number,
        &code,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sid;
    use crate::net::reliable::Msg;
    use crate::wire::tcp::{ShaderStage, TextureFormat};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn pair() -> (ReliableChannel, ReliableChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        let connected = connector.join().unwrap();

        (
            ReliableChannel::new(accepted, Duration::from_millis(500), None).unwrap(),
            ReliableChannel::new(connected, Duration::from_millis(500), None).unwrap(),
        )
    }

    fn receiver_parts() -> (RwLock<ResourceStore>, Mutex<GeometryStaging>) {
        (
            RwLock::new(ResourceStore::new(1 << 20, None)),
            Mutex::new(GeometryStaging::new(1 << 16, 1 << 14, None)),
        )
    }

    #[test]
    fn test_texture_transfer() {
        let (mut sender, mut receiver) = pair();
        let (store, geometry) = receiver_parts();
        let log = logging::discard();

        let info = TextureInfo {
            name: sid("t.png"),
            format: TextureFormat::Rgba,
            size: 16,
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();
        payload.extend(vec![0xffu8; 16]);
        sender.send_with(MsgType::RsrcTexture, &payload).unwrap();

        match receiver.recv().unwrap() {
            Msg::Resource(kind) => {
                receive_resource(&mut receiver, kind, &store, &geometry, &log).unwrap()
            }
            other => panic!("unexpected message {:?}", other),
        }

        let store = store.read().unwrap();
        let texture = store.texture(sid("t.png")).unwrap();
        assert_eq!(texture.format, TextureFormat::Rgba);
        assert_eq!(store.texture_data(texture), &[0xff; 16][..]);
    }

    #[test]
    fn test_model_transfer_registers_staging() {
        let (mut sender, mut receiver) = pair();
        let (store, geometry) = receiver_parts();
        let log = logging::discard();

        let info = ModelInfo {
            name: sid("quad"),
            n_vertices: 4,
            n_indices: 6,
            n_materials: 1,
            n_meshes: 1,
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();
        payload.extend_from_slice(&sid("mat").to_le_bytes());
        MeshInfo {
            offset: 0,
            len: 6,
            material: 0,
        }
        .encode(&mut payload)
        .unwrap();
        sender.send_with(MsgType::RsrcModel, &payload).unwrap();

        match receiver.recv().unwrap() {
            Msg::Resource(kind) => {
                receive_resource(&mut receiver, kind, &store, &geometry, &log).unwrap()
            }
            other => panic!("unexpected message {:?}", other),
        }

        let store = store.read().unwrap();
        let model = store.model(sid("quad")).unwrap();
        assert_eq!(model.n_vertices, 4);
        assert_eq!(model.materials, vec![sid("mat")]);
        assert_eq!(model.meshes.len(), 1);

        let geometry = geometry.lock().unwrap();
        let location = geometry.location(sid("quad")).unwrap();
        assert_eq!(location.vertex_len, 4 * 32);
        assert_eq!(location.index_len, 6 * 4);
    }

    #[test]
    fn test_duplicate_model_keeps_framing() {
        let (mut sender, mut receiver) = pair();
        let (store, geometry) = receiver_parts();
        let log = logging::discard();

        let info = ModelInfo {
            name: sid("quad"),
            n_vertices: 2,
            n_indices: 0,
            n_materials: 0,
            n_meshes: 0,
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();

        // The same model twice, followed by a keepalive: the second copy is
        // a no-op but the stream must stay in sync.
        sender.send_with(MsgType::RsrcModel, &payload).unwrap();
        sender.send_with(MsgType::RsrcModel, &payload).unwrap();
        sender.send(MsgType::Keepalive).unwrap();

        for _ in 0..2 {
            match receiver.recv().unwrap() {
                Msg::Resource(kind) => {
                    receive_resource(&mut receiver, kind, &store, &geometry, &log).unwrap()
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(receiver.recv().unwrap(), Msg::Keepalive);
    }

    #[test]
    fn test_shader_transfer() {
        let (mut sender, mut receiver) = pair();
        let (store, geometry) = receiver_parts();
        let log = logging::discard();

        let code = vec![3u8; 64];
        let info = ShaderInfo {
            name: sid("gbuffer.frag"),
            pass_number: 0,
            stage: ShaderStage::Fragment,
            code_size: code.len() as u64,
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();
        payload.extend_from_slice(&code);
        sender.send_with(MsgType::RsrcShader, &payload).unwrap();

        match receiver.recv().unwrap() {
            Msg::Resource(kind) => {
                receive_resource(&mut receiver, kind, &store, &geometry, &log).unwrap()
            }
            other => panic!("unexpected message {:?}", other),
        }

        let store = store.read().unwrap();
        let shader = store.shader(sid("gbuffer.frag")).unwrap();
        assert_eq!(shader.stage, ShaderStage::Fragment);
        assert_eq!(store.shader_code(shader), &code[..]);
    }

    #[test]
    fn test_oversized_texture_is_fatal() {
        let (mut sender, mut receiver) = pair();
        let (store, geometry) = receiver_parts();
        let log = logging::discard();

        let info = TextureInfo {
            name: sid("huge"),
            format: TextureFormat::Rgba,
            size: MAX_TEXTURE_BYTES + 1,
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();
        sender.send_with(MsgType::RsrcTexture, &payload).unwrap();

        match receiver.recv().unwrap() {
            Msg::Resource(kind) => {
                assert_eq!(
                    receive_resource(&mut receiver, kind, &store, &geometry, &log).unwrap_err(),
                    NetError::Fatal(ErrorType::SizeOverflow)
                );
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
