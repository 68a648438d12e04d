//! Packs queued updates into datagrams. Each update is serialized straight
//! from the store or scene at pack time, so the payload a chunk carries is
//! always the newest state of its range.

use crate::net::support::{NetError, NetResult};
use crate::scene::Scene;
use crate::store::ResourceStore;
use crate::updates::QueuedUpdate;
use crate::wire::geometry::element_size;
use crate::wire::udp::{
    ChunkType, GeomUpdateHeader, PointLightUpdateHeader, TransformUpdateHeader, UdpHeader,
};
use crate::PACKET_SIZE_BYTES;

pub struct DatagramPacker {
    buf: [u8; PACKET_SIZE_BYTES],
    offset: usize,
    packet_gen: u64,
}

impl DatagramPacker {
    pub fn new(packet_gen: u64) -> DatagramPacker {
        DatagramPacker {
            buf: [0u8; PACKET_SIZE_BYTES],
            offset: UdpHeader::SIZE,
            packet_gen,
        }
    }

    /// True when at least one chunk has been packed.
    #[inline]
    pub fn has_chunks(&self) -> bool {
        self.offset > UdpHeader::SIZE
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        PACKET_SIZE_BYTES - self.offset
    }

    #[inline]
    pub fn packet_gen(&self) -> u64 {
        self.packet_gen
    }

    /// Starts a fresh datagram under the given generation.
    pub fn reset(&mut self, packet_gen: u64) {
        self.offset = UdpHeader::SIZE;
        self.packet_gen = packet_gen;
    }

    /// Stamps the header and hands out the finished datagram. Bytes past the
    /// declared size are padding.
    pub fn finish(&mut self) -> &[u8; PACKET_SIZE_BYTES] {
        let header = UdpHeader {
            packet_gen: self.packet_gen,
            size: (self.offset - UdpHeader::SIZE) as u32,
        };
        header
            .encode(&mut &mut self.buf[..UdpHeader::SIZE])
            .expect("sized buffer");

        &self.buf
    }

    /// Serializes one update into the datagram. `Ok(true)` means packed;
    /// `Ok(false)` means it does not fit and the caller must flush and
    /// retry. An update too large for an empty datagram can never be sent
    /// and panics.
    ///
    /// The caller holds the store/scene read locks only across this call.
    pub fn add_update(
        &mut self,
        update: &QueuedUpdate,
        store: &ResourceStore,
        scene: &Scene,
    ) -> NetResult<bool> {
        match update {
            QueuedUpdate::Geom(header) => self.add_geom(header, store),
            QueuedUpdate::PointLight(id) => self.add_point_light(*id, store),
            QueuedUpdate::Transform(id) => self.add_transform(*id, scene),
        }
    }

    fn add_geom(&mut self, header: &GeomUpdateHeader, store: &ResourceStore) -> NetResult<bool> {
        let elem_size = element_size(header.kind);
        let payload_bytes = header.payload_bytes();
        let chunk_bytes = 1 + GeomUpdateHeader::SIZE + payload_bytes;

        if chunk_bytes > PACKET_SIZE_BYTES - UdpHeader::SIZE {
            panic!(
                "geometry update of {} bytes cannot fit an empty datagram",
                chunk_bytes
            );
        }

        let data = match header.kind {
            crate::wire::geometry::GeomKind::Vertex => store.vertex_bytes(header.model_id),
            crate::wire::geometry::GeomKind::Index => store.index_bytes(header.model_id),
        }
        .ok_or(NetError::ResourceMissing(header.model_id))?;

        let begin = header.start as usize * elem_size;
        let end = begin + payload_bytes;
        if end > data.len() {
            return Err(NetError::ResourceMissing(header.model_id));
        }

        if chunk_bytes > self.remaining() {
            return Ok(false);
        }

        self.buf[self.offset] = ChunkType::GeomUpdate as u8;
        let mut cursor = &mut self.buf[self.offset + 1..];
        header.encode(&mut cursor)?;
        self.buf[self.offset + 1 + GeomUpdateHeader::SIZE..self.offset + chunk_bytes]
            .copy_from_slice(&data[begin..end]);

        self.offset += chunk_bytes;
        Ok(true)
    }

    fn add_point_light(&mut self, id: u32, store: &ResourceStore) -> NetResult<bool> {
        let light = store.light(id).ok_or(NetError::ResourceMissing(id))?;

        let chunk_bytes = 1 + PointLightUpdateHeader::SIZE;
        if chunk_bytes > self.remaining() {
            return Ok(false);
        }

        let header = PointLightUpdateHeader {
            light_id: light.name,
            color: light.color,
            intensity: light.intensity,
        };

        self.buf[self.offset] = ChunkType::PointLightUpdate as u8;
        let mut cursor = &mut self.buf[self.offset + 1..];
        header.encode(&mut cursor)?;

        self.offset += chunk_bytes;
        Ok(true)
    }

    fn add_transform(&mut self, id: u32, scene: &Scene) -> NetResult<bool> {
        let node = scene.get(id).ok_or(NetError::ResourceMissing(id))?;

        let chunk_bytes = 1 + TransformUpdateHeader::SIZE;
        if chunk_bytes > self.remaining() {
            return Ok(false);
        }

        let header = TransformUpdateHeader {
            node_id: id,
            matrix: node.transform.matrix_columns(),
        };

        self.buf[self.offset] = ChunkType::TransformUpdate as u8;
        let mut cursor = &mut self.buf[self.offset + 1..];
        header.encode(&mut cursor)?;

        self.offset += chunk_bytes;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sid;
    use crate::net::datagram::validate_datagram;
    use crate::scene::{NodeType, Scene};
    use crate::transform::Transform;
    use crate::wire::geometry::{GeomKind, Vertex, VERTEX_SIZE};
    use crate::wire::tcp::PointLightInfo;
    use crate::wire::udp;

    fn store_with_model(n_vertices: usize) -> ResourceStore {
        let mut store = ResourceStore::new(1 << 20, None);

        let mut vertices = Vec::new();
        for i in 0..n_vertices {
            Vertex {
                pos: [i as f32, 0.0, 0.0],
                normal: [0.0, 1.0, 0.0],
                uv: [0.0, 0.0],
            }
            .encode(&mut vertices)
            .unwrap();
        }
        let indices: Vec<u8> = (0..n_vertices as u32)
            .flat_map(|index| index.to_le_bytes().to_vec())
            .collect();

        store.insert_model(sid("model"), Vec::new(), Vec::new(), &vertices, &indices);
        store
    }

    #[test]
    fn test_single_vertex_chunk_size() {
        let store = store_with_model(10);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(1);

        let update = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 3,
        });

        assert!(packer.add_update(&update, &store, &scene).unwrap());

        let packet = packer.finish();
        let mut cursor = &packet[..];
        let header = UdpHeader::decode(&mut cursor).unwrap();

        // 1 type byte + 13 header bytes + 3 * 32 payload bytes.
        assert_eq!(header.size, 110);
        assert_eq!(header.packet_gen, 1);

        // The finished datagram passes receiver validation.
        validate_datagram(packet, None).unwrap();
    }

    #[test]
    fn test_payload_is_read_from_store() {
        let store = store_with_model(4);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(0);

        let update = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 1,
            len: 2,
        });
        packer.add_update(&update, &store, &scene).unwrap();

        let packet = packer.finish();
        let payload = &packet[UdpHeader::SIZE..];
        let mut cursor = &payload[..110 - 32]; // type + header + 2 vertices
        match udp::read_chunk(&mut cursor).unwrap() {
            udp::Chunk::Geom { payload, .. } => {
                let expected = &store.vertex_bytes(sid("model")).unwrap()
                    [VERTEX_SIZE..3 * VERTEX_SIZE];
                assert_eq!(payload, expected);
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn test_does_not_fit_reports_false() {
        let store = store_with_model(30);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(0);

        // 15 vertices (1 + 13 + 480 = 494 bytes) fill the 500-byte budget.
        let big = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 15,
        });
        assert!(packer.add_update(&big, &store, &scene).unwrap());

        // Nothing else fits now.
        let small = QueuedUpdate::Transform(scene.root_id());
        assert!(!packer.add_update(&small, &store, &scene).unwrap());

        // After a flush and reset it fits again.
        packer.finish();
        packer.reset(1);
        assert!(packer.add_update(&small, &store, &scene).unwrap());
    }

    #[test]
    #[should_panic(expected = "cannot fit an empty datagram")]
    fn test_oversized_update_is_fatal() {
        let store = store_with_model(20);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(0);

        // 16 vertices exceed what any datagram can carry.
        let update = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 16,
        });
        let _ = packer.add_update(&update, &store, &scene);
    }

    #[test]
    fn test_missing_model_is_resource_missing() {
        let store = ResourceStore::new(64, None);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(0);

        let update = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("ghost"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 1,
        });

        assert_eq!(
            packer.add_update(&update, &store, &scene).unwrap_err(),
            NetError::ResourceMissing(sid("ghost"))
        );
        assert!(!packer.has_chunks());
    }

    #[test]
    fn test_range_past_model_end_is_rejected() {
        let store = store_with_model(4);
        let scene = Scene::new(None);
        let mut packer = DatagramPacker::new(0);

        let update = QueuedUpdate::Geom(GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 3,
            len: 2,
        });

        assert!(packer.add_update(&update, &store, &scene).is_err());
    }

    #[test]
    fn test_mixed_chunks_in_one_datagram() {
        let mut store = store_with_model(2);
        store.insert_point_light(PointLightInfo {
            name: sid("lamp"),
            position: [0.0; 3],
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
            dyn_mask: 0,
        });

        let mut scene = Scene::new(None);
        scene.add_node(sid("node"), NodeType::Model, Transform::default());

        let mut packer = DatagramPacker::new(7);
        assert!(packer
            .add_update(&QueuedUpdate::PointLight(sid("lamp")), &store, &scene)
            .unwrap());
        assert!(packer
            .add_update(&QueuedUpdate::Transform(sid("node")), &store, &scene)
            .unwrap());

        let packet = packer.finish();
        let (gen, payload) = validate_datagram(packet, None).unwrap();
        assert_eq!(gen, 7);
        // 21 light bytes + 69 transform bytes.
        assert_eq!(payload.len(), 90);
    }
}
