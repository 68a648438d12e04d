//! The client's main-thread update application: walk the staged records
//! chunk by chunk, write geometry into the staging buffers, mirror light and
//! transform changes, queue ACKs, and tell the renderer what became dirty.

use crate::client::geometry::{ApplyOutcome, GeometryStaging};
use crate::hashing::StringId;
use crate::logging;
use crate::scene::{NodeType, Scene};
use crate::store::ResourceStore;
use crate::sync::{staging_records, SignalQueue};
use crate::transform::Transform;
use crate::wire::geometry::GeomKind;
use crate::wire::udp::{self, Chunk};
use std::ops::Range;
use std::sync::RwLock;

/// What the core tells the renderer. The core knows nothing about GPU
/// resources; it only names staging ranges and ids that changed.
pub trait RenderSink: Send + Sync {
    /// A range of the vertex or index staging buffer now holds new bytes.
    fn geometry_dirty(&self, kind: GeomKind, range: Range<usize>);
    /// A light's colour or intensity changed in the light table.
    fn light_changed(&self, id: StringId);
    /// A node's transform changed; the columns are what the renderer's
    /// descriptor slot consumes.
    fn transform_changed(&self, id: StringId, matrix: &[f32; 16]);
}

/// A sink that ignores everything; tests and headless runs use it.
pub struct NullSink;

impl RenderSink for NullSink {
    fn geometry_dirty(&self, _kind: GeomKind, _range: Range<usize>) {}
    fn light_changed(&self, _id: StringId) {}
    fn transform_changed(&self, _id: StringId, _matrix: &[f32; 16]) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ApplyStats {
    pub chunks_applied: usize,
    pub geom_applied: usize,
    pub superseded: usize,
    pub discarded: usize,
    pub acks_queued: usize,
    /// Datagrams whose remaining bytes were abandoned mid-walk.
    pub aborted_records: usize,
}

/// Applies everything in a drained staging buffer. Each record is one
/// datagram's payload under its generation; an unparseable chunk aborts the
/// rest of that record only.
pub fn apply_staged(
    bytes: &[u8],
    geometry: &mut GeometryStaging,
    store: &RwLock<ResourceStore>,
    scene: &RwLock<Scene>,
    sink: &dyn RenderSink,
    ack_outbox: &SignalQueue<u32>,
    log: &logging::Logger,
) -> ApplyStats {
    let mut stats = ApplyStats::default();

    for record in staging_records(bytes) {
        let mut cursor = record.payload;

        while !cursor.is_empty() {
            let chunk = match udp::read_chunk(&mut cursor) {
                Ok(chunk) => chunk,
                Err(err) => {
                    logging::warn!(log, "abandoning datagram remainder";
                                   "packet_gen" => record.packet_gen,
                                   "error" => ?err);
                    stats.aborted_records += 1;
                    break;
                }
            };

            match chunk {
                Chunk::Geom { header, payload } => {
                    match geometry.apply(&header, payload, record.packet_gen) {
                        ApplyOutcome::Applied(kind, range) => {
                            sink.geometry_dirty(kind, range);
                            stats.geom_applied += 1;
                            stats.chunks_applied += 1;
                            ack_outbox.push(header.serial_id());
                            stats.acks_queued += 1;
                        }
                        ApplyOutcome::Superseded => {
                            // Delivered but outdated; still acknowledge it
                            // so the server stops resending.
                            stats.superseded += 1;
                            ack_outbox.push(header.serial_id());
                            stats.acks_queued += 1;
                        }
                        ApplyOutcome::UnknownModel => {
                            logging::warn!(log, "geometry update for unknown model";
                                           "id" => header.model_id);
                            stats.discarded += 1;
                        }
                        ApplyOutcome::OutOfBounds => {
                            logging::warn!(log, "geometry update out of bounds";
                                           "id" => header.model_id,
                                           "start" => header.start,
                                           "len" => header.len);
                            stats.discarded += 1;
                        }
                    }
                }
                Chunk::PointLight(update) => {
                    let mut store = store.write().expect("store lock poisoned");
                    match store.light_mut(update.light_id) {
                        Some(light) => {
                            light.color = update.color;
                            light.intensity = update.intensity;
                            sink.light_changed(update.light_id);
                            stats.chunks_applied += 1;
                        }
                        None => {
                            logging::warn!(log, "light update for unknown light";
                                           "id" => update.light_id);
                            stats.discarded += 1;
                        }
                    }
                }
                Chunk::Transform(update) => {
                    {
                        let mut scene = scene.write().expect("scene lock poisoned");
                        // The mirror learns about nodes from the stream
                        // itself; first sight of an id creates its node.
                        if scene.get(update.node_id).is_none() {
                            scene.add_node(update.node_id, NodeType::Model, Transform::default());
                        }
                        if let Some(node) = scene.get_mut(update.node_id) {
                            node.transform = mirror_transform(&update.matrix);
                        }
                    }
                    sink.transform_changed(update.node_id, &update.matrix);
                    stats.chunks_applied += 1;
                }
            }
        }
    }

    stats
}

/// The wire carries a finished matrix; the mirror keeps it as an opaque
/// decomposed-equivalent transform. Only the translation is recoverable
/// without a full decomposition, which the renderer does not need: it
/// consumes the matrix columns straight from the update.
fn mirror_transform(matrix: &[f32; 16]) -> Transform {
    use nalgebra_glm as glm;

    Transform::default().with_position(glm::vec3(matrix[12], matrix[13], matrix[14]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sid;
    use crate::sync::StagingQueue;
    use crate::wire::geometry::VERTEX_SIZE;
    use crate::wire::tcp::PointLightInfo;
    use crate::wire::udp::{
        ChunkType, GeomUpdateHeader, PointLightUpdateHeader, TransformUpdateHeader,
    };

    fn setup() -> (GeometryStaging, RwLock<ResourceStore>, RwLock<Scene>, SignalQueue<u32>) {
        let mut geometry = GeometryStaging::new(1 << 16, 1 << 14, None);
        geometry.register(sid("model"), 10, 6);

        let mut store = ResourceStore::new(1 << 12, None);
        store.insert_point_light(PointLightInfo {
            name: sid("lamp"),
            position: [0.0; 3],
            color: [1.0; 3],
            intensity: 1.0,
            dyn_mask: 0,
        });

        (
            geometry,
            RwLock::new(store),
            RwLock::new(Scene::new(None)),
            SignalQueue::new(),
        )
    }

    fn geom_chunk(start: u32, len: u32, fill: u8) -> Vec<u8> {
        let header = GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start,
            len,
        };

        let mut bytes = vec![ChunkType::GeomUpdate as u8];
        header.encode(&mut bytes).unwrap();
        bytes.extend(std::iter::repeat(fill).take(header.payload_bytes()));
        bytes
    }

    fn staged(records: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let queue = StagingQueue::new(1 << 16, None);
        for (gen, payload) in records {
            assert!(queue.append(*gen, payload));
        }
        let mut drained = Vec::new();
        queue.drain_into(&mut drained);
        drained
    }

    #[test]
    fn test_geom_chunk_lands_in_staging() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        let bytes = staged(&[(1, geom_chunk(0, 3, 0xab))]);
        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.geom_applied, 1);
        assert_eq!(stats.acks_queued, 1);
        assert_eq!(
            &geometry.model_vertex_bytes(sid("model")).unwrap()[..3 * VERTEX_SIZE],
            &vec![0xab; 3 * VERTEX_SIZE][..]
        );

        // The ACK carries the chunk's serial id.
        let expected_serial = GeomUpdateHeader {
            model_id: sid("model"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 3,
        }
        .serial_id();
        assert_eq!(acks.drain(), vec![expected_serial]);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        let bytes = staged(&[(1, geom_chunk(0, 2, 0x11))]);
        apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);
        let first = geometry.model_vertex_bytes(sid("model")).unwrap().to_vec();

        let bytes = staged(&[(1, geom_chunk(0, 2, 0x11))]);
        apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(geometry.model_vertex_bytes(sid("model")).unwrap(), &first[..]);
    }

    #[test]
    fn test_newer_generation_wins_across_records() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        // Generation 7 arrives before the late generation 6 for the same
        // range; the late write must not clobber it.
        let bytes = staged(&[(7, geom_chunk(0, 1, 0x77)), (6, geom_chunk(0, 1, 0x66))]);
        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.geom_applied, 1);
        assert_eq!(stats.superseded, 1);
        // Superseded chunks are still acknowledged.
        assert_eq!(stats.acks_queued, 2);
        assert_eq!(
            &geometry.model_vertex_bytes(sid("model")).unwrap()[..VERTEX_SIZE],
            &vec![0x77; VERTEX_SIZE][..]
        );
    }

    #[test]
    fn test_unknown_model_discarded_without_ack() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        let header = GeomUpdateHeader {
            model_id: sid("ghost"),
            kind: GeomKind::Vertex,
            start: 0,
            len: 1,
        };
        let mut chunk = vec![ChunkType::GeomUpdate as u8];
        header.encode(&mut chunk).unwrap();
        chunk.extend(vec![0u8; VERTEX_SIZE]);

        let bytes = staged(&[(1, chunk)]);
        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.acks_queued, 0);
        assert!(acks.drain().is_empty());
    }

    #[test]
    fn test_unknown_chunk_aborts_record_only() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        // First record: junk byte, then a valid chunk that must be skipped.
        let mut junk = vec![0x7fu8];
        junk.extend(geom_chunk(0, 1, 0x22));
        // Second record stays fully applicable.
        let bytes = staged(&[(1, junk), (2, geom_chunk(1, 1, 0x33))]);

        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.aborted_records, 1);
        assert_eq!(stats.geom_applied, 1);
        assert_eq!(
            &geometry.model_vertex_bytes(sid("model")).unwrap()[VERTEX_SIZE..2 * VERTEX_SIZE],
            &vec![0x33; VERTEX_SIZE][..]
        );
    }

    #[test]
    fn test_light_update_applies() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        let update = PointLightUpdateHeader {
            light_id: sid("lamp"),
            color: [0.25, 0.5, 0.75],
            intensity: 9.0,
        };
        let mut chunk = vec![ChunkType::PointLightUpdate as u8];
        update.encode(&mut chunk).unwrap();

        let bytes = staged(&[(1, chunk)]);
        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.chunks_applied, 1);
        let store = store.read().unwrap();
        let light = store.light(sid("lamp")).unwrap();
        assert_eq!(light.color, [0.25, 0.5, 0.75]);
        assert_eq!(light.intensity, 9.0);
    }

    #[test]
    fn test_transform_update_mirrors_node() {
        let (mut geometry, store, scene, acks) = setup();
        let log = logging::discard();

        let mut matrix = [0.0f32; 16];
        matrix[0] = 1.0;
        matrix[5] = 1.0;
        matrix[10] = 1.0;
        matrix[15] = 1.0;
        matrix[12] = 4.0;
        matrix[13] = 5.0;
        matrix[14] = 6.0;

        let update = TransformUpdateHeader {
            node_id: sid("model"),
            matrix,
        };
        let mut chunk = vec![ChunkType::TransformUpdate as u8];
        update.encode(&mut chunk).unwrap();

        let bytes = staged(&[(1, chunk)]);
        let stats = apply_staged(&bytes, &mut geometry, &store, &scene, &NullSink, &acks, &log);

        assert_eq!(stats.chunks_applied, 1);
        let scene = scene.read().unwrap();
        let node = scene.get(sid("model")).unwrap();
        assert_eq!(node.transform.position.x, 4.0);
        assert_eq!(node.transform.position.y, 5.0);
        assert_eq!(node.transform.position.z, 6.0);
    }
}
