//! Client-side geometry staging: two host-visible byte buffers the renderer
//! reads from directly, a locations map assigning each model a fixed region,
//! and per-model rings of recent packet generations enforcing the
//! newest-generation-wins rule for overlapping range writes.

use crate::hashing::StringId;
use crate::logging;
use crate::wire::geometry::{element_size, GeomKind};
use crate::wire::udp::GeomUpdateHeader;
use hashbrown::HashMap;
use std::ops::Range;

/// Where a model's geometry lives inside the staging buffers. Assigned when
/// the model is received, never moved during a session. All fields are byte
/// quantities.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GeometryLocation {
    pub vertex_offset: usize,
    pub vertex_len: usize,
    pub index_offset: usize,
    pub index_len: usize,
}

/// How many recent writes are remembered per model. Persistent resends all
/// carry fresh generations, so a short memory suffices.
const GEN_RING_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct GenEntry {
    kind: GeomKind,
    range: (usize, usize),
    packet_gen: u64,
}

struct GenRing {
    entries: [Option<GenEntry>; GEN_RING_LEN],
    next: usize,
}

impl GenRing {
    fn new() -> GenRing {
        GenRing {
            entries: [None; GEN_RING_LEN],
            next: 0,
        }
    }

    /// Newest generation that already touched an overlapping range.
    fn newest_overlapping(&self, kind: GeomKind, range: (usize, usize)) -> Option<u64> {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.kind == kind)
            .filter(|entry| entry.range.0 < range.1 && range.0 < entry.range.1)
            .map(|entry| entry.packet_gen)
            .max()
    }

    fn record(&mut self, kind: GeomKind, range: (usize, usize), packet_gen: u64) {
        self.entries[self.next] = Some(GenEntry {
            kind,
            range,
            packet_gen,
        });
        self.next = (self.next + 1) % GEN_RING_LEN;
    }
}

/// What happened to one geometry chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Bytes copied; the returned absolute range of the staging buffer is
    /// dirty and the renderer must be told.
    Applied(GeomKind, Range<usize>),
    /// A newer generation already wrote an overlapping range; the chunk was
    /// ignored (but is still acknowledged, since it was delivered).
    Superseded,
    /// The model has no staging location yet (not received, or removed).
    UnknownModel,
    /// The chunk addressed elements past the model's region.
    OutOfBounds,
}

pub struct GeometryStaging {
    vertices: Vec<u8>,
    indices: Vec<u8>,
    vertex_used: usize,
    index_used: usize,
    locations: HashMap<StringId, GeometryLocation>,
    gens: HashMap<StringId, GenRing>,
    log: logging::Logger,
}

impl GeometryStaging {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        vertex_capacity: usize,
        index_capacity: usize,
        log: L,
    ) -> GeometryStaging {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "geometry-staging")),
            None => logging::discard(),
        };

        GeometryStaging {
            vertices: vec![0u8; vertex_capacity],
            indices: vec![0u8; index_capacity],
            vertex_used: 0,
            index_used: 0,
            locations: HashMap::new(),
            gens: HashMap::new(),
            log,
        }
    }

    /// Reserves staging regions for a newly received model. Locations are
    /// handed out monotonically and never move. Registering a known model
    /// again is a no-op.
    pub fn register(&mut self, model_id: StringId, n_vertices: u32, n_indices: u32) -> bool {
        if self.locations.contains_key(&model_id) {
            logging::warn!(self.log, "model already registered"; "id" => model_id);
            return false;
        }

        let vertex_len = n_vertices as usize * element_size(GeomKind::Vertex);
        let index_len = n_indices as usize * element_size(GeomKind::Index);

        if self.vertex_used + vertex_len > self.vertices.len()
            || self.index_used + index_len > self.indices.len()
        {
            logging::error!(self.log, "staging buffers exhausted";
                            "id" => model_id,
                            "vertex_bytes" => vertex_len,
                            "index_bytes" => index_len);
            return false;
        }

        let location = GeometryLocation {
            vertex_offset: self.vertex_used,
            vertex_len,
            index_offset: self.index_used,
            index_len,
        };
        self.vertex_used += vertex_len;
        self.index_used += index_len;

        self.locations.insert(model_id, location);
        self.gens.insert(model_id, GenRing::new());

        logging::debug!(self.log, "model staging registered";
                        "id" => model_id,
                        "vertex_offset" => location.vertex_offset,
                        "index_offset" => location.index_offset);
        true
    }

    pub fn location(&self, model_id: StringId) -> Option<&GeometryLocation> {
        self.locations.get(&model_id)
    }

    /// Applies one geometry chunk under the generation of the datagram that
    /// carried it.
    pub fn apply(
        &mut self,
        header: &GeomUpdateHeader,
        payload: &[u8],
        packet_gen: u64,
    ) -> ApplyOutcome {
        debug_assert_eq!(payload.len(), header.payload_bytes());

        let location = match self.locations.get(&header.model_id) {
            Some(location) => *location,
            None => return ApplyOutcome::UnknownModel,
        };

        let elem_size = element_size(header.kind);
        let (region_offset, region_len) = match header.kind {
            GeomKind::Vertex => (location.vertex_offset, location.vertex_len),
            GeomKind::Index => (location.index_offset, location.index_len),
        };

        let relative_start = header.start as usize * elem_size;
        let relative_end = relative_start + payload.len();
        if relative_end > region_len {
            return ApplyOutcome::OutOfBounds;
        }

        let ring = self
            .gens
            .get_mut(&header.model_id)
            .expect("registered models have a gen ring");

        // Last writer wins across datagrams: never let an older generation
        // overwrite a range a newer one already touched.
        if let Some(newest) = ring.newest_overlapping(header.kind, (relative_start, relative_end)) {
            if newest > packet_gen {
                return ApplyOutcome::Superseded;
            }
        }
        ring.record(header.kind, (relative_start, relative_end), packet_gen);

        let absolute = region_offset + relative_start..region_offset + relative_end;
        let buffer = match header.kind {
            GeomKind::Vertex => &mut self.vertices,
            GeomKind::Index => &mut self.indices,
        };
        buffer[absolute.clone()].copy_from_slice(payload);

        ApplyOutcome::Applied(header.kind, absolute)
    }

    /// The whole vertex staging buffer; the renderer maps this.
    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertices
    }

    pub fn index_bytes(&self) -> &[u8] {
        &self.indices
    }

    /// A model's current vertex region.
    pub fn model_vertex_bytes(&self, model_id: StringId) -> Option<&[u8]> {
        let location = self.locations.get(&model_id)?;
        Some(&self.vertices[location.vertex_offset..location.vertex_offset + location.vertex_len])
    }

    pub fn model_index_bytes(&self, model_id: StringId) -> Option<&[u8]> {
        let location = self.locations.get(&model_id)?;
        Some(&self.indices[location.index_offset..location.index_offset + location.index_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sid;
    use crate::wire::geometry::VERTEX_SIZE;

    fn staging() -> GeometryStaging {
        GeometryStaging::new(1 << 16, 1 << 14, None)
    }

    fn vertex_header(model: StringId, start: u32, len: u32) -> GeomUpdateHeader {
        GeomUpdateHeader {
            model_id: model,
            kind: GeomKind::Vertex,
            start,
            len,
        }
    }

    #[test]
    fn test_locations_are_monotonic() {
        let mut staging = staging();

        assert!(staging.register(sid("a"), 10, 6));
        assert!(staging.register(sid("b"), 4, 3));

        let a = *staging.location(sid("a")).unwrap();
        let b = *staging.location(sid("b")).unwrap();

        assert_eq!(a.vertex_offset, 0);
        assert_eq!(b.vertex_offset, 10 * VERTEX_SIZE);
        assert_eq!(a.index_offset, 0);
        assert_eq!(b.index_offset, 6 * 4);
    }

    #[test]
    fn test_register_twice_is_noop() {
        let mut staging = staging();

        assert!(staging.register(sid("a"), 10, 0));
        assert!(!staging.register(sid("a"), 10, 0));
    }

    #[test]
    fn test_apply_writes_at_location() {
        let mut staging = staging();
        staging.register(sid("a"), 10, 0);

        let payload = vec![7u8; 3 * VERTEX_SIZE];
        let outcome = staging.apply(&vertex_header(sid("a"), 2, 3), &payload, 1);

        let expected = 2 * VERTEX_SIZE..5 * VERTEX_SIZE;
        assert_eq!(outcome, ApplyOutcome::Applied(GeomKind::Vertex, expected.clone()));
        assert_eq!(&staging.vertex_bytes()[expected], &payload[..]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut staging = staging();
        staging.register(sid("a"), 10, 0);

        let payload = vec![9u8; VERTEX_SIZE];
        let header = vertex_header(sid("a"), 0, 1);

        staging.apply(&header, &payload, 5);
        let before = staging.model_vertex_bytes(sid("a")).unwrap().to_vec();

        // Same chunk, same generation: applying again changes nothing.
        let outcome = staging.apply(&header, &payload, 5);
        assert_eq!(outcome, ApplyOutcome::Applied(GeomKind::Vertex, 0..VERTEX_SIZE));
        assert_eq!(staging.model_vertex_bytes(sid("a")).unwrap(), &before[..]);
    }

    #[test]
    fn test_stale_generation_is_superseded() {
        let mut staging = staging();
        staging.register(sid("a"), 10, 0);

        let newer = vec![1u8; VERTEX_SIZE];
        let older = vec![2u8; VERTEX_SIZE];
        let header = vertex_header(sid("a"), 0, 1);

        staging.apply(&header, &newer, 10);
        let outcome = staging.apply(&header, &older, 9);

        assert_eq!(outcome, ApplyOutcome::Superseded);
        assert_eq!(
            &staging.model_vertex_bytes(sid("a")).unwrap()[..VERTEX_SIZE],
            &newer[..]
        );
    }

    #[test]
    fn test_non_overlapping_old_generation_applies() {
        let mut staging = staging();
        staging.register(sid("a"), 10, 0);

        staging.apply(&vertex_header(sid("a"), 0, 1), &vec![1u8; VERTEX_SIZE], 10);

        // A different range is untouched by the newer write.
        let outcome = staging.apply(&vertex_header(sid("a"), 5, 1), &vec![2u8; VERTEX_SIZE], 3);
        assert!(matches!(outcome, ApplyOutcome::Applied(..)));
    }

    #[test]
    fn test_unknown_model() {
        let mut staging = staging();

        let outcome = staging.apply(&vertex_header(sid("ghost"), 0, 1), &vec![0u8; VERTEX_SIZE], 1);
        assert_eq!(outcome, ApplyOutcome::UnknownModel);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut staging = staging();
        staging.register(sid("a"), 4, 0);

        let outcome = staging.apply(&vertex_header(sid("a"), 3, 2), &vec![0u8; 2 * VERTEX_SIZE], 1);
        assert_eq!(outcome, ApplyOutcome::OutOfBounds);
    }

    #[test]
    fn test_index_region_is_separate() {
        let mut staging = staging();
        staging.register(sid("a"), 4, 6);

        let header = GeomUpdateHeader {
            model_id: sid("a"),
            kind: GeomKind::Index,
            start: 0,
            len: 6,
        };
        let payload: Vec<u8> = (0u32..6).flat_map(|index| index.to_le_bytes().to_vec()).collect();

        let outcome = staging.apply(&header, &payload, 1);
        assert_eq!(outcome, ApplyOutcome::Applied(GeomKind::Index, 0..24));
        assert_eq!(staging.model_index_bytes(sid("a")).unwrap(), &payload[..]);
    }
}
