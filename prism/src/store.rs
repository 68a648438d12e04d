//! Deduplicated, id-keyed store of streamable resources. Bulk bytes live in
//! a stack arena owned by the store; the typed records keep ranges into it.
//! Insertion is one-shot: a resource is immutable for the connection's
//! lifetime and a duplicate insert of the same id is a warned no-op.

use crate::arena::StackArena;
use crate::hashing::{StringId, SID_NONE};
use crate::logging;
use crate::wire::geometry::{INDEX_SIZE, VERTEX_SIZE};
use crate::wire::tcp::{MeshInfo, PointLightInfo, ShaderStage, TextureFormat};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct Texture {
    pub format: TextureFormat,
    pub data: Range<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct Material {
    pub diffuse: StringId,
    pub specular: StringId,
    pub normal: StringId,
}

/// Server-side models carry their geometry bytes; client-side models are
/// metadata only, geometry lands in the staging buffers instead.
#[derive(Debug, Clone)]
pub struct ModelGeometry {
    pub vertices: Range<usize>,
    pub indices: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub n_vertices: u32,
    pub n_indices: u32,
    pub materials: Vec<StringId>,
    pub meshes: Vec<MeshInfo>,
    pub geometry: Option<ModelGeometry>,
}

#[derive(Debug, Clone)]
pub struct Shader {
    pub stage: ShaderStage,
    pub pass_number: u8,
    pub code: Range<usize>,
}

/// Which material slot a texture lookup serves; decides the fallback.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TextureRole {
    Diffuse,
    Specular,
    Normal,
}

/// Ids of the built-in fallback textures.
pub fn default_texture_id(role: TextureRole) -> StringId {
    match role {
        TextureRole::Diffuse => crate::hashing::sid("__default_diffuse"),
        TextureRole::Specular => crate::hashing::sid("__default_specular"),
        TextureRole::Normal => crate::hashing::sid("__default_normal"),
    }
}

pub struct ResourceStore {
    arena: StackArena,
    textures: HashMap<StringId, Texture>,
    materials: HashMap<StringId, Material>,
    models: HashMap<StringId, Model>,
    shaders: HashMap<StringId, Shader>,
    lights: Vec<PointLightInfo>,
    log: logging::Logger,
}

impl ResourceStore {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        arena_capacity: usize,
        log: L,
    ) -> ResourceStore {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "store")),
            None => logging::discard(),
        };

        ResourceStore {
            arena: StackArena::new(arena_capacity),
            textures: HashMap::new(),
            materials: HashMap::new(),
            models: HashMap::new(),
            shaders: HashMap::new(),
            lights: Vec::new(),
            log,
        }
    }

    /// Installs the built-in fallback textures a client store resolves
    /// missing references to: white diffuse, black specular, up-vector
    /// normal.
    pub fn install_default_textures(&mut self) {
        self.insert_texture(
            default_texture_id(TextureRole::Diffuse),
            TextureFormat::Rgba,
            &[0xff, 0xff, 0xff, 0xff],
        );
        self.insert_texture(
            default_texture_id(TextureRole::Specular),
            TextureFormat::Rgba,
            &[0x00, 0x00, 0x00, 0xff],
        );
        self.insert_texture(
            default_texture_id(TextureRole::Normal),
            TextureFormat::Rgba,
            &[0x80, 0x80, 0xff, 0xff],
        );
    }

    pub fn insert_texture(&mut self, id: StringId, format: TextureFormat, data: &[u8]) -> bool {
        if self.textures.contains_key(&id) {
            logging::warn!(self.log, "duplicate texture insert ignored"; "id" => id);
            return false;
        }

        let range = match self.arena.store(data) {
            Some(range) => range,
            None => {
                logging::error!(self.log, "arena exhausted storing texture";
                                "id" => id, "bytes" => data.len());
                return false;
            }
        };

        self.textures.insert(id, Texture { format, data: range });
        logging::debug!(self.log, "stored texture"; "id" => id, "bytes" => data.len());
        true
    }

    pub fn insert_material(&mut self, id: StringId, material: Material) -> bool {
        if self.materials.contains_key(&id) {
            logging::warn!(self.log, "duplicate material insert ignored"; "id" => id);
            return false;
        }

        for &tex in &[material.diffuse, material.specular, material.normal] {
            if tex != SID_NONE && !self.textures.contains_key(&tex) {
                logging::warn!(self.log, "material references unknown texture";
                               "material" => id, "texture" => tex);
            }
        }

        self.materials.insert(id, material);
        logging::debug!(self.log, "stored material"; "id" => id);
        true
    }

    /// Inserts a model together with its geometry bytes (server side). Every
    /// index must address a valid vertex.
    pub fn insert_model(
        &mut self,
        id: StringId,
        materials: Vec<StringId>,
        meshes: Vec<MeshInfo>,
        vertex_bytes: &[u8],
        index_bytes: &[u8],
    ) -> bool {
        if self.models.contains_key(&id) {
            logging::warn!(self.log, "duplicate model insert ignored"; "id" => id);
            return false;
        }

        assert_eq!(vertex_bytes.len() % VERTEX_SIZE, 0);
        assert_eq!(index_bytes.len() % INDEX_SIZE, 0);
        let n_vertices = (vertex_bytes.len() / VERTEX_SIZE) as u32;
        let n_indices = (index_bytes.len() / INDEX_SIZE) as u32;

        for raw in index_bytes.chunks_exact(INDEX_SIZE) {
            let index = LittleEndian::read_u32(raw);
            if index >= n_vertices {
                logging::error!(self.log, "model index out of range";
                                "id" => id, "index" => index, "n_vertices" => n_vertices);
                return false;
            }
        }

        let vertices = match self.arena.store(vertex_bytes) {
            Some(range) => range,
            None => {
                logging::error!(self.log, "arena exhausted storing model vertices"; "id" => id);
                return false;
            }
        };
        let indices = match self.arena.store(index_bytes) {
            Some(range) => range,
            None => {
                // Keep the arena consistent with the maps.
                self.arena.pop();
                logging::error!(self.log, "arena exhausted storing model indices"; "id" => id);
                return false;
            }
        };

        self.models.insert(
            id,
            Model {
                n_vertices,
                n_indices,
                materials,
                meshes,
                geometry: Some(ModelGeometry { vertices, indices }),
            },
        );
        logging::debug!(self.log, "stored model";
                        "id" => id, "vertices" => n_vertices, "indices" => n_indices);
        true
    }

    /// Inserts model metadata without geometry (client side).
    pub fn insert_model_info(
        &mut self,
        id: StringId,
        n_vertices: u32,
        n_indices: u32,
        materials: Vec<StringId>,
        meshes: Vec<MeshInfo>,
    ) -> bool {
        if self.models.contains_key(&id) {
            logging::warn!(self.log, "duplicate model insert ignored"; "id" => id);
            return false;
        }

        self.models.insert(
            id,
            Model {
                n_vertices,
                n_indices,
                materials,
                meshes,
                geometry: None,
            },
        );
        true
    }

    pub fn insert_shader(
        &mut self,
        id: StringId,
        stage: ShaderStage,
        pass_number: u8,
        code: &[u8],
    ) -> bool {
        if self.shaders.contains_key(&id) {
            logging::warn!(self.log, "duplicate shader insert ignored"; "id" => id);
            return false;
        }

        let range = match self.arena.store(code) {
            Some(range) => range,
            None => {
                logging::error!(self.log, "arena exhausted storing shader"; "id" => id);
                return false;
            }
        };

        self.shaders.insert(
            id,
            Shader {
                stage,
                pass_number,
                code: range,
            },
        );
        true
    }

    pub fn insert_point_light(&mut self, light: PointLightInfo) -> bool {
        if self.lights.iter().any(|existing| existing.name == light.name) {
            logging::warn!(self.log, "duplicate point light insert ignored"; "id" => light.name);
            return false;
        }

        logging::debug!(self.log, "stored point light"; "id" => light.name);
        self.lights.push(light);
        true
    }

    pub fn texture(&self, id: StringId) -> Option<&Texture> {
        self.textures.get(&id)
    }

    /// Texture lookup with the client's defaulting rule: a missing reference
    /// resolves to the role's built-in texture so rendering never blocks on
    /// an absent dependency.
    pub fn texture_or_default(&self, id: StringId, role: TextureRole) -> Option<&Texture> {
        self.textures
            .get(&id)
            .or_else(|| self.textures.get(&default_texture_id(role)))
    }

    pub fn texture_data(&self, texture: &Texture) -> &[u8] {
        self.arena.slice(&texture.data)
    }

    pub fn material(&self, id: StringId) -> Option<&Material> {
        self.materials.get(&id)
    }

    pub fn model(&self, id: StringId) -> Option<&Model> {
        self.models.get(&id)
    }

    pub fn shader(&self, id: StringId) -> Option<&Shader> {
        self.shaders.get(&id)
    }

    pub fn shader_code(&self, shader: &Shader) -> &[u8] {
        self.arena.slice(&shader.code)
    }

    pub fn light(&self, id: StringId) -> Option<&PointLightInfo> {
        self.lights.iter().find(|light| light.name == id)
    }

    pub fn light_mut(&mut self, id: StringId) -> Option<&mut PointLightInfo> {
        self.lights.iter_mut().find(|light| light.name == id)
    }

    pub fn lights(&self) -> &[PointLightInfo] {
        &self.lights
    }

    pub fn models(&self) -> impl Iterator<Item = (&StringId, &Model)> {
        self.models.iter()
    }

    pub fn shaders(&self) -> impl Iterator<Item = (&StringId, &Shader)> {
        self.shaders.iter()
    }

    /// Bytes of the model's vertex array (server side only).
    pub fn vertex_bytes(&self, id: StringId) -> Option<&[u8]> {
        let model = self.models.get(&id)?;
        let geometry = model.geometry.as_ref()?;
        Some(self.arena.slice(&geometry.vertices))
    }

    /// Bytes of the model's index array (server side only).
    pub fn index_bytes(&self, id: StringId) -> Option<&[u8]> {
        let model = self.models.get(&id)?;
        let geometry = model.geometry.as_ref()?;
        Some(self.arena.slice(&geometry.indices))
    }

    pub fn arena_used(&self) -> usize {
        self.arena.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sid;
    use crate::wire::geometry::Vertex;

    fn vertex_bytes(count: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..count {
            Vertex {
                pos: [i as f32, 0.0, 0.0],
                normal: [0.0, 1.0, 0.0],
                uv: [0.0, 0.0],
            }
            .encode(&mut bytes)
            .unwrap();
        }
        bytes
    }

    fn index_bytes(indices: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &index in indices {
            bytes.extend_from_slice(&index.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_texture_dedup() {
        let mut store = ResourceStore::new(1024, None);
        let id = sid("t.png");

        assert!(store.insert_texture(id, TextureFormat::Rgba, &[0xff; 16]));
        // Every further insert of the same id is a no-op.
        assert!(!store.insert_texture(id, TextureFormat::Rgba, &[0xff; 16]));
        assert!(!store.insert_texture(id, TextureFormat::Grey, &[0x00; 4]));

        let texture = store.texture(id).unwrap();
        assert_eq!(store.texture_data(texture), &[0xff; 16][..]);
        assert_eq!(texture.format, TextureFormat::Rgba);
    }

    #[test]
    fn test_model_roundtrip() {
        let mut store = ResourceStore::new(4096, None);
        let id = sid("quad");

        let vertices = vertex_bytes(4);
        let indices = index_bytes(&[0, 1, 2, 2, 3, 0]);

        assert!(store.insert_model(id, vec![sid("mat")], Vec::new(), &vertices, &indices));

        let model = store.model(id).unwrap();
        assert_eq!(model.n_vertices, 4);
        assert_eq!(model.n_indices, 6);
        assert_eq!(store.vertex_bytes(id).unwrap(), &vertices[..]);
        assert_eq!(store.index_bytes(id).unwrap(), &indices[..]);
    }

    #[test]
    fn test_model_rejects_out_of_range_index() {
        let mut store = ResourceStore::new(4096, None);

        let vertices = vertex_bytes(3);
        let indices = index_bytes(&[0, 1, 3]);

        assert!(!store.insert_model(sid("bad"), Vec::new(), Vec::new(), &vertices, &indices));
        assert!(store.model(sid("bad")).is_none());
    }

    #[test]
    fn test_texture_defaulting() {
        let mut store = ResourceStore::new(1024, None);
        store.install_default_textures();

        let missing = sid("not-sent-yet.png");
        assert!(store.texture(missing).is_none());

        let diffuse = store.texture_or_default(missing, TextureRole::Diffuse).unwrap();
        assert_eq!(store.texture_data(diffuse), &[0xff, 0xff, 0xff, 0xff][..]);

        let specular = store.texture_or_default(missing, TextureRole::Specular).unwrap();
        assert_eq!(store.texture_data(specular), &[0x00, 0x00, 0x00, 0xff][..]);

        let normal = store.texture_or_default(missing, TextureRole::Normal).unwrap();
        assert_eq!(store.texture_data(normal), &[0x80, 0x80, 0xff, 0xff][..]);
    }

    #[test]
    fn test_point_light_dedup_and_lookup() {
        let mut store = ResourceStore::new(64, None);
        let light = PointLightInfo {
            name: sid("lamp"),
            position: [0.0, 2.0, 0.0],
            color: [1.0, 0.9, 0.8],
            intensity: 3.0,
            dyn_mask: crate::wire::tcp::LIGHT_DYN_COLOR,
        };

        assert!(store.insert_point_light(light));
        assert!(!store.insert_point_light(light));

        assert_eq!(store.lights().len(), 1);
        assert_eq!(store.light(sid("lamp")).unwrap().intensity, 3.0);
    }

    #[test]
    fn test_arena_exhaustion_fails_insert() {
        let mut store = ResourceStore::new(8, None);

        assert!(!store.insert_texture(sid("big"), TextureFormat::Rgba, &[0u8; 64]));
        assert!(store.texture(sid("big")).is_none());
    }
}
