//! The scene graph, kept deliberately flat: an ordered node list keyed by
//! stable id, with parent links and decomposed transforms. The scene owns no
//! resources; nodes reference them by id.

use crate::hashing::{sid, StringId};
use crate::logging;
use crate::transform::Transform;
use hashbrown::HashMap;
use nalgebra_glm as glm;

/// Nodes flagged static never emit transform updates; their placement is
/// baked in at model admission.
pub const NODE_STATIC: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NodeType {
    Empty,
    Model,
    PointLight,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: StringId,
    pub node_type: NodeType,
    pub transform: Transform,
    pub parent: Option<StringId>,
    pub flags: u8,
    dirty: bool,
}

impl Node {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags & NODE_STATIC != 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

pub struct Scene {
    nodes: Vec<Node>,
    index: HashMap<StringId, usize>,
    root: StringId,
    log: logging::Logger,
}

impl Scene {
    /// Creates the scene with its single root node.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Scene {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "scene")),
            None => logging::discard(),
        };

        let root = sid("__root");
        let mut scene = Scene {
            nodes: Vec::new(),
            index: HashMap::new(),
            root,
            log,
        };

        scene.nodes.push(Node {
            id: root,
            node_type: NodeType::Empty,
            transform: Transform::default(),
            parent: None,
            flags: NODE_STATIC,
            dirty: false,
        });
        scene.index.insert(root, 0);

        scene
    }

    #[inline]
    pub fn root_id(&self) -> StringId {
        self.root
    }

    /// Adds a node under the root. Duplicate ids are a warned no-op.
    pub fn add_node(&mut self, id: StringId, node_type: NodeType, transform: Transform) -> bool {
        self.add_node_with_parent(id, node_type, transform, self.root, 0)
    }

    pub fn add_node_with_parent(
        &mut self,
        id: StringId,
        node_type: NodeType,
        transform: Transform,
        parent: StringId,
        flags: u8,
    ) -> bool {
        if self.index.contains_key(&id) {
            logging::warn!(self.log, "duplicate node insert ignored"; "id" => id);
            return false;
        }
        if !self.index.contains_key(&parent) {
            logging::warn!(self.log, "node parent does not exist"; "id" => id, "parent" => parent);
            return false;
        }

        self.index.insert(id, self.nodes.len());
        self.nodes.push(Node {
            id,
            node_type,
            transform,
            parent: Some(parent),
            flags,
            dirty: false,
        });

        logging::debug!(self.log, "node added"; "id" => id, "type" => ?node_type);
        true
    }

    /// Removes a node. The root cannot be removed; children of the removed
    /// node are reparented to the root.
    pub fn remove(&mut self, id: StringId) -> bool {
        if id == self.root || !self.index.contains_key(&id) {
            return false;
        }

        self.nodes.retain(|node| node.id != id);
        self.index.clear();
        for (position, node) in self.nodes.iter().enumerate() {
            self.index.insert(node.id, position);
        }

        let root = self.root;
        for node in self.nodes.iter_mut() {
            if node.parent == Some(id) {
                node.parent = Some(root);
            }
        }

        logging::debug!(self.log, "node removed"; "id" => id);
        true
    }

    pub fn get(&self, id: StringId) -> Option<&Node> {
        self.index.get(&id).map(|&position| &self.nodes[position])
    }

    pub fn get_mut(&mut self, id: StringId) -> Option<&mut Node> {
        let position = *self.index.get(&id)?;
        Some(&mut self.nodes[position])
    }

    /// Replaces a node's transform and marks it dirty. Returns true when a
    /// transform update should be emitted for it, which is exactly when the
    /// node exists and is not static.
    pub fn set_transform(&mut self, id: StringId, transform: Transform) -> bool {
        let node = match self.get_mut(id) {
            Some(node) => node,
            None => {
                return false;
            }
        };

        node.transform = transform;
        node.dirty = true;

        !node.is_static()
    }

    pub fn clear_dirty(&mut self, id: StringId) {
        if let Some(node) = self.get_mut(id) {
            node.dirty = false;
        }
    }

    /// Composes the node's transform with its ancestors, child into parent.
    pub fn world_matrix(&self, id: StringId) -> Option<glm::Mat4> {
        let mut matrix = self.get(id)?.transform.matrix();
        let mut current = self.get(id)?.parent;

        while let Some(parent_id) = current {
            let parent = self.get(parent_id)?;
            matrix = parent.transform.matrix() * matrix;
            current = parent.parent;
        }

        Some(matrix)
    }

    /// Nodes in insertion order, root first.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
