//! Decomposed 3D transforms. Nodes keep position/rotation/scale separate and
//! bake the column-major matrix only when one crosses the wire.

use nalgebra_glm as glm;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: glm::Vec3,
    pub rotation: glm::Quat,
    pub scale: glm::Vec3,
}

impl Default for Transform {
    fn default() -> Transform {
        Transform {
            position: glm::vec3(0.0, 0.0, 0.0),
            rotation: glm::quat_identity(),
            scale: glm::vec3(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    #[inline]
    pub fn with_position(self, position: glm::Vec3) -> Transform {
        Transform { position, ..self }
    }

    #[inline]
    pub fn with_rotation(self, rotation: glm::Quat) -> Transform {
        Transform { rotation, ..self }
    }

    #[inline]
    pub fn with_scale(self, scale: glm::Vec3) -> Transform {
        Transform { scale, ..self }
    }

    /// Composes the transform as translation * rotation * scale.
    pub fn matrix(&self) -> glm::Mat4 {
        let translation = glm::translate(&glm::identity(), &self.position);
        let rotation = glm::quat_to_mat4(&self.rotation);
        let scale = glm::scale(&glm::identity(), &self.scale);

        translation * rotation * scale
    }

    /// Column-major float array, the layout every matrix uses on the wire.
    pub fn matrix_columns(&self) -> [f32; 16] {
        let mat = self.matrix();
        let mut out = [0.0f32; 16];
        out.copy_from_slice(mat.as_slice());
        out
    }
}
