//! Triangle meshes generated from a [`ShapeModel`].

use std::sync::Arc;

use nalgebra::{DVector, Point3, Vector3};

use crate::model::ShapeModel;

/// A triangle mesh instance of a [`ShapeModel`].
///
/// Vertex positions are owned by the mesh. The triangle list and texture coordinates belong to the
/// model topology and are shared with every other mesh of the same model.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    vertices: Vec<Point3<f32>>,
    triangles: Arc<[[u32; 3]]>,
    texcoords: Option<Arc<[[f32; 2]]>>,
}

impl Mesh {
    /// Creates a mesh from raw parts.
    ///
    /// # Panics
    ///
    /// Panics if a triangle refers to a vertex outside of `vertices`, or if texture coordinates are
    /// given but their count differs from the vertex count.
    pub fn new(
        vertices: Vec<Point3<f32>>,
        triangles: Arc<[[u32; 3]]>,
        texcoords: Option<Arc<[[f32; 2]]>>,
    ) -> Self {
        assert!(
            triangles
                .iter()
                .flatten()
                .all(|&v| (v as usize) < vertices.len()),
            "triangle index out of range"
        );
        if let Some(tc) = &texcoords {
            assert_eq!(tc.len(), vertices.len(), "texture coordinate count mismatch");
        }
        Self {
            vertices,
            triangles,
            texcoords,
        }
    }

    /// Builds a mesh of `model`'s topology from a flattened shape vector.
    ///
    /// # Panics
    ///
    /// Panics if `shape` does not have `3 * model.vertex_count()` entries.
    pub fn from_shape(model: &ShapeModel, shape: &DVector<f32>) -> Self {
        assert_eq!(
            shape.len(),
            model.vertex_count() * 3,
            "shape vector does not match the model"
        );
        let vertices = shape
            .as_slice()
            .chunks_exact(3)
            .map(|c| Point3::new(c[0], c[1], c[2]))
            .collect();
        Self {
            vertices,
            triangles: model.triangles().clone(),
            texcoords: model.texcoords().cloned(),
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn vertices(&self) -> &[Point3<f32>] {
        &self.vertices
    }

    #[inline]
    pub fn vertex(&self, index: usize) -> Point3<f32> {
        self.vertices[index]
    }

    #[inline]
    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    #[inline]
    pub fn texcoords(&self) -> Option<&[[f32; 2]]> {
        self.texcoords.as_deref()
    }

    /// Returns the three corner positions of triangle `index`.
    pub fn triangle_vertices(&self, index: usize) -> [Point3<f32>; 3] {
        self.triangles[index].map(|v| self.vertices[v as usize])
    }

    /// Returns the (unnormalized) normal of triangle `index`.
    ///
    /// The normal points out of the surface for counter-clockwise triangles. Its length is twice
    /// the triangle's area.
    pub fn face_normal(&self, index: usize) -> Vector3<f32> {
        let [a, b, c] = self.triangle_vertices(index);
        (b - a).cross(&(c - a))
    }

    /// Returns the centroid of triangle `index`.
    pub fn face_centroid(&self, index: usize) -> Point3<f32> {
        let [a, b, c] = self.triangle_vertices(index);
        Point3::from((a.coords + b.coords + c.coords) / 3.0)
    }

    /// Returns the flattened `[x0, y0, z0, x1, ...]` shape vector of this mesh.
    pub fn to_shape_vector(&self) -> DVector<f32> {
        DVector::from_iterator(
            self.vertices.len() * 3,
            self.vertices.iter().flat_map(|p| [p.x, p.y, p.z]),
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn normals_follow_winding() {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let ccw = Mesh::new(vertices.clone(), Arc::from(vec![[0, 1, 2]]), None);
        assert_relative_eq!(ccw.face_normal(0), Vector3::new(0.0, 0.0, 1.0));

        let cw = Mesh::new(vertices, Arc::from(vec![[0, 2, 1]]), None);
        assert_relative_eq!(cw.face_normal(0), Vector3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(cw.face_centroid(0), Point3::new(1.0 / 3.0, 1.0 / 3.0, 0.0));
    }

    #[test]
    fn shape_vector_round_trip() {
        let shape = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let model = ShapeModel::new(
            shape.clone(),
            nalgebra::DMatrix::zeros(9, 0),
            DVector::zeros(0),
            vec![[0, 1, 2]],
        )
        .unwrap();
        let mesh = Mesh::from_shape(&model, &shape);
        assert_eq!(mesh.vertex(1), Point3::new(4.0, 5.0, 6.0));
        assert_eq!(mesh.to_shape_vector(), shape);
    }

    #[test]
    #[should_panic]
    fn rejects_out_of_range_triangles() {
        Mesh::new(vec![Point3::origin()], Arc::from(vec![[0, 0, 1]]), None);
    }
}
