//! Edge adjacency of a mesh topology.
//!
//! Used to find silhouette edges without testing the visibility of every triangle.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::error::{FitError, Result};

/// An undirected mesh edge together with the triangles on either side of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The two vertices of the edge, smaller index first.
    pub vertices: [usize; 2],
    /// The triangle(s) adjacent to the edge. The second triangle is `None` for edges on the mesh
    /// boundary.
    pub faces: (usize, Option<usize>),
}

impl Edge {
    #[inline]
    pub fn is_boundary(&self) -> bool {
        self.faces.1.is_none()
    }

    #[inline]
    pub fn touches(&self, vertex: usize) -> bool {
        self.vertices.contains(&vertex)
    }
}

/// Precomputed edge-to-triangle adjacency of a model topology.
///
/// Like the rest of the model assets, an [`EdgeTopology`] is built once and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct EdgeTopology {
    edges: Vec<Edge>,
}

impl EdgeTopology {
    /// Creates an edge topology from a precomputed edge list.
    ///
    /// Validates the edges against a mesh with `vertex_count` vertices and `triangle_count`
    /// triangles.
    pub fn new(edges: Vec<Edge>, vertex_count: usize, triangle_count: usize) -> Result<Self> {
        for edge in &edges {
            let [a, b] = edge.vertices;
            if a >= vertex_count || b >= vertex_count || a == b {
                return Err(FitError::invalid(format!(
                    "edge {:?} is invalid for {vertex_count} vertices",
                    edge.vertices
                )));
            }
            let (f0, f1) = edge.faces;
            if f0 >= triangle_count || f1.map_or(false, |f1| f1 >= triangle_count || f1 == f0) {
                return Err(FitError::invalid(format!(
                    "edge {:?} has invalid adjacent faces {:?}",
                    edge.vertices, edge.faces
                )));
            }
        }
        Ok(Self { edges })
    }

    /// Computes the edge topology of a triangle list.
    ///
    /// Fails if an edge is shared by more than two triangles.
    pub fn from_triangles(triangles: &[[u32; 3]]) -> Result<Self> {
        let mut adjacency: BTreeMap<[usize; 2], Vec<usize>> = BTreeMap::new();
        for (face, tri) in triangles.iter().enumerate() {
            for (&a, &b) in tri.iter().circular_tuple_windows() {
                let (a, b) = (a as usize, b as usize);
                let key = if a < b { [a, b] } else { [b, a] };
                adjacency.entry(key).or_default().push(face);
            }
        }

        let edges = adjacency
            .into_iter()
            .map(|(vertices, faces)| match faces[..] {
                [f0] => Ok(Edge {
                    vertices,
                    faces: (f0, None),
                }),
                [f0, f1] => Ok(Edge {
                    vertices,
                    faces: (f0, Some(f1)),
                }),
                _ => Err(FitError::invalid(format!(
                    "edge {vertices:?} is shared by {} triangles",
                    faces.len()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        log::trace!(
            "built edge topology: {} edges, {} on the boundary",
            edges.len(),
            edges.iter().filter(|e| e.is_boundary()).count()
        );
        Ok(Self { edges })
    }

    #[inline]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
