//! Statistical shape model and expression blendshapes.
//!
//! Both are linear models over the flattened vertex vector `[x0, y0, z0, x1, y1, z1, ...]` of a
//! fixed mesh topology.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::{FitError, Result};
use crate::mesh::Mesh;

const ORTHONORMALITY_TOLERANCE: f32 = 1e-3;

/// A PCA shape model: mean shape, orthonormal basis and per-component standard deviations.
///
/// Shape coefficients are expressed in units of standard deviations, so a coefficient of `1.0`
/// moves the shape by one standard deviation along the corresponding basis vector. The instance
/// for a coefficient vector `c` is `mean + Σ basis_k · σ_k · c_k`.
///
/// The model also owns the triangle list and texture coordinates shared by every [`Mesh`]
/// generated from it.
#[derive(Debug, Clone)]
pub struct ShapeModel {
    mean: DVector<f32>,
    orthonormal_basis: DMatrix<f32>,
    /// `orthonormal_basis` with each column multiplied by its standard deviation.
    rescaled_basis: DMatrix<f32>,
    std_devs: DVector<f32>,
    triangles: Arc<[[u32; 3]]>,
    texcoords: Option<Arc<[[f32; 2]]>>,
}

impl ShapeModel {
    /// Creates a shape model.
    ///
    /// - `mean` has `3 * V` entries for `V` vertices.
    /// - `orthonormal_basis` is a `3V × K` matrix with orthonormal columns.
    /// - `std_devs` holds the `K` positive standard deviations of the components.
    /// - `triangles` index into the `V` vertices and are wound counter-clockwise when seen from
    ///   outside the surface.
    pub fn new(
        mean: DVector<f32>,
        orthonormal_basis: DMatrix<f32>,
        std_devs: DVector<f32>,
        triangles: Vec<[u32; 3]>,
    ) -> Result<Self> {
        if mean.is_empty() || mean.len() % 3 != 0 {
            return Err(FitError::invalid(format!(
                "mean shape length {} is not a positive multiple of 3",
                mean.len()
            )));
        }
        if orthonormal_basis.nrows() != mean.len() {
            return Err(FitError::invalid(format!(
                "shape basis has {} rows, expected {}",
                orthonormal_basis.nrows(),
                mean.len()
            )));
        }
        if std_devs.len() != orthonormal_basis.ncols() {
            return Err(FitError::invalid(format!(
                "{} standard deviations given for {} basis vectors",
                std_devs.len(),
                orthonormal_basis.ncols()
            )));
        }
        if let Some(sd) = std_devs.iter().find(|sd| !(sd.is_finite() && **sd > 0.0)) {
            return Err(FitError::invalid(format!(
                "standard deviations must be positive, got {sd}"
            )));
        }

        if !std_devs.is_empty() {
            let gram = orthonormal_basis.tr_mul(&orthonormal_basis);
            let deviation = (gram - DMatrix::identity(std_devs.len(), std_devs.len())).amax();
            if deviation > ORTHONORMALITY_TOLERANCE {
                return Err(FitError::invalid(format!(
                    "shape basis is not orthonormal (max deviation {deviation})"
                )));
            }
        }

        let vertex_count = mean.len() / 3;
        if let Some(tri) = triangles
            .iter()
            .find(|tri| tri.iter().any(|&v| v as usize >= vertex_count))
        {
            return Err(FitError::invalid(format!(
                "triangle {tri:?} refers to a vertex beyond the {vertex_count} model vertices"
            )));
        }

        let mut rescaled_basis = orthonormal_basis.clone();
        for (mut column, sd) in rescaled_basis.column_iter_mut().zip(std_devs.iter()) {
            column *= *sd;
        }

        Ok(Self {
            mean,
            orthonormal_basis,
            rescaled_basis,
            std_devs,
            triangles: triangles.into(),
            texcoords: None,
        })
    }

    /// Attaches per-vertex texture coordinates.
    ///
    /// Texture coordinates follow the image convention: `(0, 0)` is the top-left corner of the
    /// texture and `(1, 1)` the bottom-right one.
    pub fn with_texcoords(mut self, texcoords: Vec<[f32; 2]>) -> Result<Self> {
        if texcoords.len() != self.vertex_count() {
            return Err(FitError::invalid(format!(
                "{} texture coordinates given for {} vertices",
                texcoords.len(),
                self.vertex_count()
            )));
        }
        self.texcoords = Some(texcoords.into());
        Ok(self)
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.mean.len() / 3
    }

    /// Returns the number of principal components `K`.
    #[inline]
    pub fn num_components(&self) -> usize {
        self.std_devs.len()
    }

    #[inline]
    pub fn mean(&self) -> &DVector<f32> {
        &self.mean
    }

    #[inline]
    pub fn orthonormal_basis(&self) -> &DMatrix<f32> {
        &self.orthonormal_basis
    }

    /// Returns the basis with every column scaled by its standard deviation.
    #[inline]
    pub fn rescaled_basis(&self) -> &DMatrix<f32> {
        &self.rescaled_basis
    }

    #[inline]
    pub fn std_devs(&self) -> &DVector<f32> {
        &self.std_devs
    }

    #[inline]
    pub fn triangles(&self) -> &Arc<[[u32; 3]]> {
        &self.triangles
    }

    #[inline]
    pub fn texcoords(&self) -> Option<&Arc<[[f32; 2]]>> {
        self.texcoords.as_ref()
    }

    /// Returns the position of `vertex` in the mean shape.
    pub fn mean_vertex(&self, vertex: usize) -> Vector3<f32> {
        self.mean.fixed_rows::<3>(vertex * 3).into_owned()
    }

    /// Computes the flattened shape vector for the given coefficients.
    ///
    /// Fewer coefficients than components may be given; the missing ones are treated as zero.
    ///
    /// # Panics
    ///
    /// Panics if more coefficients than components are passed.
    pub fn draw_sample(&self, coefficients: &[f32]) -> DVector<f32> {
        assert!(
            coefficients.len() <= self.num_components(),
            "{} shape coefficients given for {} components",
            coefficients.len(),
            self.num_components()
        );
        let mut shape = self.mean.clone();
        for (k, &c) in coefficients.iter().enumerate() {
            if c != 0.0 {
                shape.axpy(c, &self.rescaled_basis.column(k), 1.0);
            }
        }
        shape
    }

    /// Returns the mean shape as a [`Mesh`].
    pub fn mean_mesh(&self) -> Mesh {
        Mesh::from_shape(self, &self.mean)
    }
}

/// A named expression offset, added to a base shape scaled by its coefficient.
#[derive(Debug, Clone)]
pub struct Blendshape {
    pub name: String,
    /// Per-vertex offsets, flattened like the shape vectors of the [`ShapeModel`].
    pub deformation: DVector<f32>,
}

/// An ordered set of blendshapes sharing the vertex layout of a [`ShapeModel`].
///
/// The set may be empty, in which case expression fitting is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Blendshapes {
    shapes: Vec<Blendshape>,
}

impl Blendshapes {
    /// Creates a blendshape set, checking that all deformations have the same length.
    pub fn new(shapes: Vec<Blendshape>) -> Result<Self> {
        if let Some(first) = shapes.first() {
            let expected = first.deformation.len();
            if expected % 3 != 0 {
                return Err(FitError::invalid(format!(
                    "blendshape '{}' length {expected} is not a multiple of 3",
                    first.name
                )));
            }
            if let Some(shape) = shapes.iter().find(|s| s.deformation.len() != expected) {
                return Err(FitError::BlendshapeLength {
                    name: shape.name.clone(),
                    len: shape.deformation.len(),
                    expected,
                });
            }
        }
        Ok(Self { shapes })
    }

    /// Checks that every deformation matches a model with `vertex_count` vertices.
    pub fn check_vertex_count(&self, vertex_count: usize) -> Result<()> {
        match self
            .shapes
            .iter()
            .find(|s| s.deformation.len() != vertex_count * 3)
        {
            Some(shape) => Err(FitError::BlendshapeLength {
                name: shape.name.clone(),
                len: shape.deformation.len(),
                expected: vertex_count * 3,
            }),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blendshape> + '_ {
        self.shapes.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Blendshape> {
        self.shapes.get(index)
    }

    /// Returns the offset of `vertex` in blendshape `index`.
    pub fn vertex_offset(&self, index: usize, vertex: usize) -> Vector3<f32> {
        self.shapes[index]
            .deformation
            .fixed_rows::<3>(vertex * 3)
            .into_owned()
    }

    /// Adds the weighted blendshape offsets to `base`.
    ///
    /// # Panics
    ///
    /// Panics if `coefficients` does not have one entry per blendshape, or if `base` has a
    /// different length than the deformations.
    pub fn apply(&self, base: &DVector<f32>, coefficients: &[f32]) -> DVector<f32> {
        assert_eq!(
            coefficients.len(),
            self.len(),
            "expected one coefficient per blendshape"
        );
        let mut shape = base.clone();
        for (blendshape, &w) in self.shapes.iter().zip(coefficients) {
            if w != 0.0 {
                shape.axpy(w, &blendshape.deformation, 1.0);
            }
        }
        shape
    }
}
