//! Regularized linear least-squares fitting of model coefficients.
//!
//! Shape and expression coefficients are found the same way: every correspondence contributes two
//! linearized projection equations (see [`CameraParameters::linearize`]), and the coefficients
//! minimize
//!
//! ```text
//! Σ ‖project(base_v + B_v·c) − observed_v‖² / σ² + λ·‖c‖²
//! ```
//!
//! where `B_v` is the 3-row block of the basis belonging to vertex `v`, and `σ` is the expected
//! landmark detection error in pixels.

use nalgebra::{DMatrix, DVector, Matrix3xX, Point3};

use crate::{
    camera::CameraParameters,
    error::{FitError, FitStep, Result},
    landmark::Correspondence,
    model::{Blendshapes, ShapeModel},
};

/// A linear model over per-vertex positions, whose coefficients can be fitted.
pub trait LinearBasis {
    /// Returns the number of coefficients of the model.
    fn num_coefficients(&self) -> usize;

    /// Returns the `3 × K` block describing how each coefficient moves `vertex`.
    fn vertex_block(&self, vertex: usize) -> Matrix3xX<f32>;
}

impl LinearBasis for ShapeModel {
    fn num_coefficients(&self) -> usize {
        self.num_components()
    }

    /// Uses the rescaled basis, so that coefficients are in units of standard deviations.
    fn vertex_block(&self, vertex: usize) -> Matrix3xX<f32> {
        self.rescaled_basis().fixed_rows::<3>(vertex * 3).into_owned()
    }
}

impl LinearBasis for Blendshapes {
    fn num_coefficients(&self) -> usize {
        self.len()
    }

    fn vertex_block(&self, vertex: usize) -> Matrix3xX<f32> {
        Matrix3xX::from_fn(self.len(), |row, k| self.vertex_offset(k, vertex)[row])
    }
}

/// Weighting of the least-squares problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regularization {
    /// Weight `λ` of the squared coefficient norm. May be zero for an unregularized solve.
    pub lambda: f32,
    /// Expected standard deviation `σ` of the landmark positions, in pixels.
    pub landmark_std_dev: f32,
}

/// Fits the coefficients of `basis` with everything else held fixed.
///
/// `base` is the flattened shape the basis is added to; it contains the mean shape and the
/// contribution of any other linear model (e.g. the expressions when fitting the shape). For
/// perspective cameras, the projection is linearized around the vertices of `base`.
///
/// Returns [`FitError::SingularSystem`] (attributed to `step`) if the normal equations cannot be
/// solved, which may happen when `λ` is zero and the correspondences do not determine all
/// coefficients.
///
/// # Panics
///
/// Panics if a correspondence refers to a vertex outside of `base`.
pub fn fit_coefficients<B: LinearBasis + ?Sized>(
    basis: &B,
    base: &DVector<f32>,
    camera: &CameraParameters,
    correspondences: &[Correspondence],
    regularization: Regularization,
    step: FitStep,
) -> Result<DVector<f32>> {
    let k = basis.num_coefficients();
    if k == 0 {
        return Ok(DVector::zeros(0));
    }
    let singular = || FitError::SingularSystem { step, unknowns: k };
    let lambda = f64::from(regularization.lambda);
    if lambda == 0.0 && correspondences.len() * 2 < k {
        return Err(singular());
    }

    // Each equation reads `j · c + r0 = 0`.
    let rows = correspondences.len() * 2;
    let mut jacobian = DMatrix::<f64>::zeros(rows, k);
    let mut r0 = DVector::<f64>::zeros(rows);
    for (i, corr) in correspondences.iter().enumerate() {
        let v = corr.vertex;
        let base_v = base.fixed_rows::<3>(v * 3).into_owned();
        let block = basis.vertex_block(v).cast::<f64>();
        let equations = camera.linearize(&Point3::from(base_v), &corr.image_point);
        for (j, eq) in equations.iter().enumerate() {
            let row = 2 * i + j;
            jacobian
                .row_mut(row)
                .copy_from(&(eq.coefficients.transpose() * &block));
            r0[row] = eq.residual(&base_v.cast::<f64>());
        }
    }

    let weight = 1.0 / f64::from(regularization.landmark_std_dev).powi(2);
    let mut lhs = jacobian.tr_mul(&jacobian) * weight;
    for d in 0..k {
        lhs[(d, d)] += lambda;
    }
    let rhs = -jacobian.tr_mul(&r0) * weight;

    let coefficients = lhs.cholesky().ok_or_else(singular)?.solve(&rhs);
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(singular());
    }
    log::trace!(
        "{step}: {} coefficients from {} correspondences, |c|={:.3}",
        k,
        correspondences.len(),
        coefficients.norm()
    );
    Ok(coefficients.cast())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{Point2, UnitQuaternion, Vector2, Vector3};

    use crate::model::Blendshape;

    use super::*;

    /// Tetrahedron-like model with two components: vertex 0 along X (σ = 2) and vertex 1 along Y
    /// (σ = 1).
    fn model() -> ShapeModel {
        let mean = DVector::from_vec(vec![
            0.0, 0.0, 0.0, //
            10.0, 0.0, 0.0, //
            0.0, 10.0, 0.0, //
            0.0, 0.0, 10.0,
        ]);
        let mut basis = DMatrix::zeros(12, 2);
        basis[(0, 0)] = 1.0;
        basis[(4, 1)] = 1.0;
        ShapeModel::new(
            mean,
            basis,
            DVector::from_vec(vec![2.0, 1.0]),
            vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]],
        )
        .unwrap()
    }

    fn observe(cam: &CameraParameters, shape: &DVector<f32>) -> Vec<Correspondence> {
        (0..shape.len() / 3)
            .map(|v| Correspondence {
                vertex: v,
                image_point: cam.project(&Point3::from(shape.fixed_rows::<3>(v * 3).into_owned())),
            })
            .collect()
    }

    fn cameras() -> [CameraParameters; 2] {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.3);
        [
            CameraParameters::orthographic(rot, Vector2::new(20.0, 30.0), 3.0, 200, 200),
            CameraParameters::perspective(rot, Vector3::new(1.0, 2.0, -60.0), 400.0, 200, 200),
        ]
    }

    const UNREGULARIZED: Regularization = Regularization {
        lambda: 0.0,
        landmark_std_dev: 1.0,
    };

    #[test]
    fn recovers_shape_coefficients() {
        let model = model();
        let truth = [1.5, -0.5];
        let shape = model.draw_sample(&truth);
        for cam in cameras() {
            let coeffs = fit_coefficients(
                &model,
                model.mean(),
                &cam,
                &observe(&cam, &shape),
                UNREGULARIZED,
                FitStep::Shape,
            )
            .unwrap();
            assert_relative_eq!(coeffs[0], truth[0], epsilon = 1e-3);
            assert_relative_eq!(coeffs[1], truth[1], epsilon = 1e-3);
        }
    }

    #[test]
    fn regularization_limits() {
        let model = model();
        let cam = cameras()[0];
        let corr = observe(&cam, &model.draw_sample(&[1.5, -0.5]));
        let fit = |lambda| {
            fit_coefficients(
                &model,
                model.mean(),
                &cam,
                &corr,
                Regularization {
                    lambda,
                    landmark_std_dev: 3f32.sqrt(),
                },
                FitStep::Shape,
            )
            .unwrap()
        };

        let strong = fit(1e9);
        assert!(strong.norm() < 1e-4, "{strong}");

        // Tiny regularization matches the unregularized solution.
        let weak = fit(1e-6);
        assert_relative_eq!(weak[0], 1.5, epsilon = 1e-3);
        assert_relative_eq!(weak[1], -0.5, epsilon = 1e-3);

        // Moderate regularization shrinks towards zero.
        let moderate = fit(10.0);
        assert!(moderate.norm() < weak.norm());
    }

    #[test]
    fn underdetermined_unregularized_system_is_singular() {
        let model = model();
        let cam = cameras()[0];
        // Vertex 2 does not move with any coefficient.
        let corr = vec![Correspondence {
            vertex: 2,
            image_point: Point2::new(10.0, 10.0),
        }];
        let err = fit_coefficients(&model, model.mean(), &cam, &corr, UNREGULARIZED, FitStep::Shape)
            .unwrap_err();
        assert!(matches!(
            err,
            FitError::SingularSystem {
                step: FitStep::Shape,
                unknowns: 2
            }
        ));

        // Regularization makes it solvable again, with all coefficients at zero.
        let coeffs = fit_coefficients(
            &model,
            model.mean(),
            &cam,
            &corr,
            Regularization {
                lambda: 1.0,
                landmark_std_dev: 1.0,
            },
            FitStep::Shape,
        )
        .unwrap();
        assert_relative_eq!(coeffs.norm(), 0.0);
    }

    #[test]
    fn recovers_expression_coefficients() {
        let model = model();
        let mut lift = DVector::zeros(12);
        lift[11] = 1.0;
        let mut widen = DVector::zeros(12);
        widen[3] = 1.0;
        widen[6] = -0.5;
        let blendshapes = Blendshapes::new(vec![
            Blendshape {
                name: "lift".into(),
                deformation: lift,
            },
            Blendshape {
                name: "widen".into(),
                deformation: widen,
            },
        ])
        .unwrap();

        // Shape coefficients are held fixed and part of the base.
        let base = model.draw_sample(&[0.5, 0.5]);
        let shape = blendshapes.apply(&base, &[2.0, -1.0]);
        for cam in cameras() {
            let coeffs = fit_coefficients(
                &blendshapes,
                &base,
                &cam,
                &observe(&cam, &shape),
                UNREGULARIZED,
                FitStep::Expression,
            )
            .unwrap();
            assert_relative_eq!(coeffs[0], 2.0, epsilon = 1e-3);
            assert_relative_eq!(coeffs[1], -1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn empty_basis_is_a_no_op() {
        let model = model();
        let coeffs = fit_coefficients(
            &Blendshapes::default(),
            model.mean(),
            &cameras()[0],
            &[],
            UNREGULARIZED,
            FitStep::Expression,
        )
        .unwrap();
        assert!(coeffs.is_empty());
    }
}
