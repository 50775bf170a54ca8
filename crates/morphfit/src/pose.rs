//! Camera pose estimation from 3D-2D point correspondences.
//!
//! The orthographic estimator and the perspective estimator with unknown focal length are linear
//! and closed-form. With a known focal length, the linear perspective estimate is refined
//! iteratively. All computations happen in `f64`, since the least-squares systems involved are
//! poorly conditioned in single precision.

use nalgebra::{
    DMatrix, Matrix2x3, Matrix3, Matrix3x4, Matrix4, Matrix6, Point2, Point3, Rotation3,
    UnitQuaternion, Vector2, Vector3, Vector6,
};

use crate::{
    camera::{focal_length_from_fov, CameraParameters, ProjectionModel},
    error::{FitError, FitStep, Result},
    iter::zip_exact,
};

/// Minimum number of correspondences for the scaled orthographic estimator.
pub const MIN_ORTHOGRAPHIC_POINTS: usize = 4;
/// Minimum number of correspondences for the perspective (DLT) estimator.
pub const MIN_PERSPECTIVE_POINTS: usize = 6;

/// Singular values below this fraction of the largest one are treated as zero by the solvers.
const RANK_TOLERANCE: f64 = 1e-9;

/// Point sets whose smallest extent is below this fraction of their largest one are treated as
/// degenerate. Inputs are `f32`, so anything flatter than that is indistinguishable from rounding
/// noise.
const DEGENERACY_TOLERANCE: f64 = 1e-5;

/// Iteration limit of the pose refinement for a known focal length.
const MAX_REFINE_ITERATIONS: usize = 100;

/// Estimates a camera with the given projection model.
///
/// For perspective cameras, `fov_y` fixes the vertical field of view (in degrees). Without it,
/// the focal length is estimated along with the pose.
pub fn estimate_camera(
    model_points: &[Point3<f32>],
    image_points: &[Point2<f32>],
    image_size: (u32, u32),
    projection: ProjectionModel,
    fov_y: Option<f32>,
) -> Result<CameraParameters> {
    let (width, height) = image_size;
    match projection {
        ProjectionModel::Orthographic => {
            estimate_orthographic(model_points, image_points, width, height)
        }
        ProjectionModel::Perspective => {
            let focal_length = fov_y.map(|fov| focal_length_from_fov(fov, height));
            estimate_perspective(model_points, image_points, width, height, focal_length)
        }
    }
}

/// Estimates a scaled orthographic camera using the "Gold Standard" affine camera algorithm.
///
/// The affine camera matrix is found by linear least squares and then projected onto the closest
/// scaled orthographic camera (see [`orthonormalize_affine`]).
///
/// Requires at least 4 correspondences whose model points are not coplanar.
///
/// # Panics
///
/// Panics if `model_points` and `image_points` have different lengths.
pub fn estimate_orthographic(
    model_points: &[Point3<f32>],
    image_points: &[Point2<f32>],
    image_width: u32,
    image_height: u32,
) -> Result<CameraParameters> {
    let n = model_points.len();
    let insufficient = || FitError::InsufficientConstraints {
        step: FitStep::Pose,
        correspondences: n,
        required: MIN_ORTHOGRAPHIC_POINTS,
    };
    if n < MIN_ORTHOGRAPHIC_POINTS {
        return Err(insufficient());
    }

    // Both image axes share the same design matrix `[X Y Z 1]`. Image Y is flipped so that both
    // rows of the affine camera use the model's Y-up convention.
    let h = f64::from(image_height);
    let mut a = DMatrix::<f64>::zeros(n, 4);
    let mut b = DMatrix::<f64>::zeros(n, 2);
    for (i, (p, q)) in zip_exact(model_points, image_points).enumerate() {
        let p = p.cast::<f64>();
        a[(i, 0)] = p.x;
        a[(i, 1)] = p.y;
        a[(i, 2)] = p.z;
        a[(i, 3)] = 1.0;
        b[(i, 0)] = f64::from(q.x);
        b[(i, 1)] = h - f64::from(q.y);
    }

    let points = model_points
        .iter()
        .map(|p| p.coords.cast::<f64>())
        .collect::<Vec<_>>();
    if !spans_volume(&points) {
        return Err(insufficient());
    }

    let svd = a.svd(true, true);
    let max = svd.singular_values.max();
    log::trace!("orthographic design matrix singular values: {}", svd.singular_values);
    let k = svd
        .solve(&b, max * RANK_TOLERANCE)
        .map_err(|_| insufficient())?;

    #[rustfmt::skip]
    let affine = Matrix2x3::new(
        k[(0, 0)], k[(1, 0)], k[(2, 0)],
        k[(0, 1)], k[(1, 1)], k[(2, 1)],
    );
    let (rotation, scale) = orthonormalize_affine(&affine).ok_or_else(insufficient)?;
    let (n1, n2) = (affine.row(0).norm(), affine.row(1).norm());
    if (n1 - n2).abs() > 0.25 * n1.max(n2) {
        log::warn!("affine camera is far from orthonormal (row norms {n1:.3} and {n2:.3})");
    }
    let translation = Vector2::new(k[(3, 0)] / scale, k[(3, 1)] / scale);
    log::trace!("orthographic pose: scale={scale}, t={translation:?}, R={rotation}");

    Ok(CameraParameters::orthographic(
        to_unit_quaternion(&rotation),
        translation.cast(),
        scale as f32,
        image_width,
        image_height,
    ))
}

/// Splits the linear part of an affine camera into a rotation and an isotropic scale.
///
/// The scale is the mean norm of the two rows. The normalized rows and their cross product are
/// then replaced by the closest rotation matrix in the Frobenius norm, which corrects for rows that
/// are not exactly orthogonal.
///
/// Returns `None` if either row is (close to) zero or the rows are (close to) parallel, in which
/// case no meaningful rotation can be recovered.
pub fn orthonormalize_affine(affine: &Matrix2x3<f64>) -> Option<(Rotation3<f64>, f64)> {
    let r1 = affine.row(0).transpose();
    let r2 = affine.row(1).transpose();
    let (n1, n2) = (r1.norm(), r2.norm());
    if !(n1 > f64::EPSILON && n2 > f64::EPSILON) {
        return None;
    }
    let scale = (n1 + n2) / 2.0;
    let (r1, r2) = (r1 / n1, r2 / n2);
    let r3 = r1.cross(&r2);
    if r3.norm() < 1e-6 {
        return None;
    }

    let m = Matrix3::from_rows(&[r1.transpose(), r2.transpose(), r3.transpose()]);
    Some((nearest_rotation(&m), scale))
}

/// Returns the rotation matrix closest to `m` in the Frobenius norm.
///
/// Computed as `U·Vᵀ` from the singular value decomposition of `m`. If that would be a reflection,
/// the singular vector belonging to the smallest singular value is flipped.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        // Only happens for non-finite input.
        return Rotation3::identity();
    };
    if (u * v_t).determinant() < 0.0 {
        let smallest = svd.singular_values.imin();
        u.column_mut(smallest).neg_mut();
    }
    Rotation3::from_matrix_unchecked(u * v_t)
}

/// Estimates a perspective camera with the Direct Linear Transform.
///
/// The principal point is assumed to be at the image center and pixels are assumed to be square.
/// If `focal_length` is `None`, it is estimated from the camera matrix. Otherwise, the image points
/// are normalized by the known intrinsics, the DLT only recovers `[R | t]`, and the pose is then
/// refined to minimize the reprojection error for that focal length.
///
/// Requires at least 6 correspondences in general position (not all coplanar).
///
/// # Panics
///
/// Panics if `model_points` and `image_points` have different lengths.
pub fn estimate_perspective(
    model_points: &[Point3<f32>],
    image_points: &[Point2<f32>],
    image_width: u32,
    image_height: u32,
    focal_length: Option<f32>,
) -> Result<CameraParameters> {
    let n = model_points.len();
    let insufficient = || FitError::InsufficientConstraints {
        step: FitStep::Pose,
        correspondences: n,
        required: MIN_PERSPECTIVE_POINTS,
    };
    if n < MIN_PERSPECTIVE_POINTS {
        return Err(insufficient());
    }

    let points = model_points
        .iter()
        .map(|p| p.coords.cast::<f64>())
        .collect::<Vec<_>>();
    if !spans_volume(&points) {
        return Err(insufficient());
    }

    // Image points relative to the principal point, Y up, in units of the focal length if it is
    // known.
    let (cx, cy) = (f64::from(image_width) / 2.0, f64::from(image_height) / 2.0);
    let unit = focal_length.map_or(1.0, f64::from);
    let centered = zip_exact(model_points, image_points)
        .map(|(_, q)| Vector2::new(f64::from(q.x) - cx, cy - f64::from(q.y)) / unit)
        .collect::<Vec<_>>();

    let p = solve_dlt(&points, &centered).ok_or_else(insufficient)?;
    let m1 = p.fixed_view::<1, 3>(0, 0).transpose();
    let m2 = p.fixed_view::<1, 3>(1, 0).transpose();
    let m3 = p.fixed_view::<1, 3>(2, 0).transpose();
    if !(m3.norm() > f64::EPSILON) {
        return Err(insufficient());
    }

    let (f, rotation, translation) = match focal_length {
        None => {
            let f = (m1.norm() + m2.norm()) / (2.0 * m3.norm());
            if !(f.is_finite() && f > 0.0) {
                return Err(insufficient());
            }

            // `P = λ·[f·r1 | f·tx; f·r2 | f·ty; -r3 | -tz]` for some positive `λ`.
            let rows = [m1 / f, m2 / f, -m3];
            let lambda = rows.iter().map(|r| r.norm()).sum::<f64>() / 3.0;
            let m = Matrix3::from_rows(&rows.map(|r| r.transpose() / lambda));
            let rotation = nearest_rotation(&m);
            let translation = Vector3::new(p[(0, 3)] / f, p[(1, 3)] / f, -p[(2, 3)]) / lambda;
            (f, rotation, translation)
        }
        Some(f) => {
            let f = f64::from(f);
            if !(f.is_finite() && f > 0.0) {
                return Err(insufficient());
            }

            // `P = λ·[r1 | tx; r2 | ty; -r3 | -tz]`. Only the rotation is taken from it, the
            // translation is re-solved for the orthonormalized rotation.
            let m = Matrix3::from_rows(&[m1.transpose(), m2.transpose(), -m3.transpose()]);
            let rotation = nearest_rotation(&m);
            let translation =
                solve_translation(&points, &centered, &rotation).ok_or_else(insufficient)?;
            refine_pose(&points, &centered, f, rotation, translation)
                .map(|(rotation, translation)| (f, rotation, translation))
                .ok_or_else(insufficient)?
        }
    };
    log::trace!("perspective pose: f={f}, t={translation:?}, R={rotation}");

    Ok(CameraParameters::perspective(
        to_unit_quaternion(&rotation),
        translation.cast(),
        f as f32,
        image_width,
        image_height,
    ))
}

/// Returns whether `points` extend into all three dimensions.
///
/// The extents are the singular values of the centered point cloud. Collinear and coplanar sets
/// (including planes that are not axis-aligned) fail the check.
fn spans_volume(points: &[Vector3<f64>]) -> bool {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector3<f64>>() / n;
    let scatter = points
        .iter()
        .map(|p| (p - centroid) * (p - centroid).transpose())
        .fold(Matrix3::zeros(), |acc, m| acc + m);
    // Eigenvalues of the scatter matrix are the squared extents.
    let extents = scatter.singular_values().map(f64::sqrt);
    let (min, max) = (extents.min(), extents.max());
    log::trace!("point cloud extents: {extents}");
    max > 0.0 && min > max * DEGENERACY_TOLERANCE
}

/// Solves for the homogeneous 3x4 camera matrix mapping `points` to `image` points.
///
/// The result is denormalized and its sign is chosen so that the points lie in front of the
/// camera. Returns `None` if the solution is not unique.
fn solve_dlt(points: &[Vector3<f64>], image: &[Vector2<f64>]) -> Option<Matrix3x4<f64>> {
    let (t2, t2_inv) = normalize_2d(image);
    let t3 = normalize_3d(points);

    // https://files.ifi.uzh.ch/rpg/teaching/2016/03_image_formation_2.pdf
    let mut a = DMatrix::<f64>::zeros(2 * points.len(), 12);
    for (i, (p, q)) in zip_exact(points, image).enumerate() {
        let p = t3.transform_point(&Point3::from(*p));
        let q = t2.transform_point(&Point2::from(*q));
        let (x, y, z, u, v) = (p.x, p.y, p.z, q.x, q.y);

        let mut rows = a.rows_mut(i * 2, 2);
        let mut row = rows.row_mut(0);
        row[0] = x;
        row[1] = y;
        row[2] = z;
        row[3] = 1.0;
        row[8] = -u * x;
        row[9] = -u * y;
        row[10] = -u * z;
        row[11] = -u;

        let mut row = rows.row_mut(1);
        row[4] = x;
        row[5] = y;
        row[6] = z;
        row[7] = 1.0;
        row[8] = -v * x;
        row[9] = -v * y;
        row[10] = -v * z;
        row[11] = -v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.as_ref()?;
    let sigma = &svd.singular_values;
    log::trace!("DLT singular values: {sigma}");

    // The solution is the right singular vector of the smallest singular value. If a second
    // singular value is also (close to) zero, the solution is not unique.
    let smallest = sigma.imin();
    let second = sigma
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != smallest)
        .map(|(_, &s)| s)
        .fold(f64::INFINITY, f64::min);
    if !(second > sigma.max() * DEGENERACY_TOLERANCE) {
        return None;
    }

    let p = v_t.row(smallest);
    #[rustfmt::skip]
    let p = Matrix3x4::new(
        p[0], p[1], p[2], p[3],
        p[4], p[5], p[6], p[7],
        p[8], p[9], p[10], p[11],
    );
    let mut p = t2_inv * p * t3;

    // The homogeneous solution is only defined up to sign. Pick the one that puts the points in
    // front of the camera.
    let depth_sum: f64 = points
        .iter()
        .map(|x| p.row(2).dot(&x.push(1.0).transpose()))
        .sum();
    if depth_sum < 0.0 {
        p.neg_mut();
    }
    log::trace!("denormalized camera matrix: {p}");
    Some(p)
}

/// Solves for the translation of a perspective camera with known rotation, by linear least
/// squares on the cross-multiplied projection equations.
///
/// `image` holds the normalized image coordinates (divided by the focal length, Y up). Returns
/// `None` if the system is singular or the solution places a point behind the camera.
fn solve_translation(
    points: &[Vector3<f64>],
    image: &[Vector2<f64>],
    rotation: &Rotation3<f64>,
) -> Option<Vector3<f64>> {
    // With `c = R·p + t` and depth `w = -c.z`: `tx + x·tz = -(R·p).x - x·(R·p).z`, same for y.
    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for (p, q) in zip_exact(points, image) {
        let rp = rotation * p;
        for (row, b) in [
            (Vector3::new(1.0, 0.0, q.x), -rp.x - q.x * rp.z),
            (Vector3::new(0.0, 1.0, q.y), -rp.y - q.y * rp.z),
        ] {
            ata += row * row.transpose();
            atb += row * b;
        }
    }
    let t = ata.cholesky()?.solve(&atb);
    points
        .iter()
        .all(|p| -(rotation * p + t).z > 0.0)
        .then_some(t)
}

/// Minimizes the squared pixel reprojection error of a perspective camera with fixed focal length
/// `f` over its rotation and translation, using Levenberg-Marquardt.
///
/// `image` holds the normalized image coordinates (divided by `f`, Y up). Rotation updates are
/// applied on the left, as `R ← exp(θ)·R`. Returns `None` if the initial pose places a point
/// behind the camera.
fn refine_pose(
    points: &[Vector3<f64>],
    image: &[Vector2<f64>],
    f: f64,
    mut rotation: Rotation3<f64>,
    mut translation: Vector3<f64>,
) -> Option<(Rotation3<f64>, Vector3<f64>)> {
    let cost = |rotation: &Rotation3<f64>, translation: &Vector3<f64>| -> Option<f64> {
        let mut sum = 0.0;
        for (p, q) in zip_exact(points, image) {
            let c = rotation * p + translation;
            let w = -c.z;
            if !(w > f64::EPSILON) {
                return None;
            }
            sum += (Vector2::new(c.x, c.y) / w - q).norm_squared() * f * f;
        }
        Some(sum)
    };

    let initial = cost(&rotation, &translation)?;
    let mut current = initial;
    let mut damping = 1e-3;
    for _ in 0..MAX_REFINE_ITERATIONS {
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        for (p, q) in zip_exact(points, image) {
            let rp = rotation * p;
            let c = rp + translation;
            let w = -c.z;
            let residual = (Vector2::new(c.x, c.y) / w - q) * f;
            // Derivatives of the pixel residuals with respect to the camera-space point.
            let gx = Vector3::new(f / w, 0.0, f * c.x / (w * w));
            let gy = Vector3::new(0.0, f / w, f * c.y / (w * w));
            for (g, r) in [(gx, residual.x), (gy, residual.y)] {
                // A rotation update `θ` moves the camera-space point by `θ × R·p`.
                let d = rp.cross(&g);
                let row = Vector6::new(d.x, d.y, d.z, g.x, g.y, g.z);
                jtj += row * row.transpose();
                jtr += row * r;
            }
        }

        let mut lhs = jtj;
        for i in 0..6 {
            lhs[(i, i)] += damping * jtj[(i, i)].max(f64::EPSILON);
        }
        let Some(chol) = lhs.cholesky() else {
            damping *= 10.0;
            continue;
        };
        let step = -chol.solve(&jtr);
        let candidate_rotation = Rotation3::new(step.fixed_rows::<3>(0).into_owned()) * rotation;
        let candidate_translation = translation + step.fixed_rows::<3>(3);

        match cost(&candidate_rotation, &candidate_translation) {
            Some(new) if new < current => {
                rotation = candidate_rotation;
                translation = candidate_translation;
                let converged = current - new <= current * 1e-12;
                current = new;
                damping = (damping / 10.0).max(1e-12);
                if converged {
                    break;
                }
            }
            _ => {
                damping *= 10.0;
                if damping > 1e12 {
                    break;
                }
            }
        }
    }

    log::trace!("refined perspective pose: squared error {initial:.3} -> {current:.3} (f={f})");
    Some((rotation, translation))
}

fn to_unit_quaternion(rotation: &Rotation3<f64>) -> UnitQuaternion<f32> {
    let r = Rotation3::from_matrix_unchecked(rotation.matrix().cast::<f32>());
    UnitQuaternion::from_rotation_matrix(&r)
}

/// Returns the normalizing similarity for 2D points (centroid at the origin, mean distance √2)
/// together with its inverse.
fn normalize_2d(points: &[Vector2<f64>]) -> (Matrix3<f64>, Matrix3<f64>) {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let s = if mean_dist > f64::EPSILON {
        2f64.sqrt() / mean_dist
    } else {
        1.0
    };

    #[rustfmt::skip]
    let t = Matrix3::new(
        s, 0.0, -s * centroid.x,
        0.0, s, -s * centroid.y,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let t_inv = Matrix3::new(
        1.0 / s, 0.0, centroid.x,
        0.0, 1.0 / s, centroid.y,
        0.0, 0.0, 1.0,
    );
    (t, t_inv)
}

/// Returns the normalizing similarity for 3D points (centroid at the origin, mean distance √3).
fn normalize_3d(points: &[Vector3<f64>]) -> Matrix4<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector3<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let s = if mean_dist > f64::EPSILON {
        3f64.sqrt() / mean_dist
    } else {
        1.0
    };

    #[rustfmt::skip]
    let t = Matrix4::new(
        s, 0.0, 0.0, -s * centroid.x,
        0.0, s, 0.0, -s * centroid.y,
        0.0, 0.0, s, -s * centroid.z,
        0.0, 0.0, 0.0, 1.0,
    );
    t
}
