//! A synthetic head-like model for scenario tests.
//!
//! The mesh is an open UV ellipsoid (semi-axes 8, 10 and 7 along X, Y and Z) with 16 rings of 32
//! vertices. The 52 fixed landmarks sit on a grid on the front of the ellipsoid, and the 16
//! contour landmarks on the two meridians that form the silhouette in a frontal view.

#![allow(dead_code)]

use std::f32::consts::PI;

use morphfit::{
    Blendshape, Blendshapes, CameraParameters, ContourDefinition, ContourSide, EdgeTopology,
    FittingAssets, LandmarkCollection, LandmarkMapper, Mesh, ShapeModel,
};
use nalgebra::{DMatrix, DVector, Point2, Point3, UnitQuaternion, Vector2, Vector3};

pub const RINGS: usize = 16;
pub const COLUMNS: usize = 32;
pub const SEMI_AXES: [f32; 3] = [8.0, 10.0, 7.0];
pub const STD_DEVS: [f32; 10] = [8.0, 6.0, 5.0, 4.0, 3.0, 2.5, 2.0, 1.5, 1.0, 0.5];

pub const IMAGE_WIDTH: u32 = 640;
pub const IMAGE_HEIGHT: u32 = 480;

/// Index of the vertex on `ring` (bottom to top) and `column` (longitude, `-180°` at column 0).
pub fn vertex(ring: usize, column: usize) -> usize {
    ring * COLUMNS + column % COLUMNS
}

fn latitude(ring: usize) -> f32 {
    (-75.0 + 10.0 * ring as f32).to_radians()
}

fn longitude(column: usize) -> f32 {
    (-180.0 + 11.25 * column as f32).to_radians()
}

/// Meridian of the subject's right contour (`-90°`).
pub const RIGHT_MERIDIAN: usize = 8;
/// Meridian of the subject's left contour (`+90°`).
pub const LEFT_MERIDIAN: usize = 24;

pub struct Synthetic {
    pub model: ShapeModel,
    pub blendshapes: Blendshapes,
    pub mapper: LandmarkMapper,
    pub contour: ContourDefinition,
    pub topology: EdgeTopology,
    /// Vertex each contour landmark is observed at.
    pub contour_vertices: Vec<(String, usize)>,
}

impl Synthetic {
    pub fn new() -> Self {
        let mean = mean_shape();
        let model = ShapeModel::new(
            mean.clone(),
            shape_basis(&mean),
            DVector::from_row_slice(&STD_DEVS),
            triangles(),
        )
        .unwrap();
        let topology = EdgeTopology::from_triangles(model.triangles()).unwrap();

        let (mapper, contour, contour_vertices) = landmarks();
        Self {
            blendshapes: blendshapes(&mean),
            model,
            mapper,
            contour,
            topology,
            contour_vertices,
        }
    }

    pub fn assets(&self) -> FittingAssets<'_> {
        FittingAssets {
            model: &self.model,
            blendshapes: &self.blendshapes,
            mapper: &self.mapper,
            contour: &self.contour,
            topology: &self.topology,
        }
    }

    /// Builds the mesh with the given shape and expression coefficients.
    pub fn instance(&self, shape: &[f32], expression: &[f32]) -> Mesh {
        let identity = self.model.draw_sample(shape);
        Mesh::from_shape(&self.model, &self.blendshapes.apply(&identity, expression))
    }

    /// Projects all 68 landmarks of `mesh` through `camera`.
    ///
    /// `noise` returns an offset added to each observation.
    pub fn observe_with(
        &self,
        mesh: &Mesh,
        camera: &CameraParameters,
        mut noise: impl FnMut() -> Vector2<f32>,
    ) -> LandmarkCollection {
        let fixed = self.mapper.iter().map(|(name, v)| (name.to_string(), v));
        let contour = self.contour_vertices.iter().cloned();
        LandmarkCollection::from_points(
            fixed
                .chain(contour)
                .map(|(name, v)| (name, camera.project(&mesh.vertex(v)) + noise())),
        )
        .unwrap()
    }

    pub fn observe(&self, mesh: &Mesh, camera: &CameraParameters) -> LandmarkCollection {
        self.observe_with(mesh, camera, || Vector2::zeros())
    }
}

/// An orthographic camera centering the model in the image, with scale 20.
pub fn orthographic(yaw: f32, pitch: f32, roll: f32) -> CameraParameters {
    CameraParameters::orthographic(
        rotation(yaw, pitch, roll),
        Vector2::new(16.0, 12.0),
        20.0,
        IMAGE_WIDTH,
        IMAGE_HEIGHT,
    )
}

/// Rotation from angles in degrees, composed as `Rz(roll)·Ry(yaw)·Rx(pitch)`.
pub fn rotation(yaw: f32, pitch: f32, roll: f32) -> UnitQuaternion<f32> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), roll.to_radians())
        * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw.to_radians())
        * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), pitch.to_radians())
}

fn mean_shape() -> DVector<f32> {
    let [a, b, c] = SEMI_AXES;
    let mut mean = DVector::zeros(RINGS * COLUMNS * 3);
    for ring in 0..RINGS {
        for column in 0..COLUMNS {
            let (theta, phi) = (latitude(ring), longitude(column));
            let p = Point3::new(
                a * theta.cos() * phi.sin(),
                b * theta.sin(),
                c * theta.cos() * phi.cos(),
            );
            mean.fixed_rows_mut::<3>(vertex(ring, column) * 3)
                .copy_from(&p.coords);
        }
    }
    mean
}

fn triangles() -> Vec<[u32; 3]> {
    let mut triangles = Vec::new();
    for ring in 0..RINGS - 1 {
        for column in 0..COLUMNS {
            let v00 = vertex(ring, column) as u32;
            let v01 = vertex(ring, column + 1) as u32;
            let v10 = vertex(ring + 1, column) as u32;
            let v11 = vertex(ring + 1, column + 1) as u32;
            triangles.push([v00, v01, v11]);
            triangles.push([v00, v11, v10]);
        }
    }
    triangles
}

/// Normalized coordinates `(x/a, y/b, z/c)` of every mean vertex.
fn normalized(mean: &DVector<f32>) -> Vec<Vector3<f32>> {
    let [a, b, c] = SEMI_AXES;
    mean.as_slice()
        .chunks_exact(3)
        .map(|p| Vector3::new(p[0] / a, p[1] / b, p[2] / c))
        .collect()
}

fn field(mean: &DVector<f32>, f: impl Fn(Vector3<f32>) -> Vector3<f32>) -> DVector<f32> {
    DVector::from_iterator(
        mean.len(),
        normalized(mean).into_iter().flat_map(|n| {
            let d = f(n);
            [d.x, d.y, d.z]
        }),
    )
}

/// Smooth, mirror-symmetric deformation fields, orthonormalized.
fn shape_basis(mean: &DVector<f32>) -> DMatrix<f32> {
    let fields: [fn(Vector3<f32>) -> Vector3<f32>; 10] = [
        |n| Vector3::new(n.x, 0.0, 0.0),
        |n| Vector3::new(0.0, n.y, 0.0),
        |n| Vector3::new(0.0, 0.0, n.z),
        |n| Vector3::new(0.0, 0.0, n.y),
        |n| Vector3::new(n.x * n.y, 0.0, 0.0),
        |n| Vector3::new(0.0, n.x * n.x, 0.0),
        |n| Vector3::new(0.0, 0.0, n.x * n.x),
        |n| Vector3::new(0.0, 0.0, n.y * n.y),
        |n| Vector3::new(n.x * n.z, 0.0, 0.0),
        |n| Vector3::new(0.0, n.y * n.z, 0.0),
    ];
    let columns = fields.map(|f| field(mean, f));
    let raw = DMatrix::from_columns(&columns);
    raw.qr().q()
}

fn blendshapes(mean: &DVector<f32>) -> Blendshapes {
    let shapes: [(&str, fn(Vector3<f32>) -> Vector3<f32>); 6] = [
        ("jaw_open", |n| Vector3::new(0.0, 2.0 * (n.y + 0.3).min(0.0), 0.0)),
        ("mouth_wide", |n| {
            Vector3::new(n.x * (0.5 - n.y.abs()).max(0.0), 0.0, 0.0)
        }),
        ("lips_forward", |n| {
            Vector3::new(0.0, 0.0, n.z.max(0.0) * (-n.y).max(0.0))
        }),
        ("brows_up", |n| {
            Vector3::new(0.0, n.y.max(0.0) * n.z.max(0.0), 0.0)
        }),
        ("left_brow_up", |n| {
            Vector3::new(0.0, n.x.max(0.0) * n.y.max(0.0), 0.0)
        }),
        ("right_cheek_puff", |n| {
            Vector3::new(0.0, 0.0, (-n.x).max(0.0) * (1.0 - n.y.abs()))
        }),
    ];
    Blendshapes::new(
        shapes
            .into_iter()
            .map(|(name, f)| Blendshape {
                name: name.into(),
                deformation: field(mean, f),
            })
            .collect(),
    )
    .unwrap()
}

/// Returns the landmark mapper, the contour definition and the vertices contour landmarks are
/// observed at.
///
/// Landmarks follow the ibug 68-point naming: "1" to "8" are the subject's right contour from the
/// ear down, "9" is the chin, "10" to "17" the left contour from the chin up, and "18" to "68" the
/// interior points.
fn landmarks() -> (LandmarkMapper, ContourDefinition, Vec<(String, usize)>) {
    let grid = [3, 5, 7, 9, 11, 13]
        .into_iter()
        .flat_map(|ring| (12..=20).map(move |column| vertex(ring, column)));
    let fixed = (18..=68)
        .map(|n| n.to_string())
        .zip(grid)
        .chain([("9".to_string(), vertex(1, 16))]);
    let mapper = LandmarkMapper::new(fixed).unwrap();

    let candidates = |meridian: usize| {
        (1..RINGS - 1)
            .flat_map(move |ring| (meridian - 1..=meridian + 1).map(move |c| vertex(ring, c)))
            .collect::<Vec<_>>()
    };
    let right_names = (1..=8).map(|n| n.to_string()).collect::<Vec<_>>();
    let left_names = (10..=17).map(|n| n.to_string()).collect::<Vec<_>>();

    let mut observed_at = Vec::new();
    for (k, name) in right_names.iter().enumerate() {
        observed_at.push((name.clone(), vertex(12 - k, RIGHT_MERIDIAN)));
    }
    for (k, name) in left_names.iter().enumerate() {
        observed_at.push((name.clone(), vertex(5 + k, LEFT_MERIDIAN)));
    }

    let contour = ContourDefinition::new(
        ContourSide::new(left_names, candidates(LEFT_MERIDIAN)),
        ContourSide::new(right_names, candidates(RIGHT_MERIDIAN)),
    );
    (mapper, contour, observed_at)
}

/// Deterministic uniform noise in `[-amplitude, amplitude]` on both axes.
pub fn uniform_noise(seed: u64, amplitude: f32) -> impl FnMut() -> Vector2<f32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    move || {
        Vector2::new(
            (rng.f32() * 2.0 - 1.0) * amplitude,
            (rng.f32() * 2.0 - 1.0) * amplitude,
        )
    }
}

/// Distance between two image points.
pub fn distance(a: Point2<f32>, b: Point2<f32>) -> f32 {
    (a - b).norm()
}

pub fn degrees(radians: f32) -> f32 {
    radians * 180.0 / PI
}
