//! The iterative pose, contour, shape and expression fitting loop.

use nalgebra::{DVector, Point2};

use crate::{
    camera::{CameraParameters, ProjectionModel},
    contour::{resolve_contour, ContourCorrespondence, ContourDefinition, DEFAULT_YAW_SIDE_THRESHOLD},
    error::{FitError, FitStep, Result},
    landmark::{Correspondence, LandmarkCollection, LandmarkMapper},
    mesh::Mesh,
    model::{Blendshapes, ShapeModel},
    pose::estimate_camera,
    solver::{fit_coefficients, Regularization},
    timer::Timer,
    topology::EdgeTopology,
};

/// Options controlling a fit.
///
/// The defaults (5 iterations, `λ = 30`, orthographic camera) work well for 68-point face
/// landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    iterations: usize,
    lambda: f32,
    expression_lambda: Option<f32>,
    landmark_std_dev: f32,
    projection: ProjectionModel,
    fov_y: Option<f32>,
    yaw_side_threshold: f32,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            iterations: 5,
            lambda: 30.0,
            expression_lambda: None,
            landmark_std_dev: 3f32.sqrt(),
            projection: ProjectionModel::Orthographic,
            fov_y: None,
            yaw_side_threshold: DEFAULT_YAW_SIDE_THRESHOLD,
        }
    }
}

impl FitOptions {
    /// Sets the number of fitting iterations.
    ///
    /// The loop always runs for exactly this many iterations; there is no convergence check.
    #[inline]
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    /// Sets the regularization weight of the shape coefficients.
    ///
    /// Larger values keep the shape closer to the mean.
    #[inline]
    pub fn lambda(self, lambda: f32) -> Self {
        Self { lambda, ..self }
    }

    /// Sets the regularization weight of the expression coefficients.
    ///
    /// By default, the shape weight is used for expressions, too.
    #[inline]
    pub fn expression_lambda(self, lambda: f32) -> Self {
        Self {
            expression_lambda: Some(lambda),
            ..self
        }
    }

    /// Sets the expected standard deviation of the landmark positions, in pixels.
    ///
    /// Defaults to `√3`.
    #[inline]
    pub fn landmark_std_dev(self, std_dev: f32) -> Self {
        Self {
            landmark_std_dev: std_dev,
            ..self
        }
    }

    /// Selects the projection model of the estimated camera.
    #[inline]
    pub fn projection(self, projection: ProjectionModel) -> Self {
        Self { projection, ..self }
    }

    /// Fixes the vertical field of view of the camera, in degrees.
    ///
    /// This implies a perspective camera. Without a fixed field of view, perspective cameras
    /// estimate their focal length from the landmarks.
    #[inline]
    pub fn fov_y(self, degrees: f32) -> Self {
        Self {
            fov_y: Some(degrees),
            projection: ProjectionModel::Perspective,
            ..self
        }
    }

    /// Sets the head yaw (in degrees) beyond which only the contour of the side facing the camera
    /// is fitted.
    #[inline]
    pub fn yaw_side_threshold(self, degrees: f32) -> Self {
        Self {
            yaw_side_threshold: degrees,
            ..self
        }
    }

    pub fn get_iterations(&self) -> usize {
        self.iterations
    }

    pub fn get_lambda(&self) -> f32 {
        self.lambda
    }

    pub fn get_expression_lambda(&self) -> f32 {
        self.expression_lambda.unwrap_or(self.lambda)
    }

    pub fn get_projection(&self) -> ProjectionModel {
        self.projection
    }

    pub fn get_fov_y(&self) -> Option<f32> {
        self.fov_y
    }

    fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(FitError::invalid("at least one iteration is required"));
        }
        let positive = |value: f32| value.is_finite() && value > 0.0;
        if !positive(self.lambda) {
            return Err(FitError::invalid(format!(
                "regularization weight must be positive, got {}",
                self.lambda
            )));
        }
        if !positive(self.get_expression_lambda()) {
            return Err(FitError::invalid(format!(
                "expression regularization weight must be positive, got {}",
                self.get_expression_lambda()
            )));
        }
        if !positive(self.landmark_std_dev) {
            return Err(FitError::invalid(format!(
                "landmark standard deviation must be positive, got {}",
                self.landmark_std_dev
            )));
        }
        if let Some(fov) = self.fov_y {
            if !(positive(fov) && fov < 180.0) {
                return Err(FitError::invalid(format!(
                    "field of view must be between 0 and 180 degrees, got {fov}"
                )));
            }
        }
        if !(self.yaw_side_threshold.is_finite() && self.yaw_side_threshold >= 0.0) {
            return Err(FitError::invalid(format!(
                "yaw side threshold must be non-negative, got {}",
                self.yaw_side_threshold
            )));
        }
        Ok(())
    }
}

/// The read-only model data a [`ModelFitter`] works with.
///
/// Only references are stored; the assets are never copied or modified.
#[derive(Debug, Clone, Copy)]
pub struct FittingAssets<'a> {
    pub model: &'a ShapeModel,
    pub blendshapes: &'a Blendshapes,
    pub mapper: &'a LandmarkMapper,
    pub contour: &'a ContourDefinition,
    pub topology: &'a EdgeTopology,
}

impl FittingAssets<'_> {
    fn validate(&self) -> Result<()> {
        let vertex_count = self.model.vertex_count();
        let triangle_count = self.model.triangles().len();
        self.blendshapes.check_vertex_count(vertex_count)?;
        self.contour.validate(vertex_count)?;

        if let Some(edge) = self.topology.edges().iter().find(|e| {
            e.vertices.iter().any(|&v| v >= vertex_count)
                || e.faces.0 >= triangle_count
                || e.faces.1.map_or(false, |f| f >= triangle_count)
        }) {
            return Err(FitError::invalid(format!(
                "edge {:?} does not belong to the model topology",
                edge.vertices
            )));
        }
        if let Some((name, v)) = self.mapper.iter().find(|&(_, v)| v >= vertex_count) {
            return Err(FitError::invalid(format!(
                "landmark '{name}' is mapped to vertex {v}, but the model has {vertex_count} vertices"
            )));
        }
        Ok(())
    }
}

/// The state of a fit between two iterations.
///
/// Every iteration consumes a snapshot and produces a new one, so each step's inputs can be
/// inspected separately.
#[derive(Debug, Clone)]
pub struct FitState {
    /// The current mesh instance (mean + shape + expressions).
    pub mesh: Mesh,
    /// The camera estimated in the last iteration. `None` before the first iteration.
    pub camera: Option<CameraParameters>,
    pub shape_coefficients: DVector<f32>,
    pub expression_coefficients: DVector<f32>,
    /// The contour correspondences resolved in the last iteration.
    pub contour: Vec<ContourCorrespondence>,
    /// Mean reprojection error (in pixels) of all correspondences after the last iteration.
    pub reprojection_error: Option<f32>,
}

/// The landmarks of one fit, validated and matched to the model.
#[derive(Debug, Clone)]
pub struct FitProblem<'l> {
    landmarks: &'l LandmarkCollection,
    fixed: Vec<Correspondence>,
    image_size: (u32, u32),
}

impl FitProblem<'_> {
    /// Returns the correspondences of the landmarks with a fixed vertex.
    pub fn fixed_correspondences(&self) -> &[Correspondence] {
        &self.fixed
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }
}

/// The outcome of a successful fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    mesh: Mesh,
    camera: CameraParameters,
    shape_coefficients: DVector<f32>,
    expression_coefficients: DVector<f32>,
    correspondences: Vec<Correspondence>,
    contour: Vec<ContourCorrespondence>,
    reprojection_errors: Vec<f32>,
}

impl FitResult {
    /// Returns the fitted mesh.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Returns the camera estimated in the last iteration.
    pub fn camera(&self) -> &CameraParameters {
        &self.camera
    }

    /// Returns the shape coefficients, in units of standard deviations.
    pub fn shape_coefficients(&self) -> &DVector<f32> {
        &self.shape_coefficients
    }

    pub fn expression_coefficients(&self) -> &DVector<f32> {
        &self.expression_coefficients
    }

    /// Returns all correspondences (fixed and contour) used in the last iteration.
    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    /// Returns the contour correspondences resolved in the last iteration.
    pub fn contour(&self) -> &[ContourCorrespondence] {
        &self.contour
    }

    /// Returns the mean reprojection error after each iteration, in pixels.
    pub fn reprojection_errors(&self) -> &[f32] {
        &self.reprojection_errors
    }

    /// Decomposes the result into the fitted mesh and camera.
    pub fn into_mesh_and_camera(self) -> (Mesh, CameraParameters) {
        (self.mesh, self.camera)
    }
}

/// Fits a shape model to landmarks in an image.
///
/// A [`ModelFitter`] only borrows its assets, and can be shared between threads to fit several
/// images at once.
pub struct ModelFitter<'a> {
    assets: FittingAssets<'a>,
    options: FitOptions,
    t_pose: Timer,
    t_contour: Timer,
    t_shape: Timer,
    t_expression: Timer,
}

impl<'a> ModelFitter<'a> {
    /// Creates a fitter, validating the options and the consistency of the assets.
    pub fn new(assets: FittingAssets<'a>, options: FitOptions) -> Result<Self> {
        options.validate()?;
        assets.validate()?;
        Ok(Self {
            assets,
            options,
            t_pose: Timer::new("pose"),
            t_contour: Timer::new("contour"),
            t_shape: Timer::new("shape"),
            t_expression: Timer::new("expression"),
        })
    }

    #[inline]
    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    #[inline]
    pub fn assets(&self) -> &FittingAssets<'a> {
        &self.assets
    }

    /// Fits the model to `landmarks` observed in an image of the given size.
    ///
    /// Landmarks that are neither mapped to a vertex nor part of the contour are ignored.
    pub fn fit(
        &self,
        landmarks: &LandmarkCollection,
        image_width: u32,
        image_height: u32,
    ) -> Result<FitResult> {
        let problem = self.prepare(landmarks, image_width, image_height)?;

        let mut state = self.initial_state();
        let mut reprojection_errors = Vec::with_capacity(self.options.iterations);
        for i in 0..self.options.iterations {
            state = self.iterate(&problem, &state)?;
            let error = state.reprojection_error.unwrap_or(f32::NAN);
            log::debug!(
                "iteration {i}: {} fixed + {} contour correspondences, mean error {error:.3}px",
                problem.fixed.len(),
                state.contour.len()
            );
            reprojection_errors.push(error);
        }

        log::debug!(
            "fit of {} landmarks done: {}, {}, {}, {}",
            landmarks.len(),
            self.t_pose,
            self.t_contour,
            self.t_shape,
            self.t_expression,
        );

        let FitState {
            mesh,
            camera,
            shape_coefficients,
            expression_coefficients,
            contour,
            ..
        } = state;
        // At least one iteration ran, which always estimates a camera.
        let camera = camera.ok_or(FitError::InsufficientConstraints {
            step: FitStep::Pose,
            correspondences: problem.fixed.len(),
            required: 1,
        })?;
        let correspondences = problem
            .fixed
            .iter()
            .copied()
            .chain(contour.iter().map(ContourCorrespondence::correspondence))
            .collect();

        Ok(FitResult {
            mesh,
            camera,
            shape_coefficients,
            expression_coefficients,
            correspondences,
            contour,
            reprojection_errors,
        })
    }

    /// Validates `landmarks` and matches them to model vertices.
    pub fn prepare<'l>(
        &self,
        landmarks: &'l LandmarkCollection,
        image_width: u32,
        image_height: u32,
    ) -> Result<FitProblem<'l>> {
        if landmarks.is_empty() {
            return Err(FitError::EmptyLandmarks);
        }
        if image_width == 0 || image_height == 0 {
            return Err(FitError::invalid(format!(
                "image size {image_width}x{image_height} is empty"
            )));
        }
        if let Some(lm) = landmarks
            .iter()
            .find(|lm| !(lm.x().is_finite() && lm.y().is_finite()))
        {
            return Err(FitError::invalid(format!(
                "landmark '{}' has a non-finite position",
                lm.name()
            )));
        }
        if let Some(name) = self
            .assets
            .contour
            .landmark_names()
            .find(|name| !landmarks.contains(name))
        {
            return Err(FitError::UnknownContourLandmark(name.to_string()));
        }

        let vertex_count = self.assets.model.vertex_count();
        let mut fixed = Vec::new();
        for lm in landmarks.iter() {
            if self.assets.contour.contains_landmark(lm.name()) {
                continue;
            }
            let Some(vertex) = self.assets.mapper.vertex(lm.name()) else {
                log::trace!("landmark '{}' has no vertex, ignoring it", lm.name());
                continue;
            };
            if vertex >= vertex_count {
                return Err(FitError::invalid(format!(
                    "landmark '{}' maps to vertex {vertex}, but the model has {vertex_count} vertices",
                    lm.name()
                )));
            }
            fixed.push(Correspondence {
                vertex,
                image_point: lm.position(),
            });
        }

        Ok(FitProblem {
            landmarks,
            fixed,
            image_size: (image_width, image_height),
        })
    }

    /// Returns the state before the first iteration: zero coefficients and the mean mesh.
    pub fn initial_state(&self) -> FitState {
        FitState {
            mesh: self.assets.model.mean_mesh(),
            camera: None,
            shape_coefficients: DVector::zeros(self.assets.model.num_components()),
            expression_coefficients: DVector::zeros(self.assets.blendshapes.len()),
            contour: Vec::new(),
            reprojection_error: None,
        }
    }

    /// Runs one iteration of pose, contour, shape and expression fitting on `state`.
    pub fn iterate(&self, problem: &FitProblem<'_>, state: &FitState) -> Result<FitState> {
        let FittingAssets {
            model,
            blendshapes,
            contour: contour_def,
            topology,
            ..
        } = self.assets;

        // Pose, from the fixed correspondences and the previous iteration's contour.
        let correspondences = problem
            .fixed
            .iter()
            .copied()
            .chain(state.contour.iter().map(ContourCorrespondence::correspondence))
            .collect::<Vec<_>>();
        let camera = self.t_pose.time(|| {
            let model_points = correspondences
                .iter()
                .map(|c| state.mesh.vertex(c.vertex))
                .collect::<Vec<_>>();
            let image_points = correspondences
                .iter()
                .map(|c| c.image_point)
                .collect::<Vec<_>>();
            estimate_camera(
                &model_points,
                &image_points,
                problem.image_size,
                self.options.projection,
                self.options.fov_y,
            )
        })?;

        let contour = self.t_contour.time(|| {
            resolve_contour(
                &state.mesh,
                &camera,
                contour_def,
                topology,
                problem.landmarks,
                self.options.yaw_side_threshold,
            )
        });
        let correspondences = problem
            .fixed
            .iter()
            .copied()
            .chain(contour.iter().map(ContourCorrespondence::correspondence))
            .collect::<Vec<_>>();

        // Shape, with the expressions of the previous iteration.
        let shape_coefficients = self.t_shape.time(|| {
            let base = blendshapes.apply(model.mean(), state.expression_coefficients.as_slice());
            fit_coefficients(
                model,
                &base,
                &camera,
                &correspondences,
                Regularization {
                    lambda: self.options.lambda,
                    landmark_std_dev: self.options.landmark_std_dev,
                },
                FitStep::Shape,
            )
        })?;
        let identity = model.draw_sample(shape_coefficients.as_slice());

        // Expressions, on top of the new shape.
        let expression_coefficients = self.t_expression.time(|| {
            fit_coefficients(
                blendshapes,
                &identity,
                &camera,
                &correspondences,
                Regularization {
                    lambda: self.options.get_expression_lambda(),
                    landmark_std_dev: self.options.landmark_std_dev,
                },
                FitStep::Expression,
            )
        })?;
        let mesh = Mesh::from_shape(
            model,
            &blendshapes.apply(&identity, expression_coefficients.as_slice()),
        );

        let reprojection_error = mean_reprojection_error(&mesh, &camera, &correspondences);
        Ok(FitState {
            mesh,
            camera: Some(camera),
            shape_coefficients,
            expression_coefficients,
            contour,
            reprojection_error: Some(reprojection_error),
        })
    }

    /// Returns the timers of the fitting steps, accumulated over all fits.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_pose, &self.t_contour, &self.t_shape, &self.t_expression].into_iter()
    }
}

/// Returns the mean distance (in pixels) between projected mesh vertices and their observations.
pub fn mean_reprojection_error(
    mesh: &Mesh,
    camera: &CameraParameters,
    correspondences: &[Correspondence],
) -> f32 {
    if correspondences.is_empty() {
        return 0.0;
    }
    let total: f32 = correspondences
        .iter()
        .map(|c| distance(camera.project(&mesh.vertex(c.vertex)), c.image_point))
        .sum();
    total / correspondences.len() as f32
}

fn distance(a: Point2<f32>, b: Point2<f32>) -> f32 {
    (a - b).norm()
}
