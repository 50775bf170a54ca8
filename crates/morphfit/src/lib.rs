//! 3D morphable model fitting to sparse 2D landmarks.
//!
//! Given a [`ShapeModel`], optional expression [`Blendshapes`] and a set of named 2D landmarks
//! observed in a single image, [`ModelFitter`] recovers a camera pose together with shape and
//! expression coefficients that reproduce the landmarks when the resulting [`Mesh`] is projected
//! into the image.
//!
//! Fitting alternates between four steps for a fixed number of iterations:
//!
//! 1. [`pose`]: estimate the camera from the current 3D-2D correspondences.
//! 2. [`contour`]: re-assign the face outline landmarks to the mesh silhouette as seen by that
//!    camera.
//! 3. [`solver`]: solve for shape coefficients with expressions fixed.
//! 4. [`solver`]: solve for expression coefficients with the shape fixed.
//!
//! # Coordinates
//!
//! Model space uses a right-handed coordinate system: X points to the right, Y points up, and Z
//! points out of the face towards a frontal viewer. The camera looks down its own negative Z axis,
//! so a frontal pose has the identity rotation.
//!
//! Image coordinates are in pixels, with the origin at the *center* of the top-left pixel and Y
//! pointing down. Landmark formats that count pixels from 1 have to be shifted before being passed
//! in (see [`landmark::read_pts`]).
//!
//! # Sharing
//!
//! Model assets ([`ShapeModel`], [`Blendshapes`], [`ContourDefinition`], [`EdgeTopology`] and
//! [`LandmarkMapper`]) are never mutated by fitting. They can be loaded once and borrowed by any
//! number of [`ModelFitter`]s, including ones running on different threads.

pub mod camera;
pub mod contour;
pub mod error;
pub mod fitting;
pub mod iter;
pub mod landmark;
pub mod mesh;
pub mod model;
pub mod pose;
pub mod solver;
pub mod timer;
pub mod topology;

use log::LevelFilter;

pub use camera::{CameraParameters, Projection, ProjectionModel};
pub use contour::{ContourCorrespondence, ContourDefinition, ContourSide, Side};
pub use error::{FitError, FitStep, Result};
pub use fitting::{FitOptions, FitProblem, FitResult, FitState, FittingAssets, ModelFitter};
pub use landmark::{Correspondence, Landmark, LandmarkCollection, LandmarkMapper};
pub use mesh::Mesh;
pub use model::{Blendshape, Blendshapes, ShapeModel};
pub use topology::EdgeTopology;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and morphfit will log at *trace*
/// level. Otherwise, they will log at *debug* level. `RUST_LOG` can override both.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
