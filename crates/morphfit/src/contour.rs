//! Resolution of the face outline landmarks against the mesh silhouette.
//!
//! Landmark detectors place the outline (contour) landmarks on the visible edge of the face, which
//! depends on the head pose. Their model vertices can therefore not be fixed in advance: in every
//! fitting iteration each contour landmark is assigned to the candidate vertex on the current
//! silhouette whose projection is closest to it.

use std::fmt;

use nalgebra::Point2;

use crate::{
    camera::CameraParameters,
    error::{FitError, Result},
    iter::nearest,
    landmark::{Correspondence, LandmarkCollection},
    mesh::Mesh,
    topology::EdgeTopology,
};

/// Default yaw angle (in degrees) beyond which only one side of the contour is fitted.
pub const DEFAULT_YAW_SIDE_THRESHOLD: f32 = 7.5;

/// A side of the face, from the subject's point of view.
///
/// The subject's right side lies towards negative model X, which is the left side of a frontal
/// image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Left, Side::Right];
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

/// Contour landmarks and silhouette candidate vertices of one side of the face.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContourSide {
    landmarks: Vec<String>,
    candidates: Vec<usize>,
}

impl ContourSide {
    /// Creates a contour side from its landmark names and candidate vertices.
    ///
    /// Candidates are usually ordered along the outline (e.g. from the ear to the chin), but the
    /// order only affects iteration order, not the result of the resolution.
    pub fn new<N: Into<String>>(
        landmarks: impl IntoIterator<Item = N>,
        candidates: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self {
            landmarks: landmarks.into_iter().map(Into::into).collect(),
            candidates: candidates.into_iter().collect(),
        }
    }

    #[inline]
    pub fn landmarks(&self) -> &[String] {
        &self.landmarks
    }

    #[inline]
    pub fn candidates(&self) -> &[usize] {
        &self.candidates
    }
}

/// The contour landmarks and candidate vertices of both sides of the face.
///
/// An empty definition disables contour fitting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContourDefinition {
    left: ContourSide,
    right: ContourSide,
}

impl ContourDefinition {
    pub fn new(left: ContourSide, right: ContourSide) -> Self {
        Self { left, right }
    }

    pub fn side(&self, side: Side) -> &ContourSide {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Returns whether `name` is one of the contour landmarks.
    pub fn contains_landmark(&self, name: &str) -> bool {
        self.landmark_names().any(|n| n == name)
    }

    /// Iterates over the contour landmark names of both sides.
    pub fn landmark_names(&self) -> impl Iterator<Item = &str> + '_ {
        Side::ALL
            .into_iter()
            .flat_map(move |side| self.side(side).landmarks.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.left.landmarks.is_empty() && self.right.landmarks.is_empty()
    }

    /// Checks the definition against a mesh with `vertex_count` vertices.
    pub fn validate(&self, vertex_count: usize) -> Result<()> {
        for side in Side::ALL {
            let def = self.side(side);
            if let Some(v) = def.candidates.iter().find(|&&v| v >= vertex_count) {
                return Err(FitError::invalid(format!(
                    "{side} contour candidate {v} is out of range for {vertex_count} vertices"
                )));
            }
            if def.candidates.is_empty() && !def.landmarks.is_empty() {
                return Err(FitError::invalid(format!(
                    "{side} contour has landmarks but no candidate vertices"
                )));
            }
        }

        let mut names = self.landmark_names().collect::<Vec<_>>();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(FitError::invalid(format!(
                "contour landmark '{}' is listed more than once",
                w[0]
            )));
        }
        Ok(())
    }
}

/// A contour landmark assigned to a mesh vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct ContourCorrespondence {
    pub landmark: String,
    pub side: Side,
    pub vertex: usize,
    pub image_point: Point2<f32>,
}

impl ContourCorrespondence {
    pub fn correspondence(&self) -> Correspondence {
        Correspondence {
            vertex: self.vertex,
            image_point: self.image_point,
        }
    }
}

/// Returns the sides whose contour should be fitted for a head with the given yaw (in degrees).
///
/// Once the head is turned by more than `threshold` degrees, the contour on the side turning away
/// from the camera is hidden behind the face, and only the other side is fitted.
pub fn visible_sides(yaw_degrees: f32, threshold: f32) -> impl Iterator<Item = Side> {
    // Positive yaw turns the right side (negative X) towards the camera.
    Side::ALL.into_iter().filter(move |side| match side {
        Side::Right => yaw_degrees >= -threshold,
        Side::Left => yaw_degrees <= threshold,
    })
}

/// Marks the vertices that lie on the silhouette of `mesh` as seen by `camera`.
///
/// A silhouette edge is an interior edge between a triangle facing the camera and one facing away
/// from it. Only edges touching a vertex with `of_interest[v] == true` are tested, which avoids
/// computing the visibility of most triangles.
///
/// The returned vector has one entry per vertex of `mesh`, `true` for vertices of interest that
/// touch a silhouette edge.
///
/// # Panics
///
/// Panics if `of_interest` is shorter than the vertex count of `mesh`, or if `topology` refers to
/// vertices or triangles outside of `mesh`.
pub fn silhouette_vertices(
    mesh: &Mesh,
    camera: &CameraParameters,
    topology: &EdgeTopology,
    of_interest: &[bool],
) -> Vec<bool> {
    let mut facing = vec![None; mesh.triangles().len()];
    let mut is_front_facing = |face: usize| -> bool {
        *facing[face].get_or_insert_with(|| {
            let towards_camera = camera.direction_to_camera(&mesh.face_centroid(face));
            mesh.face_normal(face).dot(&towards_camera) > 0.0
        })
    };

    let mut on_silhouette = vec![false; mesh.vertex_count()];
    for edge in topology.edges() {
        let (f0, Some(f1)) = edge.faces else { continue };
        let [a, b] = edge.vertices;
        if !(of_interest[a] || of_interest[b]) {
            continue;
        }
        if is_front_facing(f0) != is_front_facing(f1) {
            on_silhouette[a] |= of_interest[a];
            on_silhouette[b] |= of_interest[b];
        }
    }
    on_silhouette
}

/// Assigns every observed contour landmark to a silhouette vertex of its side.
///
/// For each side fitted at the current yaw (see [`visible_sides`]), the candidates on the current
/// silhouette are projected, and every contour landmark of that side is assigned to the nearest
/// projection (ties going to the lowest vertex index). If no candidate of a side is on the
/// silhouette, all of its candidates are considered instead.
///
/// Contour landmarks missing from `landmarks` are skipped. The result is ordered by side, then by
/// the landmark order of the [`ContourDefinition`].
///
/// # Panics
///
/// Panics if a candidate vertex of `contour` or an edge of `topology` lies outside of `mesh`. Use
/// [`ContourDefinition::validate`] to check the candidates beforehand.
pub fn resolve_contour(
    mesh: &Mesh,
    camera: &CameraParameters,
    contour: &ContourDefinition,
    topology: &EdgeTopology,
    landmarks: &LandmarkCollection,
    yaw_side_threshold: f32,
) -> Vec<ContourCorrespondence> {
    if contour.is_empty() {
        return Vec::new();
    }

    let yaw = camera.euler_angles().yaw.to_degrees();
    let sides = visible_sides(yaw, yaw_side_threshold).collect::<Vec<_>>();

    let mut of_interest = vec![false; mesh.vertex_count()];
    for &side in &sides {
        for &v in &contour.side(side).candidates {
            of_interest[v] = true;
        }
    }
    let on_silhouette = silhouette_vertices(mesh, camera, topology, &of_interest);

    let mut resolved = Vec::new();
    for side in sides {
        let def = contour.side(side);
        let mut exposed = def
            .candidates
            .iter()
            .copied()
            .filter(|&v| on_silhouette[v])
            .collect::<Vec<_>>();
        if exposed.is_empty() {
            log::debug!(
                "no {side} contour candidate is on the silhouette (yaw={yaw:.1}°), using all {}",
                def.candidates.len()
            );
            exposed = def.candidates.clone();
        }
        let projected = exposed
            .iter()
            .map(|&v| (v, camera.project(&mesh.vertex(v))))
            .collect::<Vec<_>>();

        for name in &def.landmarks {
            let Some(landmark) = landmarks.get(name) else { continue };
            let observed = landmark.position();
            let candidates = projected
                .iter()
                .map(|(v, p)| (*v, (p - observed).norm_squared()));
            if let Some((vertex, _)) = nearest(candidates) {
                resolved.push(ContourCorrespondence {
                    landmark: name.clone(),
                    side,
                    vertex,
                    image_point: observed,
                });
            }
        }
    }

    log::trace!("resolved {} contour landmarks at yaw {yaw:.1}°", resolved.len());
    resolved
}
