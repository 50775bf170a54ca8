//! Named 2D landmark observations and their association with model vertices.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{bail, Context};
use nalgebra::Point2;

use crate::error::{FitError, Result};

/// A named landmark position in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    name: String,
    position: Point2<f32>,
}

impl Landmark {
    pub fn new(name: impl Into<String>, position: Point2<f32>) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn position(&self) -> Point2<f32> {
        self.position
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.position.x
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.position.y
    }
}

/// A set of landmarks with unique names.
///
/// Iteration yields the landmarks in insertion order, but the order carries no meaning for
/// fitting.
#[derive(Debug, Clone, Default)]
pub struct LandmarkCollection {
    landmarks: Vec<Landmark>,
    by_name: HashMap<String, usize>,
}

impl LandmarkCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a landmark, failing if one with the same name is already present.
    pub fn insert(&mut self, landmark: Landmark) -> Result<()> {
        if self.by_name.contains_key(landmark.name()) {
            return Err(FitError::DuplicateLandmark(landmark.name));
        }
        self.by_name
            .insert(landmark.name.clone(), self.landmarks.len());
        self.landmarks.push(landmark);
        Ok(())
    }

    /// Builds a collection from named positions, failing on duplicate names.
    pub fn from_points<N: Into<String>>(
        points: impl IntoIterator<Item = (N, Point2<f32>)>,
    ) -> Result<Self> {
        let mut this = Self::new();
        for (name, pos) in points {
            this.insert(Landmark::new(name, pos))?;
        }
        Ok(this)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Landmark> {
        self.by_name.get(name).map(|&i| &self.landmarks[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Landmark> + Clone + '_ {
        self.landmarks.iter()
    }
}

/// A model vertex associated with an observed image position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub vertex: usize,
    pub image_point: Point2<f32>,
}

/// Bidirectional mapping between landmark names and model vertex indices.
///
/// Landmarks without a mapping are not used as fixed correspondences. This is the case for
/// contour landmarks, whose vertices are resolved anew in every fitting iteration.
#[derive(Debug, Clone, Default)]
pub struct LandmarkMapper {
    to_vertex: BTreeMap<String, usize>,
    to_name: BTreeMap<usize, String>,
    identity: bool,
}

impl LandmarkMapper {
    /// Creates a mapper from `(name, vertex)` pairs.
    ///
    /// Each name and each vertex may occur only once.
    pub fn new<N: Into<String>>(pairs: impl IntoIterator<Item = (N, usize)>) -> Result<Self> {
        let mut this = Self::default();
        for (name, vertex) in pairs {
            let name = name.into();
            if this.to_vertex.contains_key(&name) {
                return Err(FitError::invalid(format!(
                    "landmark '{name}' is mapped more than once"
                )));
            }
            if let Some(other) = this.to_name.get(&vertex) {
                return Err(FitError::invalid(format!(
                    "vertex {vertex} is mapped to both '{other}' and '{name}'"
                )));
            }
            this.to_name.insert(vertex, name.clone());
            this.to_vertex.insert(name, vertex);
        }
        Ok(this)
    }

    /// Creates a mapper that interprets landmark names as decimal vertex indices.
    pub fn identity() -> Self {
        Self {
            identity: true,
            ..Self::default()
        }
    }

    /// Returns the vertex `name` maps to, if any.
    pub fn vertex(&self, name: &str) -> Option<usize> {
        if self.identity {
            return name.parse().ok();
        }
        self.to_vertex.get(name).copied()
    }

    /// Returns the landmark name mapped to `vertex`, if any.
    pub fn name(&self, vertex: usize) -> Option<String> {
        if self.identity {
            return Some(vertex.to_string());
        }
        self.to_name.get(&vertex).cloned()
    }

    /// Returns the number of explicit mappings (`0` for the identity mapper).
    pub fn len(&self) -> usize {
        self.to_vertex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_vertex.is_empty()
    }

    /// Iterates over all explicit `(name, vertex)` pairs, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.to_vertex.iter().map(|(n, &v)| (n.as_str(), v))
    }
}

/// Loads landmarks from an ibug `.pts` file.
///
/// See [`read_pts`] for details.
pub fn load_pts<P: AsRef<Path>>(path: P) -> anyhow::Result<LandmarkCollection> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("could not open '{}'", path.display()))?;
    read_pts(BufReader::new(file)).with_context(|| format!("invalid .pts file '{}'", path.display()))
}

/// Reads landmarks in the ibug `.pts` format.
///
/// The landmarks are named `"1"`, `"2"`, ... in file order. The format counts pixel coordinates
/// from 1 (the top-left pixel is at `(1, 1)`), so every point is shifted by `-1` to match the
/// 0-based convention used by the rest of the crate.
pub fn read_pts<R: BufRead>(reader: R) -> anyhow::Result<LandmarkCollection> {
    let mut lines = reader.lines();
    // version, n_points, opening brace
    for _ in 0..3 {
        match lines.next() {
            Some(line) => {
                line?;
            }
            None => bail!("unexpected end of file in header"),
        }
    }

    let mut landmarks = LandmarkCollection::new();
    let mut closed = false;
    for line in lines {
        let line = line?;
        let line = line.trim();
        if line == "}" {
            closed = true;
            break;
        }
        if line.is_empty() {
            continue;
        }

        let mut coords = line.split_whitespace().map(str::parse::<f32>);
        let (Some(Ok(x)), Some(Ok(y)), None) = (coords.next(), coords.next(), coords.next()) else {
            bail!("malformed landmark line '{line}'");
        };
        let name = (landmarks.len() + 1).to_string();
        landmarks.insert(Landmark::new(name, Point2::new(x - 1.0, y - 1.0)))?;
    }

    if !closed {
        bail!("missing closing '}}'");
    }
    log::trace!("read {} landmarks", landmarks.len());
    Ok(landmarks)
}
