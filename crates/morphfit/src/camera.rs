//! Camera parameters mapping model space to image space.

use std::fmt;

use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, UnitQuaternion, Vector2, Vector3};

/// The projection model a camera is estimated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionModel {
    /// Scaled orthographic (weak perspective) projection.
    #[default]
    Orthographic,
    /// Pinhole projection with the principal point at the image center.
    Perspective,
}

/// Projection-specific camera parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Scaled orthographic projection: one model unit spans `scale` pixels.
    Orthographic { scale: f32 },
    /// Pinhole projection with a focal length in pixels.
    Perspective { focal_length: f32 },
}

impl Projection {
    pub fn model(&self) -> ProjectionModel {
        match self {
            Projection::Orthographic { .. } => ProjectionModel::Orthographic,
            Projection::Perspective { .. } => ProjectionModel::Perspective,
        }
    }
}

/// Head orientation as Euler angles, in radians.
///
/// Yaw rotates about the Y axis (turning the head sideways), pitch about the X axis (nodding) and
/// roll about the Z axis (tilting).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl EulerAngles {
    pub fn to_degrees(self) -> Self {
        Self {
            yaw: self.yaw.to_degrees(),
            pitch: self.pitch.to_degrees(),
            roll: self.roll.to_degrees(),
        }
    }
}

/// One image-space equation of a projected point, linear in the point's model-space position.
///
/// For a model point `p`, `coefficients · p + offset` is the (approximate) signed pixel residual
/// between the projection of `p` and the observation the row was built for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionRow {
    pub coefficients: Vector3<f64>,
    pub offset: f64,
}

impl ProjectionRow {
    #[inline]
    pub fn residual(&self, p: &Vector3<f64>) -> f64 {
        self.coefficients.dot(p) + self.offset
    }
}

/// A camera pose together with its projection.
///
/// The rotation and translation map model space into camera space, where the camera looks down
/// the negative Z axis and Y points up. Image coordinates have Y pointing down, so projection
/// flips the Y axis at the image height.
///
/// Orthographic cameras only use the X and Y components of the translation, which are given in
/// model units before scaling. Perspective cameras need a negative Z translation to place the
/// model in front of the camera.
#[derive(Clone, Copy, PartialEq)]
pub struct CameraParameters {
    rotation: UnitQuaternion<f32>,
    translation: Vector3<f32>,
    projection: Projection,
    image_width: u32,
    image_height: u32,
}

impl CameraParameters {
    /// Creates a scaled orthographic camera.
    pub fn orthographic(
        rotation: UnitQuaternion<f32>,
        translation: Vector2<f32>,
        scale: f32,
        image_width: u32,
        image_height: u32,
    ) -> Self {
        Self {
            rotation,
            translation: Vector3::new(translation.x, translation.y, 0.0),
            projection: Projection::Orthographic { scale },
            image_width,
            image_height,
        }
    }

    /// Creates a perspective camera with the principal point at the image center.
    pub fn perspective(
        rotation: UnitQuaternion<f32>,
        translation: Vector3<f32>,
        focal_length: f32,
        image_width: u32,
        image_height: u32,
    ) -> Self {
        Self {
            rotation,
            translation,
            projection: Projection::Perspective { focal_length },
            image_width,
            image_height,
        }
    }

    #[inline]
    pub fn rotation(&self) -> UnitQuaternion<f32> {
        self.rotation
    }

    #[inline]
    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    #[inline]
    pub fn translation(&self) -> Vector3<f32> {
        self.translation
    }

    #[inline]
    pub fn projection(&self) -> Projection {
        self.projection
    }

    #[inline]
    pub fn projection_model(&self) -> ProjectionModel {
        self.projection.model()
    }

    #[inline]
    pub fn image_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    /// Returns the number of pixels a model unit at the model origin spans.
    ///
    /// This is the orthographic scale, or the focal length divided by the depth of the model
    /// origin for perspective cameras.
    pub fn scale(&self) -> f32 {
        match self.projection {
            Projection::Orthographic { scale } => scale,
            Projection::Perspective { focal_length } => focal_length / -self.translation.z,
        }
    }

    /// Returns the vertical field of view in degrees, or `None` for orthographic cameras.
    pub fn fov_y(&self) -> Option<f32> {
        match self.projection {
            Projection::Orthographic { .. } => None,
            Projection::Perspective { focal_length } => Some(
                (2.0 * (self.image_height as f32 / 2.0 / focal_length).atan()).to_degrees(),
            ),
        }
    }

    /// Returns the orientation of the model relative to the camera as Euler angles.
    ///
    /// The angles decompose the rotation as `R = Rz(roll)·Ry(yaw)·Rx(pitch)`: pitch is applied
    /// first, roll last.
    pub fn euler_angles(&self) -> EulerAngles {
        let q = self.rotation.quaternion();
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);
        EulerAngles {
            yaw: (-2.0 * (x * z - w * y)).clamp(-1.0, 1.0).asin(),
            pitch: (2.0 * (y * z + w * x)).atan2(w * w - x * x - y * y + z * z),
            roll: (2.0 * (x * y + w * z)).atan2(w * w + x * x - y * y - z * z),
        }
    }

    /// Transforms a model-space point into camera space.
    #[inline]
    pub fn to_camera(&self, p: &Point3<f32>) -> Point3<f32> {
        self.rotation * p + self.translation
    }

    /// Projects a model-space point into image coordinates.
    pub fn project(&self, p: &Point3<f32>) -> Point2<f32> {
        let c = self.to_camera(p);
        let (w, h) = (self.image_width as f32, self.image_height as f32);
        match self.projection {
            Projection::Orthographic { scale } => Point2::new(scale * c.x, h - scale * c.y),
            Projection::Perspective { focal_length } => {
                let depth = -c.z;
                Point2::new(
                    w / 2.0 + focal_length * c.x / depth,
                    h / 2.0 - focal_length * c.y / depth,
                )
            }
        }
    }

    /// Returns the distance of `p` in front of the camera, along the viewing axis.
    ///
    /// Orthographic cameras have no meaningful depth; the camera-space Z coordinate is negated so
    /// that larger values are still farther away.
    #[inline]
    pub fn depth(&self, p: &Point3<f32>) -> f32 {
        -self.to_camera(p).z
    }

    /// Returns the model-space direction from `p` towards the camera.
    ///
    /// The result is not normalized for perspective cameras.
    pub fn direction_to_camera(&self, p: &Point3<f32>) -> Vector3<f32> {
        match self.projection {
            Projection::Orthographic { .. } => self.rotation.inverse() * Vector3::z(),
            Projection::Perspective { .. } => {
                let center = self.rotation.inverse() * -self.translation;
                center - p.coords
            }
        }
    }

    /// Linearizes the projection of a model point near `p` against an observed image position.
    ///
    /// The returned rows express the X and Y pixel residuals as linear functions of the model
    /// point. For orthographic cameras they are exact. For perspective cameras the equations are
    /// multiplied through by the depth and divided by the depth of `p`, which makes them exact at
    /// `p` and keeps the residuals in pixel units nearby.
    pub fn linearize(&self, p: &Point3<f32>, observed: &Point2<f32>) -> [ProjectionRow; 2] {
        let r = self.rotation_matrix().cast::<f64>();
        let (r1, r2, r3) = (
            r.row(0).transpose(),
            r.row(1).transpose(),
            r.row(2).transpose(),
        );
        let t = self.translation.cast::<f64>();
        let (ox, oy) = (f64::from(observed.x), f64::from(observed.y));
        let (w, h) = (f64::from(self.image_width), f64::from(self.image_height));

        match self.projection {
            Projection::Orthographic { scale } => {
                let s = f64::from(scale);
                [
                    ProjectionRow {
                        coefficients: r1 * s,
                        offset: s * t.x - ox,
                    },
                    ProjectionRow {
                        coefficients: -r2 * s,
                        offset: h - s * t.y - oy,
                    },
                ]
            }
            Projection::Perspective { focal_length } => {
                let f = f64::from(focal_length);
                let depth = f64::from(self.depth(p)).max(f64::EPSILON);
                let du = ox - w / 2.0;
                let dv = h / 2.0 - oy;
                [
                    ProjectionRow {
                        coefficients: (r1 * f + r3 * du) / depth,
                        offset: (f * t.x + du * t.z) / depth,
                    },
                    ProjectionRow {
                        coefficients: -(r2 * f + r3 * dv) / depth,
                        offset: -(f * t.y + dv * t.z) / depth,
                    },
                ]
            }
        }
    }

    /// Returns the 3x4 affine camera matrix of this camera.
    ///
    /// The first two rows map homogeneous model points to image coordinates. The third row yields
    /// a value that grows towards the camera, suitable for depth testing.
    ///
    /// Perspective cameras are approximated by a weak perspective camera around the model origin.
    #[rustfmt::skip]
    pub fn affine_camera_matrix(&self) -> Matrix3x4<f32> {
        let r = self.rotation_matrix();
        let t = self.translation;
        let (w, h) = (self.image_width as f32, self.image_height as f32);
        let (s, cx, cy) = match self.projection {
            Projection::Orthographic { scale } => (scale, 0.0, h),
            Projection::Perspective { .. } => (self.scale(), w / 2.0, h / 2.0),
        };
        Matrix3x4::new(
            s * r[(0, 0)], s * r[(0, 1)], s * r[(0, 2)], cx + s * t.x,
            -s * r[(1, 0)], -s * r[(1, 1)], -s * r[(1, 2)], cy - s * t.y,
            s * r[(2, 0)], s * r[(2, 1)], s * r[(2, 2)], 0.0,
        )
    }
}

impl fmt::Debug for CameraParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let angles = self.euler_angles().to_degrees();
        f.debug_struct("CameraParameters")
            .field("projection", &self.projection)
            .field("yaw", &angles.yaw)
            .field("pitch", &angles.pitch)
            .field("roll", &angles.roll)
            .field("translation", &self.translation)
            .field("image_size", &(self.image_width, self.image_height))
            .finish()
    }
}

/// Converts a vertical field of view in degrees to a focal length in pixels.
pub fn focal_length_from_fov(fov_y_degrees: f32, image_height: u32) -> f32 {
    image_height as f32 / 2.0 / (fov_y_degrees.to_radians() / 2.0).tan()
}
