//! Texture extraction ("isomaps") from images of fitted meshes.
//!
//! An isomap is an image in the texture space of the model: every texel holds the color of the
//! surface point with the corresponding texture coordinate, as seen in the source image. Since all
//! isomaps of a model share the same layout, they can be compared and merged independently of the
//! head pose in the source images.
//!
//! # Coordinates
//!
//! Texture coordinates follow the image convention, with `(0, 0)` at the top-left corner of the
//! isomap. A texel is sampled at its center. Source image pixel coordinates have their origin at
//! the center of the top-left pixel, like the landmarks passed to `morphfit`.

use image::{GenericImageView, Pixel, Rgba, RgbaImage};
use morphfit::{FitResult, Mesh};
use nalgebra::{Matrix3x4, Point2, Vector3};
use thiserror::Error;

/// Barycentric coordinates above `-INSIDE_TOLERANCE` count as inside a triangle, so that texels
/// and pixels on shared edges are not lost to rounding.
const INSIDE_TOLERANCE: f32 = 1e-5;

/// Errors preventing texture extraction.
#[derive(Debug, Error)]
pub enum TextureError {
    #[error("mesh has no texture coordinates")]
    MissingTexcoords,
    #[error("isomap resolution must be positive")]
    EmptyResolution,
}

/// How source image colors are interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// Use the color of the nearest pixel.
    Nearest,
    /// Interpolate bilinearly between the 4 nearest pixels.
    #[default]
    Bilinear,
}

/// Options for [`extract_texture`].
#[derive(Debug, Clone)]
pub struct TextureOptions {
    resolution: u32,
    sampling: Sampling,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            resolution: 512,
            sampling: Sampling::default(),
        }
    }
}

impl TextureOptions {
    /// Sets the width and height of the isomap, in texels. Defaults to 512.
    #[inline]
    pub fn resolution(self, resolution: u32) -> Self {
        Self { resolution, ..self }
    }

    /// Sets the sampling mode. Defaults to [`Sampling::Bilinear`].
    #[inline]
    pub fn sampling(self, sampling: Sampling) -> Self {
        Self { sampling, ..self }
    }
}

/// A mesh vertex projected into the source image.
#[derive(Debug, Clone, Copy)]
struct Projected {
    position: Point2<f32>,
    /// Grows towards the camera.
    depth: f32,
}

/// Extracts the isomap of a [`FitResult`], using the affine approximation of its camera.
pub fn extract_fitted_texture<I>(
    result: &FitResult,
    image: &I,
    options: &TextureOptions,
) -> Result<RgbaImage, TextureError>
where
    I: GenericImageView,
    I::Pixel: Pixel<Subpixel = u8>,
{
    extract_texture(
        result.mesh(),
        &result.camera().affine_camera_matrix(),
        image,
        options,
    )
}

/// Extracts an isomap from `image`.
///
/// `affine_camera` maps homogeneous model points to image coordinates (first two rows) and to a
/// depth value that grows towards the camera (third row), as returned by
/// [`CameraParameters::affine_camera_matrix`].
///
/// Texels are left fully transparent if their surface point faces away from the camera, is
/// hidden behind another part of the mesh, or projects outside of `image`. All other texels are
/// opaque.
///
/// [`CameraParameters::affine_camera_matrix`]: morphfit::CameraParameters::affine_camera_matrix
pub fn extract_texture<I>(
    mesh: &Mesh,
    affine_camera: &Matrix3x4<f32>,
    image: &I,
    options: &TextureOptions,
) -> Result<RgbaImage, TextureError>
where
    I: GenericImageView,
    I::Pixel: Pixel<Subpixel = u8>,
{
    let texcoords = mesh.texcoords().ok_or(TextureError::MissingTexcoords)?;
    if options.resolution == 0 {
        return Err(TextureError::EmptyResolution);
    }

    let projected = mesh
        .vertices()
        .iter()
        .map(|p| {
            let q = affine_camera * p.to_homogeneous();
            Projected {
                position: Point2::new(q.x, q.y),
                depth: q.z,
            }
        })
        .collect::<Vec<_>>();
    let visible = mesh
        .triangles()
        .iter()
        .map(|tri| faces_camera(&tri.map(|v| projected[v as usize].position)))
        .collect::<Vec<_>>();

    let (width, height) = image.dimensions();
    let depth_buffer = DepthBuffer::render(width, height, mesh, &projected, &visible);
    let tolerance = depth_tolerance(&projected);

    let res = options.resolution;
    let mut isomap = RgbaImage::new(res, res);
    let mut sampled = 0;
    for (tri_index, tri) in mesh.triangles().iter().enumerate() {
        if !visible[tri_index] {
            continue;
        }
        let corners = tri.map(|v| projected[v as usize]);
        let uv = tri.map(|v| {
            let [u, v] = texcoords[v as usize];
            Point2::new(u * res as f32, v * res as f32)
        });

        for_each_covered(&uv, res, res, |x, y, bary| {
            let source = interpolate(&bary, &corners.map(|c| c.position.coords));
            let (sx, sy) = (source.x, source.y);
            if !(sx >= -0.5 && sy >= -0.5 && sx < width as f32 - 0.5 && sy < height as f32 - 0.5) {
                return;
            }
            let (px, py) = (sx.round().max(0.0) as u32, sy.round().max(0.0) as u32);

            // Compare this triangle's depth at the center of the pixel the z-buffer was rendered at.
            let pixel_center = Point2::new(px as f32, py as f32);
            let Some(own) = barycentric(&corners.map(|c| c.position), pixel_center) else {
                return;
            };
            let own_depth = interpolate_scalar(&own, &corners.map(|c| c.depth));
            if own_depth < depth_buffer.get(px, py) - tolerance {
                return;
            }

            let color = match options.sampling {
                Sampling::Nearest => image.get_pixel(px, py).to_rgba(),
                Sampling::Bilinear => sample_bilinear(image, sx, sy),
            };
            let Rgba([r, g, b, _]) = color;
            isomap.put_pixel(x, y, Rgba([r, g, b, 255]));
            sampled += 1;
        });
    }

    log::debug!(
        "extracted {res}x{res} isomap from {width}x{height} image, {sampled} of {} texels sampled",
        u64::from(res) * u64::from(res)
    );
    Ok(isomap)
}

/// Returns whether a projected triangle faces the camera.
///
/// Counter-clockwise model triangles appear clockwise in image coordinates (Y down) when they face
/// the camera.
fn faces_camera([a, b, c]: &[Point2<f32>; 3]) -> bool {
    (b - a).perp(&(c - a)) < 0.0
}

/// Returns the depth range that still counts as "at the z-buffer depth".
fn depth_tolerance(projected: &[Projected]) -> f32 {
    let (min, max) = projected
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), p| {
            (min.min(p.depth), max.max(p.depth))
        });
    if max > min {
        (max - min) * 1e-3
    } else {
        1e-3
    }
}

/// Nearest depth of the mesh at every pixel center of the source image.
struct DepthBuffer {
    width: u32,
    depth: Vec<f32>,
}

impl DepthBuffer {
    fn render(
        width: u32,
        height: u32,
        mesh: &Mesh,
        projected: &[Projected],
        visible: &[bool],
    ) -> Self {
        let mut depth = vec![f32::NEG_INFINITY; width as usize * height as usize];
        for (tri, _) in mesh.triangles().iter().zip(visible).filter(|(_, vis)| **vis) {
            let corners = tri.map(|v| projected[v as usize]);
            // Pixel centers are at integer coordinates, shift by half a pixel to reuse the texel
            // rasterizer.
            let shifted = corners.map(|c| c.position + nalgebra::Vector2::new(0.5, 0.5));
            for_each_covered(&shifted, width, height, |x, y, bary| {
                let d = interpolate_scalar(&bary, &corners.map(|c| c.depth));
                let slot = &mut depth[y as usize * width as usize + x as usize];
                if d > *slot {
                    *slot = d;
                }
            });
        }
        Self { width, depth }
    }

    fn get(&self, x: u32, y: u32) -> f32 {
        self.depth[y as usize * self.width as usize + x as usize]
    }
}

/// Calls `f` for every cell of a `width × height` grid whose center `(x + 0.5, y + 0.5)` lies in
/// the triangle, passing the barycentric coordinates of the center.
fn for_each_covered(
    tri: &[Point2<f32>; 3],
    width: u32,
    height: u32,
    mut f: impl FnMut(u32, u32, Vector3<f32>),
) {
    let min_x = tri.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
    let max_x = tri.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
    let min_y = tri.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
    let max_y = tri.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);
    if !(max_x >= 0.0 && max_y >= 0.0 && min_x < width as f32 && min_y < height as f32) {
        return;
    }

    let x0 = (min_x - 0.5).floor().max(0.0) as u32;
    let y0 = (min_y - 0.5).floor().max(0.0) as u32;
    let x1 = ((max_x - 0.5).ceil().max(0.0) as u32).min(width - 1);
    let y1 = ((max_y - 0.5).ceil().max(0.0) as u32).min(height - 1);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let center = Point2::new(x as f32 + 0.5, y as f32 + 0.5);
            if let Some(bary) = barycentric(tri, center) {
                if bary.iter().all(|&b| b >= -INSIDE_TOLERANCE) {
                    f(x, y, bary);
                }
            }
        }
    }
}

/// Returns the barycentric coordinates of `p` with respect to `tri`, or `None` if the triangle is
/// degenerate.
fn barycentric([a, b, c]: &[Point2<f32>; 3], p: Point2<f32>) -> Option<Vector3<f32>> {
    let area = (b - a).perp(&(c - a));
    if area.abs() <= f32::EPSILON {
        return None;
    }
    Some(Vector3::new(
        (c - b).perp(&(p - b)) / area,
        (a - c).perp(&(p - c)) / area,
        (b - a).perp(&(p - a)) / area,
    ))
}

fn interpolate(bary: &Vector3<f32>, values: &[nalgebra::Vector2<f32>; 3]) -> Point2<f32> {
    Point2::from(values[0] * bary[0] + values[1] * bary[1] + values[2] * bary[2])
}

fn interpolate_scalar(bary: &Vector3<f32>, values: &[f32; 3]) -> f32 {
    bary.dot(&Vector3::from(*values))
}

/// Bilinearly interpolates the color at `(x, y)`, clamping to the image edges.
fn sample_bilinear<I>(image: &I, x: f32, y: f32) -> Rgba<u8>
where
    I: GenericImageView,
    I::Pixel: Pixel<Subpixel = u8>,
{
    let (width, height) = image.dimensions();
    let (max_x, max_y) = (width as f32 - 1.0, height as f32 - 1.0);
    let (x, y) = (x.clamp(0.0, max_x), y.clamp(0.0, max_y));
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x1, y1) = ((x0 + 1.0).min(max_x), (y0 + 1.0).min(max_y));

    let px = |x: f32, y: f32| image.get_pixel(x as u32, y as u32).to_rgba();
    let (p00, p10, p01, p11) = (px(x0, y0), px(x1, y0), px(x0, y1), px(x1, y1));

    let mut out = [0; 4];
    for (c, out) in out.iter_mut().enumerate() {
        let top = f32::from(p00[c]) * (1.0 - fx) + f32::from(p10[c]) * fx;
        let bottom = f32::from(p01[c]) * (1.0 - fx) + f32::from(p11[c]) * fx;
        *out = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use morphfit::CameraParameters;
    use nalgebra::{Point3, UnitQuaternion, Vector2};

    use super::*;

    /// A unit quad at depth `z`, with texture coordinates spanning `u_range` horizontally.
    fn quad(z: f32, u_range: [f32; 2], first: u32) -> ([Point3<f32>; 4], [[f32; 2]; 4], [[u32; 3]; 2]) {
        let [u0, u1] = u_range;
        (
            [
                Point3::new(0.0, 0.0, z),
                Point3::new(1.0, 0.0, z),
                Point3::new(1.0, 1.0, z),
                Point3::new(0.0, 1.0, z),
            ],
            [[u0, 1.0], [u1, 1.0], [u1, 0.0], [u0, 0.0]],
            [[first, first + 1, first + 2], [first, first + 2, first + 3]],
        )
    }

    fn mesh(quads: &[([Point3<f32>; 4], [[f32; 2]; 4], [[u32; 3]; 2])]) -> Mesh {
        let vertices = quads.iter().flat_map(|q| q.0).collect();
        let texcoords = quads.iter().flat_map(|q| q.1).collect::<Vec<_>>();
        let triangles = quads.iter().flat_map(|q| q.2).collect::<Vec<_>>();
        Mesh::new(vertices, Arc::from(triangles), Some(Arc::from(texcoords)))
    }

    /// Maps the unit square onto the 8x8 pixel centers, so that texel `(x, y)` of an 8x8 isomap
    /// lands exactly on pixel `(x, y)`.
    fn camera(offset_x: f32) -> Matrix3x4<f32> {
        CameraParameters::orthographic(
            UnitQuaternion::identity(),
            Vector2::new(-1.0 / 16.0 + offset_x, 1.0 / 16.0),
            8.0,
            8,
            8,
        )
        .affine_camera_matrix()
    }

    fn gradient() -> RgbaImage {
        RgbaImage::from_fn(8, 8, |x, y| Rgba([x as u8 * 30, y as u8 * 30, 100, 200]))
    }

    #[test]
    fn frontal_quad_copies_the_image() {
        let mesh = mesh(&[quad(0.0, [0.0, 1.0], 0)]);
        let image = gradient();
        for sampling in [Sampling::Nearest, Sampling::Bilinear] {
            let options = TextureOptions::default().resolution(8).sampling(sampling);
            let isomap = extract_texture(&mesh, &camera(0.0), &image, &options).unwrap();
            for (x, y, texel) in isomap.enumerate_pixels() {
                let Rgba([r, g, b, _]) = *image.get_pixel(x, y);
                assert_eq!(*texel, Rgba([r, g, b, 255]), "texel ({x}, {y}) with {sampling:?}");
            }
        }
    }

    #[test]
    fn back_facing_triangles_are_skipped() {
        let (vertices, texcoords, triangles) = quad(0.0, [0.0, 1.0], 0);
        let flipped = triangles.map(|[a, b, c]| [a, c, b]);
        let mesh = mesh(&[(vertices, texcoords, flipped)]);
        let options = TextureOptions::default().resolution(8);
        let isomap = extract_texture(&mesh, &camera(0.0), &gradient(), &options).unwrap();
        assert!(isomap.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn texels_outside_the_image_are_transparent() {
        let mesh = mesh(&[quad(0.0, [0.0, 1.0], 0)]);
        let options = TextureOptions::default()
            .resolution(8)
            .sampling(Sampling::Nearest);
        // Shift the quad right by half its width.
        let isomap = extract_texture(&mesh, &camera(0.5), &gradient(), &options).unwrap();
        for (x, _, texel) in isomap.enumerate_pixels() {
            assert_eq!(texel[3] == 255, x < 4, "texel column {x}");
        }
    }

    #[test]
    fn occluded_texels_are_transparent() {
        // The quad at z = 1 is in front of the one at z = 0.
        let mesh = mesh(&[quad(0.0, [0.0, 0.5], 0), quad(1.0, [0.5, 1.0], 4)]);
        let options = TextureOptions::default().resolution(8);
        let isomap = extract_texture(&mesh, &camera(0.0), &gradient(), &options).unwrap();
        for (x, _, texel) in isomap.enumerate_pixels() {
            assert_eq!(texel[3] == 255, x >= 4, "texel column {x}");
        }
    }

    #[test]
    fn errors() {
        let without_texcoords = Mesh::new(
            vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0)],
            Arc::from(vec![[0, 1, 2]]),
            None,
        );
        assert!(matches!(
            extract_texture(&without_texcoords, &camera(0.0), &gradient(), &TextureOptions::default()),
            Err(TextureError::MissingTexcoords)
        ));

        let mesh = mesh(&[quad(0.0, [0.0, 1.0], 0)]);
        assert!(matches!(
            extract_texture(&mesh, &camera(0.0), &gradient(), &TextureOptions::default().resolution(0)),
            Err(TextureError::EmptyResolution)
        ));
    }

    #[test]
    fn bilinear_sampling() {
        let image = RgbaImage::from_fn(2, 2, |x, _| {
            if x == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([200, 100, 50, 255])
            }
        });
        assert_eq!(sample_bilinear(&image, 0.5, 0.5), Rgba([100, 50, 25, 255]));
        assert_eq!(sample_bilinear(&image, 0.25, 1.0), Rgba([50, 25, 13, 255]));
        // Clamped to the edge.
        assert_eq!(sample_bilinear(&image, 3.0, -1.0), Rgba([200, 100, 50, 255]));
    }
}
