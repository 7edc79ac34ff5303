//! Box Renderer
//!
//! Draws detection polygons onto copies of image arrays. One call draws one
//! polygon; callers thread the returned array through successive calls to
//! draw several.

pub mod bridge;

pub use bridge::{array_to_image, image_to_array};

use image::{Rgb, Rgba};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_polygon_mut, Canvas};
use imageproc::point::Point as PixelPoint;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bridge::{array_from_buffer, buffer_from_array};

/// Errors raised when an array does not look like an image
#[derive(Debug, Error)]
pub enum RenderError {
    /// Only RGB and RGBA arrays can be drawn on
    #[error("unsupported channel count {0}, expected 3 or 4")]
    UnsupportedChannels(usize),
    /// Array dimensions do not fit an image buffer
    #[error("array of shape ({height}, {width}, {channels}) is not a valid image")]
    Shape {
        height: usize,
        width: usize,
        channels: usize,
    },
}

/// Integer pixel coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// RGBA stroke color; the alpha byte only reaches 4-channel images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const GREEN: Color = Color([0, 255, 0, 255]);

    fn rgb(self) -> Rgb<u8> {
        let [r, g, b, _] = self.0;
        Rgb([r, g, b])
    }

    fn rgba(self) -> Rgba<u8> {
        Rgba(self.0)
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::GREEN
    }
}

/// Stroke settings used for detection boxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Box outline color
    pub color: Color,
    /// Box outline width in pixels
    pub thickness: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            color: Color::GREEN,
            thickness: 2,
        }
    }
}

/// Draw one polyline onto a copy of `image`
///
/// Consecutive points are connected; when `closed` is set the last point is
/// also connected back to the first. Fewer than two points draws nothing.
/// The input array is never modified.
pub fn draw_polyline(
    image: &Array3<u8>,
    points: &[Point],
    closed: bool,
    color: Color,
    thickness: u32,
) -> Result<Array3<u8>, RenderError> {
    let channels = image.dim().2;
    if channels != 3 && channels != 4 {
        return Err(RenderError::UnsupportedChannels(channels));
    }

    if points.len() < 2 {
        return Ok(image.clone());
    }

    let stroke = Stroke::new(points, closed, thickness);

    if channels == 3 {
        let mut canvas = buffer_from_array::<Rgb<u8>>(image)?;
        stroke.draw(&mut canvas, color.rgb());
        Ok(array_from_buffer(&canvas))
    } else {
        let mut canvas = buffer_from_array::<Rgba<u8>>(image)?;
        stroke.draw(&mut canvas, color.rgba());
        Ok(array_from_buffer(&canvas))
    }
}

/// Line segments of a polyline plus its stroke width
struct Stroke {
    segments: Vec<(Point, Point)>,
    joints: Vec<Point>,
    thickness: u32,
}

impl Stroke {
    fn new(points: &[Point], closed: bool, thickness: u32) -> Self {
        let mut segments: Vec<(Point, Point)> = points.windows(2).map(|w| (w[0], w[1])).collect();
        if closed {
            segments.push((points[points.len() - 1], points[0]));
        }

        // Round joints where segments meet
        let joints = if closed {
            points.to_vec()
        } else {
            points[1..points.len() - 1].to_vec()
        };

        Self {
            segments,
            joints,
            thickness: thickness.max(1),
        }
    }

    fn draw<C: Canvas>(&self, canvas: &mut C, color: C::Pixel) {
        if self.thickness == 1 {
            for (start, end) in &self.segments {
                draw_line_segment_mut(
                    canvas,
                    (start.x as f32, start.y as f32),
                    (end.x as f32, end.y as f32),
                    color,
                );
            }
            return;
        }

        let (near, far) = normal_span(self.thickness);
        let radius = near as i32;

        for (start, end) in &self.segments {
            match segment_quad(*start, *end, near, far) {
                Some(quad) => draw_polygon_mut(canvas, &quad, color),
                None => draw_filled_circle_mut(canvas, (start.x, start.y), radius, color),
            }
        }

        for joint in &self.joints {
            draw_filled_circle_mut(canvas, (joint.x, joint.y), radius, color);
        }
    }
}

/// Pixel rows covered on each side of a segment, excluding the segment's own row
///
/// `near + far + 1 == thickness`. Even widths put the extra row on the `far`
/// side, which is the outside of a clockwise polygon.
fn normal_span(thickness: u32) -> (f32, f32) {
    let near = (thickness - 1) / 2;
    let far = thickness / 2;
    (near as f32, far as f32)
}

/// Quad covering a segment from `+near` to `-far` along its normal, `None`
/// for zero-length segments
///
/// imageproc fills polygons inclusively, so a quad spanning `near + far`
/// pixels paints `near + far + 1` rows.
fn segment_quad(start: Point, end: Point, near: f32, far: f32) -> Option<[PixelPoint<i32>; 4]> {
    let dx = (end.x - start.x) as f32;
    let dy = (end.y - start.y) as f32;
    let len = dx.hypot(dy);
    if len < f32::EPSILON {
        return None;
    }

    // Unit normal, pointing right of the direction of travel in image coordinates
    let nx = -dy / len;
    let ny = dx / len;

    let offset = |p: Point, dist: f32| {
        PixelPoint::new(
            (p.x as f32 + dist * nx).round() as i32,
            (p.y as f32 + dist * ny).round() as i32,
        )
    };

    Some([
        offset(start, near),
        offset(end, near),
        offset(end, -far),
        offset(start, -far),
    ])
}
