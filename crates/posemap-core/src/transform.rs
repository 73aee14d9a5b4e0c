//! Affine rotation/scale warps shared across co-registered image stacks.
//!
//! One (angle, scale) pair is drawn per call and turned into a single 2x3
//! matrix; every array in the call is warped with that same matrix so that
//! input frames and their label confidence maps stay registered. Warping
//! uses inverse-mapping bilinear sampling with zero fill outside the
//! source image.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};

/// Row-major 2x3 affine matrix mapping source (x, y) to destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2x3 {
    pub m: [[f32; 3]; 2],
}

impl Affine2x3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    /// Rotation by `angle_deg` (counter-clockwise, degrees) with uniform
    /// `scale` about `center` = (cx, cy) in pixel coordinates.
    pub fn rotation_about(center: (f32, f32), angle_deg: f32, scale: f32) -> Self {
        let theta = angle_deg.to_radians();
        let a = scale * theta.cos();
        let b = scale * theta.sin();
        let (cx, cy) = center;
        Self {
            m: [
                [a, b, (1.0 - a) * cx - b * cy],
                [-b, a, b * cx + (1.0 - a) * cy],
            ],
        }
    }

    /// Apply to a point.
    #[inline]
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.m[0][2],
            self.m[1][0] * x + self.m[1][1] * y + self.m[1][2],
        )
    }

    /// Inverse transform; fails on a singular matrix.
    pub fn invert(&self) -> Result<Self> {
        let det = self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0];
        if det.abs() < 1e-12 {
            return Err(Error::Config("affine matrix is singular".into()));
        }
        let inv = 1.0 / det;
        let a = self.m[1][1] * inv;
        let b = -self.m[0][1] * inv;
        let c = -self.m[1][0] * inv;
        let d = self.m[0][0] * inv;
        let tx = -(a * self.m[0][2] + b * self.m[1][2]);
        let ty = -(c * self.m[0][2] + d * self.m[1][2]);
        Ok(Self {
            m: [[a, b, tx], [c, d, ty]],
        })
    }
}

/// Scalar augmentation parameter: a fixed value or a uniform interval.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Jitter {
    Fixed(f32),
    Uniform { lo: f32, hi: f32 },
}

impl Jitter {
    /// Draw a value. Interval endpoints may be given in either order; a
    /// degenerate interval collapses to its single endpoint.
    pub fn sample(&self, rng: &mut StdRng) -> f32 {
        match *self {
            Jitter::Fixed(v) => v,
            Jitter::Uniform { lo, hi } => {
                let (a, b) = (lo.min(hi), lo.max(hi));
                if b > a {
                    rng.random_range(a..b)
                } else {
                    a
                }
            }
        }
    }
}

/// Rotation-center convention for augmentation warps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenterMode {
    /// (h/2, h/2): the height is reused for both coordinates. Exact only
    /// for square images; matches the historical exporter convention.
    #[default]
    HalfHeight,
    /// (w/2, h/2): the geometric image center.
    Centered,
}

impl CenterMode {
    /// Center point for an (h, w) image.
    pub fn center(&self, h: usize, w: usize) -> (f32, f32) {
        match self {
            CenterMode::HalfHeight => (h as f32 / 2.0, h as f32 / 2.0),
            CenterMode::Centered => (w as f32 / 2.0, h as f32 / 2.0),
        }
    }
}

/// Rotation/scale jitter configuration for augmentation calls.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AffineJitter {
    /// Rotation angle in degrees.
    pub angle_deg: Jitter,
    /// Uniform scale factor.
    pub scale: Jitter,
    /// Rotation-center convention.
    pub center: CenterMode,
}

impl Default for AffineJitter {
    fn default() -> Self {
        Self {
            angle_deg: Jitter::Uniform {
                lo: -180.0,
                hi: 180.0,
            },
            scale: Jitter::Fixed(1.0),
            center: CenterMode::HalfHeight,
        }
    }
}

/// One drawn (angle, scale) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotScale {
    pub angle_deg: f32,
    pub scale: f32,
}

impl AffineJitter {
    /// Draw one (angle, scale) pair.
    pub fn draw(&self, rng: &mut StdRng) -> RotScale {
        RotScale {
            angle_deg: self.angle_deg.sample(rng),
            scale: self.scale.sample(rng),
        }
    }

    /// Matrix for a draw over an (h, w) image.
    pub fn matrix(&self, draw: RotScale, h: usize, w: usize) -> Affine2x3 {
        Affine2x3::rotation_about(self.center.center(h, w), draw.angle_deg, draw.scale)
    }
}

/// Sample a plane at a sub-pixel position using bilinear interpolation.
/// Neighbors outside the plane contribute zero.
#[inline]
fn bilinear_zero(img: &ArrayView2<'_, f32>, x: f32, y: f32) -> f32 {
    let (h, w) = img.dim();
    let x0f = x.floor();
    let y0f = y.floor();
    let fx = x - x0f;
    let fy = y - y0f;
    let x0 = x0f as isize;
    let y0 = y0f as isize;
    let at = |r: isize, c: isize| -> f32 {
        if r < 0 || c < 0 || r >= h as isize || c >= w as isize {
            0.0
        } else {
            img[[r as usize, c as usize]]
        }
    };
    let p00 = at(y0, x0);
    let p10 = at(y0, x0 + 1);
    let p01 = at(y0 + 1, x0);
    let p11 = at(y0 + 1, x0 + 1);
    (1.0 - fx) * (1.0 - fy) * p00
        + fx * (1.0 - fy) * p10
        + (1.0 - fx) * fy * p01
        + fx * fy * p11
}

/// Warp a single (h, w) plane with `m`. Each destination pixel is sampled
/// from the inverse-mapped source position; output size equals input size.
pub fn warp_plane(img: ArrayView2<'_, f32>, m: &Affine2x3) -> Result<Array2<f32>> {
    let inv = m.invert()?;
    Ok(warp_plane_inv(&img, &inv))
}

fn warp_plane_inv(img: &ArrayView2<'_, f32>, inv: &Affine2x3) -> Array2<f32> {
    let (h, w) = img.dim();
    let mut out = Array2::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let (sx, sy) = inv.apply(c as f32, r as f32);
            out[[r, c]] = bilinear_zero(img, sx, sy);
        }
    }
    out
}

/// Warp every channel of a (c, h, w) stack with the same matrix.
pub fn warp_channels(img: ArrayView3<'_, f32>, m: &Affine2x3) -> Result<Array3<f32>> {
    let inv = m.invert()?;
    let (ch, h, w) = img.dim();
    let mut out = Array3::zeros((ch, h, w));
    for (i, plane) in img.axis_iter(Axis(0)).enumerate() {
        out.index_axis_mut(Axis(0), i)
            .assign(&warp_plane_inv(&plane, &inv));
    }
    Ok(out)
}

/// One augmentation operand: a bare plane or a channel-first stack.
#[derive(Debug, Clone, PartialEq)]
pub enum MapArray {
    Plane(Array2<f32>),
    Stack(Array3<f32>),
}

impl MapArray {
    /// (height, width) of the underlying image.
    pub fn hw(&self) -> (usize, usize) {
        match self {
            MapArray::Plane(a) => a.dim(),
            MapArray::Stack(a) => {
                let (_, h, w) = a.dim();
                (h, w)
            }
        }
    }
}

/// Transform a group of co-registered arrays with one shared draw.
///
/// All arrays must share the same height and width; the center is taken
/// from the first array. Inputs are never mutated; the result holds newly
/// allocated warped copies in input order.
pub fn transform_imgs(
    images: &[MapArray],
    jitter: &AffineJitter,
    rng: &mut StdRng,
) -> Result<Vec<MapArray>> {
    let Some(first) = images.first() else {
        return Err(Error::Shape("transform_imgs: empty image list".into()));
    };
    let (h, w) = first.hw();
    for img in images {
        if img.hw() != (h, w) {
            let (ih, iw) = img.hw();
            return Err(Error::Shape(format!(
                "transform_imgs: expected {h}x{w} images, got {ih}x{iw}"
            )));
        }
    }
    let m = jitter.matrix(jitter.draw(rng), h, w);
    images
        .iter()
        .map(|img| match img {
            MapArray::Plane(a) => Ok(MapArray::Plane(warp_plane(a.view(), &m)?)),
            MapArray::Stack(a) => Ok(MapArray::Stack(warp_channels(a.view(), &m)?)),
        })
        .collect()
}

/// Single-array convenience wrapper: one array in, one array out.
pub fn transform_img(
    image: &MapArray,
    jitter: &AffineJitter,
    rng: &mut StdRng,
) -> Result<MapArray> {
    let mut out = transform_imgs(std::slice::from_ref(image), jitter, rng)?;
    Ok(out.swap_remove(0))
}

/// Transform an (input, label) channel-first pair with one shared draw.
/// This is the sampler hot path; both stacks must share height and width.
pub fn transform_pair(
    x: ArrayView3<'_, f32>,
    y: ArrayView3<'_, f32>,
    jitter: &AffineJitter,
    rng: &mut StdRng,
) -> Result<(Array3<f32>, Array3<f32>)> {
    let (_, hx, wx) = x.dim();
    let (_, hy, wy) = y.dim();
    if (hx, wx) != (hy, wy) {
        return Err(Error::Shape(format!(
            "transform_pair: input is {hx}x{wx} but label is {hy}x{wy}"
        )));
    }
    let m = jitter.matrix(jitter.draw(rng), hx, wx);
    Ok((warp_channels(x, &m)?, warp_channels(y, &m)?))
}
