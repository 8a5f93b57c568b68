//! Rectification kernel: per-eye undistortion maps precomputed from the
//! calibration, applied by bilinear remap.

use anyhow::{bail, Result};
use nalgebra::Matrix4;
use ndarray::{Array2, Array3};

use crate::calib::{CalibPair, CalibrationModel, Extrinsics, Intrinsics};
use crate::mat::Mat;
use crate::pipeline::payload::{MatSample, Payload};

/// Sampling grid for one eye: output pixel (v, u) reads the source image at
/// (map_y[v,u], map_x[v,u]).
pub struct RectifyMaps {
    map_x: Array2<f32>,
    map_y: Array2<f32>,
}

impl RectifyMaps {
    fn build(intr: &Intrinsics) -> Self {
        let (w, h) = (intr.width as usize, intr.height as usize);
        let mut map_x = Array2::<f32>::zeros((h, w));
        let mut map_y = Array2::<f32>::zeros((h, w));
        for v in 0..h {
            for u in 0..w {
                let x = (u as f64 - intr.cx) / intr.fx;
                let y = (v as f64 - intr.cy) / intr.fy;
                let (xd, yd) = match intr.model {
                    CalibrationModel::Pinhole => distort_radtan(x, y, &intr.coeffs),
                    CalibrationModel::KannalaBrandt => distort_equidistant(x, y, &intr.coeffs),
                    CalibrationModel::Unknown => (x, y),
                };
                map_x[[v, u]] = (intr.fx * xd + intr.cx) as f32;
                map_y[[v, u]] = (intr.fy * yd + intr.cy) as f32;
            }
        }
        Self { map_x, map_y }
    }

    fn remap(&self, src: &Array3<u8>) -> Array3<u8> {
        let (h, w) = self.map_x.dim();
        let (sh, sw, c) = src.dim();
        let mut out = Array3::<u8>::zeros((h, w, c));
        for v in 0..h {
            for u in 0..w {
                let sx = self.map_x[[v, u]].clamp(0.0, (sw - 1) as f32);
                let sy = self.map_y[[v, u]].clamp(0.0, (sh - 1) as f32);
                let x0 = sx.floor() as usize;
                let y0 = sy.floor() as usize;
                let x1 = (x0 + 1).min(sw - 1);
                let y1 = (y0 + 1).min(sh - 1);
                let ax = sx - x0 as f32;
                let ay = sy - y0 as f32;
                for ch in 0..c {
                    let top = src[[y0, x0, ch]] as f32 * (1.0 - ax) + src[[y0, x1, ch]] as f32 * ax;
                    let bot = src[[y1, x0, ch]] as f32 * (1.0 - ax) + src[[y1, x1, ch]] as f32 * ax;
                    out[[v, u, ch]] = (top * (1.0 - ay) + bot * ay).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        out
    }
}

// Radial-tangential model, coeffs = (k1, k2, p1, p2, k3).
fn distort_radtan(x: f64, y: f64, k: &[f64; 5]) -> (f64, f64) {
    let r2 = x * x + y * y;
    let radial = 1.0 + k[0] * r2 + k[1] * r2 * r2 + k[4] * r2 * r2 * r2;
    let xd = x * radial + 2.0 * k[2] * x * y + k[3] * (r2 + 2.0 * x * x);
    let yd = y * radial + k[2] * (r2 + 2.0 * y * y) + 2.0 * k[3] * x * y;
    (xd, yd)
}

// Equidistant model, coeffs[0..4] are the theta-polynomial coefficients.
fn distort_equidistant(x: f64, y: f64, k: &[f64; 5]) -> (f64, f64) {
    let r = (x * x + y * y).sqrt();
    if r < 1e-9 {
        return (x, y);
    }
    let theta = r.atan();
    let t2 = theta * theta;
    let theta_d = theta * (1.0 + k[0] * t2 + k[1] * t2 * t2 + k[2] * t2 * t2 * t2 + k[3] * t2 * t2 * t2 * t2);
    let scale = theta_d / r;
    (x * scale, y * scale)
}

/// Reprojection matrix mapping (u, v, disparity, 1) homogeneously to 3D,
/// in the left rectified camera frame.
pub fn reprojection_matrix(left: &Intrinsics, extrinsics: &Extrinsics) -> Matrix4<f64> {
    let b = extrinsics.baseline();
    #[rustfmt::skip]
    let q = Matrix4::new(
        1.0, 0.0, 0.0,     -left.cx,
        0.0, 1.0, 0.0,     -left.cy,
        0.0, 0.0, 0.0,      left.fx,
        0.0, 0.0, 1.0 / b,  0.0,
    );
    q
}

/// Rectify stage kernel. Holds the sampling maps for both eyes plus the
/// derived parameters downstream kernels are constructed from.
pub struct RectifyKernel {
    left: RectifyMaps,
    right: RectifyMaps,
    pub q: Matrix4<f64>,
    pub pair: CalibPair,
}

impl RectifyKernel {
    pub fn new(pair: CalibPair) -> Self {
        Self {
            left: RectifyMaps::build(&pair.left),
            right: RectifyMaps::build(&pair.right),
            q: reprojection_matrix(&pair.left, &pair.extrinsics),
            pair,
        }
    }

    /// Rebuild maps and derived parameters from fresh calibration.
    pub fn reload(&mut self, pair: CalibPair) {
        self.left = RectifyMaps::build(&pair.left);
        self.right = RectifyMaps::build(&pair.right);
        self.q = reprojection_matrix(&pair.left, &pair.extrinsics);
        self.pair = pair;
    }

    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        let Some((left, right)) = input.as_pair() else {
            bail!("rectify expects a paired input");
        };
        let l = left.mat.as_u8().ok_or_else(|| anyhow::anyhow!("rectify expects u8 images"))?;
        let r = right.mat.as_u8().ok_or_else(|| anyhow::anyhow!("rectify expects u8 images"))?;
        Ok(Payload::Pair {
            left: MatSample {
                mat: Mat::U8(self.left.remap(l)),
                frame_id: left.frame_id,
                meta: left.meta,
            },
            right: MatSample {
                mat: Mat::U8(self.right.remap(r)),
                frame_id: right.frame_id,
                meta: right.meta,
            },
        })
    }
}
