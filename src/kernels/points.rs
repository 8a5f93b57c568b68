//! 3D point kernels.
//!
//! The pinhole variant reprojects disparity through the Q matrix produced by
//! rectification. The Kannala-Brandt variant runs after the depth stage and
//! unprojects depth through the equidistant model.

use anyhow::{bail, Result};
use nalgebra::{Matrix4, Vector4};
use ndarray::Array3;

use crate::calib::CalibPair;
use crate::mat::Mat;
use crate::pipeline::payload::{MatSample, Payload};

pub enum PointsKernel {
    Pinhole { q: Matrix4<f64> },
    KannalaBrandt { pair: CalibPair },
}

impl PointsKernel {
    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        let Some(sample) = input.as_single() else {
            bail!("points expects a single input");
        };
        let mat = match self {
            PointsKernel::Pinhole { q } => {
                let disp = sample
                    .mat
                    .as_f32()
                    .ok_or_else(|| anyhow::anyhow!("pinhole points expects f32 disparity"))?;
                reproject_disparity(disp, q)
            }
            PointsKernel::KannalaBrandt { pair } => {
                let depth = sample
                    .mat
                    .as_u16()
                    .ok_or_else(|| anyhow::anyhow!("equidistant points expects u16 depth"))?;
                unproject_depth(depth, pair)
            }
        };
        Ok(Payload::Single(MatSample {
            mat: Mat::F32(mat),
            frame_id: sample.frame_id,
            meta: sample.meta,
        }))
    }

    /// Refresh the derived parameters after a calibration reload.
    pub fn reload(&mut self, q: Matrix4<f64>, pair: CalibPair) {
        match self {
            PointsKernel::Pinhole { q: old } => *old = q,
            PointsKernel::KannalaBrandt { pair: old } => *old = pair,
        }
    }
}

fn reproject_disparity(disp: &Array3<f32>, q: &Matrix4<f64>) -> Array3<f32> {
    let (h, w, _) = disp.dim();
    let mut points = Array3::<f32>::zeros((h, w, 3));
    for v in 0..h {
        for u in 0..w {
            let d = disp[[v, u, 0]] as f64;
            if d <= 0.0 {
                continue;
            }
            let p = q * Vector4::new(u as f64, v as f64, d, 1.0);
            if p.w.abs() < 1e-12 {
                continue;
            }
            points[[v, u, 0]] = (p.x / p.w) as f32;
            points[[v, u, 1]] = (p.y / p.w) as f32;
            points[[v, u, 2]] = (p.z / p.w) as f32;
        }
    }
    points
}

fn unproject_depth(depth: &Array3<u16>, pair: &CalibPair) -> Array3<f32> {
    let intr = &pair.left;
    let (h, w, _) = depth.dim();
    let mut points = Array3::<f32>::zeros((h, w, 3));
    for v in 0..h {
        for u in 0..w {
            let z = depth[[v, u, 0]] as f64 / 1000.0;
            if z <= 0.0 {
                continue;
            }
            let mx = (u as f64 - intr.cx) / intr.fx;
            let my = (v as f64 - intr.cy) / intr.fy;
            let rd = (mx * mx + my * my).sqrt();
            let scale = if rd < 1e-9 {
                1.0
            } else {
                let theta = solve_theta(rd, &intr.coeffs);
                theta.tan() / rd
            };
            points[[v, u, 0]] = (mx * scale * z) as f32;
            points[[v, u, 1]] = (my * scale * z) as f32;
            points[[v, u, 2]] = z as f32;
        }
    }
    points
}

// Invert theta_d = theta * (1 + k0 t^2 + k1 t^4 + k2 t^6 + k3 t^8) by Newton
// iteration; the polynomial is near-identity for realistic coefficients so a
// handful of steps converge.
fn solve_theta(theta_d: f64, k: &[f64; 5]) -> f64 {
    let mut theta = theta_d;
    for _ in 0..10 {
        let t2 = theta * theta;
        let poly = 1.0 + k[0] * t2 + k[1] * t2 * t2 + k[2] * t2 * t2 * t2 + k[3] * t2 * t2 * t2 * t2;
        let dpoly = 2.0 * k[0] + 4.0 * k[1] * t2 + 6.0 * k[2] * t2 * t2 + 8.0 * k[3] * t2 * t2 * t2;
        let f = theta * poly - theta_d;
        let df = poly + theta * theta * dpoly;
        if df.abs() < 1e-12 {
            break;
        }
        let next = theta - f / df;
        if (next - theta).abs() < 1e-12 {
            return next;
        }
        theta = next;
    }
    theta
}
