//! Disparity kernels: window SAD block matching along the rectified
//! epipolar line, plus min-max normalization for display.

use anyhow::{bail, Result};
use ndarray::Array3;

use crate::mat::{to_gray, Mat};
use crate::pipeline::payload::{MatSample, Payload};

/// Which matcher variant the disparity stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisparityMethod {
    Sgbm,
    Bm,
}

/// Block-matching disparity. A match is accepted only when the best cost
/// beats the second best by the uniqueness ratio; the left feature must sit
/// to the right of its match, so only positive disparities are searched.
pub struct DisparityKernel {
    method: DisparityMethod,
    max_disparity: usize,
    block_size: usize,
    uniqueness_ratio: f32,
}

impl DisparityKernel {
    pub fn new(method: DisparityMethod) -> Self {
        Self {
            method,
            max_disparity: 64,
            block_size: 5,
            uniqueness_ratio: 0.9,
        }
    }

    pub fn set_method(&mut self, method: DisparityMethod) {
        self.method = method;
    }

    pub fn method(&self) -> DisparityMethod {
        self.method
    }

    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        let Some((left, right)) = input.as_pair() else {
            bail!("disparity expects a paired input");
        };
        let l = left.mat.as_u8().ok_or_else(|| anyhow::anyhow!("disparity expects u8 images"))?;
        let r = right.mat.as_u8().ok_or_else(|| anyhow::anyhow!("disparity expects u8 images"))?;
        if l.dim().0 != r.dim().0 || l.dim().1 != r.dim().1 {
            bail!("left/right dimensions differ");
        }
        let lg = to_gray(l);
        let rg = to_gray(r);
        let (h, w) = lg.dim();
        let half = self.block_size / 2;
        let mut disp = Array3::<f32>::zeros((h, w, 1));
        for y in half..h.saturating_sub(half) {
            for x in half..w.saturating_sub(half) {
                let max_d = self.max_disparity.min(x - half);
                let mut best = f32::INFINITY;
                let mut second = f32::INFINITY;
                let mut best_d = 0usize;
                let mut costs = vec![0.0f32; max_d + 1];
                for d in 0..=max_d {
                    let mut cost = 0.0f32;
                    for dy in 0..self.block_size {
                        for dx in 0..self.block_size {
                            let yy = y + dy - half;
                            let xx = x + dx - half;
                            cost += (lg[[yy, xx]] - rg[[yy, xx - d]]).abs();
                        }
                    }
                    costs[d] = cost;
                    if cost < best {
                        second = best;
                        best = cost;
                        best_d = d;
                    } else if cost < second {
                        second = cost;
                    }
                }
                if best_d == 0 || (second.is_finite() && best >= self.uniqueness_ratio * second) {
                    continue;
                }
                let mut d = best_d as f32;
                if self.method == DisparityMethod::Sgbm && best_d + 1 <= max_d && best_d >= 1 {
                    // Parabolic subpixel refinement over the cost triplet.
                    let c0 = costs[best_d - 1];
                    let c1 = costs[best_d];
                    let c2 = costs[best_d + 1];
                    let denom = c0 - 2.0 * c1 + c2;
                    if denom.abs() > 1e-6 {
                        d += 0.5 * (c0 - c2) / denom;
                    }
                }
                disp[[y, x, 0]] = d;
            }
        }
        Ok(Payload::Single(MatSample {
            mat: Mat::F32(disp),
            frame_id: left.frame_id,
            meta: left.meta,
        }))
    }
}

/// Scales a disparity map into u8 for display.
pub struct DisparityNormKernel;

impl DisparityNormKernel {
    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        let Some(sample) = input.as_single() else {
            bail!("disparity normalization expects a single input");
        };
        let disp = sample
            .mat
            .as_f32()
            .ok_or_else(|| anyhow::anyhow!("disparity normalization expects f32 input"))?;
        let (h, w, _) = disp.dim();
        let max = disp.iter().cloned().fold(0.0f32, f32::max);
        let mut out = Array3::<u8>::zeros((h, w, 1));
        if max > 0.0 {
            for y in 0..h {
                for x in 0..w {
                    out[[y, x, 0]] = (disp[[y, x, 0]] / max * 255.0).clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(Payload::Single(MatSample {
            mat: Mat::U8(out),
            frame_id: sample.frame_id,
            meta: sample.meta,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Locally unique texture so SAD matches are unambiguous.
    fn pattern(x: usize, y: usize) -> u8 {
        (((x * 13 + y * 7) * 31) % 251) as u8
    }

    fn shifted_pair(w: usize, h: usize, shift: usize) -> Payload {
        let mut left = Array3::<u8>::zeros((h, w, 1));
        let mut right = Array3::<u8>::zeros((h, w, 1));
        for y in 0..h {
            for x in 0..w {
                left[[y, x, 0]] = pattern(x, y);
                right[[y, x, 0]] = pattern(x + shift, y);
            }
        }
        Payload::Pair {
            left: MatSample {
                mat: Mat::U8(left),
                frame_id: 1,
                meta: None,
            },
            right: MatSample {
                mat: Mat::U8(right),
                frame_id: 1,
                meta: None,
            },
        }
    }

    #[test]
    fn test_block_match_recovers_shift() {
        let kernel = DisparityKernel::new(DisparityMethod::Bm);
        let out = kernel.compute(&shifted_pair(48, 16, 4)).unwrap();
        let disp = out.as_single().unwrap().mat.as_f32().unwrap();
        // Interior pixel far enough from the border to have the full search range.
        let d = disp[[8, 30, 0]];
        assert_eq!(d, 4.0, "expected disparity 4, got {d}");
    }

    #[test]
    fn test_sgbm_subpixel_near_integer_shift() {
        let kernel = DisparityKernel::new(DisparityMethod::Sgbm);
        let out = kernel.compute(&shifted_pair(48, 16, 6)).unwrap();
        let disp = out.as_single().unwrap().mat.as_f32().unwrap();
        let d = disp[[8, 30, 0]];
        assert!((d - 6.0).abs() < 0.5, "expected disparity near 6, got {d}");
    }

    #[test]
    fn test_normalization_scales_to_255() {
        let mut disp = Array3::<f32>::zeros((2, 2, 1));
        disp[[0, 0, 0]] = 8.0;
        disp[[1, 1, 0]] = 4.0;
        let input = Payload::Single(MatSample {
            mat: Mat::F32(disp),
            frame_id: 2,
            meta: None,
        });
        let out = DisparityNormKernel.compute(&input).unwrap();
        let norm = out.as_single().unwrap().mat.as_u8().unwrap();
        assert_eq!(norm[[0, 0, 0]], 255);
        assert_eq!(norm[[1, 1, 0]], 127);
        assert_eq!(norm[[0, 1, 0]], 0);
    }

    #[test]
    fn test_mismatched_dims_rejected() {
        let kernel = DisparityKernel::new(DisparityMethod::Bm);
        let left = MatSample {
            mat: Mat::U8(Array3::zeros((4, 4, 1))),
            frame_id: 1,
            meta: None,
        };
        let right = MatSample {
            mat: Mat::U8(Array3::zeros((4, 6, 1))),
            frame_id: 1,
            meta: None,
        };
        assert!(kernel.compute(&Payload::Pair { left, right }).is_err());
    }
}
