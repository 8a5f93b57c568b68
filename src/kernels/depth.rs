//! Depth kernels, u16 millimeters.

use anyhow::{bail, Result};
use ndarray::Array3;

use crate::calib::CalibPair;
use crate::mat::Mat;
use crate::pipeline::payload::{MatSample, Payload};

pub enum DepthKernel {
    /// Runs after the points stage: extracts Z.
    Pinhole,
    /// Runs directly on disparity: z = fx * baseline / d.
    KannalaBrandt { pair: CalibPair },
}

impl DepthKernel {
    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        let Some(sample) = input.as_single() else {
            bail!("depth expects a single input");
        };
        let mat = match self {
            DepthKernel::Pinhole => {
                let points = sample
                    .mat
                    .as_f32()
                    .ok_or_else(|| anyhow::anyhow!("pinhole depth expects f32 points"))?;
                if points.dim().2 != 3 {
                    bail!("pinhole depth expects a 3-channel points matrix");
                }
                let (h, w, _) = points.dim();
                let mut depth = Array3::<u16>::zeros((h, w, 1));
                for v in 0..h {
                    for u in 0..w {
                        let z_mm = points[[v, u, 2]] as f64 * 1000.0;
                        depth[[v, u, 0]] = z_mm.clamp(0.0, u16::MAX as f64) as u16;
                    }
                }
                depth
            }
            DepthKernel::KannalaBrandt { pair } => {
                let disp = sample
                    .mat
                    .as_f32()
                    .ok_or_else(|| anyhow::anyhow!("equidistant depth expects f32 disparity"))?;
                let fx_b = pair.left.fx * pair.extrinsics.baseline();
                let (h, w, _) = disp.dim();
                let mut depth = Array3::<u16>::zeros((h, w, 1));
                for v in 0..h {
                    for u in 0..w {
                        let d = disp[[v, u, 0]] as f64;
                        if d > 0.0 {
                            let z_mm = fx_b / d * 1000.0;
                            depth[[v, u, 0]] = z_mm.clamp(0.0, u16::MAX as f64) as u16;
                        }
                    }
                }
                depth
            }
        };
        Ok(Payload::Single(MatSample {
            mat: Mat::U16(mat),
            frame_id: sample.frame_id,
            meta: sample.meta,
        }))
    }

    pub fn reload(&mut self, pair: CalibPair) {
        if let DepthKernel::KannalaBrandt { pair: old } = self {
            *old = pair;
        }
    }
}
