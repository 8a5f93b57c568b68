//! Built-in stage compute kernels.
//!
//! Each kernel is a pure function from its input payload and construction
//! time calibration to an output payload. The pipeline core only depends on
//! `Kernel::compute`; which variants get instantiated, and in which graph
//! order, is the builder's business.

pub mod depth;
pub mod disparity;
pub mod points;
pub mod rectify;

use anyhow::Result;

use crate::pipeline::payload::Payload;

pub use depth::DepthKernel;
pub use disparity::{DisparityKernel, DisparityMethod, DisparityNormKernel};
pub use points::PointsKernel;
pub use rectify::RectifyKernel;

/// The compute element a stage runs when neither the plugin nor the native
/// device short-circuits it.
pub enum Kernel {
    /// Passthrough; the root stage only carries the topology.
    Root,
    Rectify(RectifyKernel),
    Disparity(DisparityKernel),
    DisparityNorm(DisparityNormKernel),
    Points(PointsKernel),
    Depth(DepthKernel),
}

impl Kernel {
    pub fn compute(&self, input: &Payload) -> Result<Payload> {
        match self {
            Kernel::Root => Ok(input.clone()),
            Kernel::Rectify(k) => k.compute(input),
            Kernel::Disparity(k) => k.compute(input),
            Kernel::DisparityNorm(k) => k.compute(input),
            Kernel::Points(k) => k.compute(input),
            Kernel::Depth(k) => k.compute(input),
        }
    }
}
