//! Synthetic image-processing pipeline of a stereo depth camera SDK.
//!
//! Raw left/right frames arrive from a device layer; the pipeline pairs
//! them by frame-id, rectifies them, computes disparity, normalizes
//! disparity for display, and derives 3D points and depth maps. Consumers
//! subscribe per stream and either pull the latest sample or receive
//! callbacks. Streams the device already produces natively are routed, not
//! re-synthesized.

pub mod calib;
pub mod device;
pub mod frame;
pub mod kernels;
pub mod mat;
pub mod pipeline;
pub mod protocol;
pub mod stream;
