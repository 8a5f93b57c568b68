//! The processor graph: a fixed DAG of stage nodes that pair raw frames,
//! rectify them, and derive disparity, display disparity, 3D points, and
//! depth, with per-stream mode arbitration between the device and the
//! pipeline.

pub mod builder;
pub mod latch;
pub mod payload;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod stage;

pub use builder::{Graph, GraphIds};
pub use latch::PairLatch;
pub use payload::{MatSample, PairSide, Payload};
pub use pipeline::{Pipeline, StreamListener};
pub use plugin::Plugin;
pub use stage::{Stage, StageId, StageKind, StreamCallback, TargetStream};
