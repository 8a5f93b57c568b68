//! Collaborator interfaces consumed by the pipeline.
//!
//! The concrete device driver and calibration storage live outside this
//! crate; the pipeline only depends on these traits.

use std::sync::Arc;

use crate::calib::{Extrinsics, Intrinsics};
use crate::stream::{Stream, StreamData};

/// What a `start`/`stop` call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    VideoStreaming,
    MotionTracking,
    All,
}

/// Callback invoked by the device for each delivered sample of a stream.
pub type DeviceStreamCallback = Arc<dyn Fn(&StreamData) + Send + Sync>;

/// The device layer: yields raw frames with timestamps and frame-ids, and
/// may natively produce some of the derived streams.
pub trait Device: Send + Sync {
    /// Whether the device produces this stream itself.
    fn supports(&self, stream: Stream) -> bool;

    /// Install or remove (with `None`) the delivery callback for a stream.
    /// `replace` permits overwriting an existing callback.
    fn set_stream_callback(
        &self,
        stream: Stream,
        callback: Option<DeviceStreamCallback>,
        replace: bool,
    );

    /// Latest sample of a native stream.
    fn get_stream_data(&self, stream: Stream) -> StreamData;

    /// All buffered samples of a native stream, oldest first.
    fn get_stream_datas(&self, stream: Stream) -> Vec<StreamData>;

    fn start(&self, source: Source);

    fn stop(&self, source: Source);

    /// Block until the device has fresh data on its enabled streams. Honors
    /// the device's own timeouts; the pipeline holds no locks across this.
    fn wait_for_streams(&self);
}

/// Calibration storage, read at construction and on
/// `notify_calibration_changed`.
pub trait CalibrationSource: Send + Sync {
    fn intrinsics(&self, stream: Stream) -> Option<Intrinsics>;

    fn extrinsics(&self, from: Stream, to: Stream) -> Option<Extrinsics>;
}
