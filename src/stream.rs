//! Logical stream identities and per-stream delivery records.

use std::fmt;
use std::sync::Arc;

use crate::frame::Frame;
use crate::mat::Mat;

/// A named logical feed produced by the device or synthesized by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Left,
    Right,
    LeftRectified,
    RightRectified,
    Disparity,
    DisparityNormalized,
    Points,
    Depth,
}

impl Stream {
    /// All streams the pipeline knows about, in topology order.
    pub const ALL: [Stream; 8] = [
        Stream::Left,
        Stream::Right,
        Stream::LeftRectified,
        Stream::RightRectified,
        Stream::Disparity,
        Stream::DisparityNormalized,
        Stream::Points,
        Stream::Depth,
    ];
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Left => "LEFT",
            Stream::Right => "RIGHT",
            Stream::LeftRectified => "LEFT_RECTIFIED",
            Stream::RightRectified => "RIGHT_RECTIFIED",
            Stream::Disparity => "DISPARITY",
            Stream::DisparityNormalized => "DISPARITY_NORMALIZED",
            Stream::Points => "POINTS",
            Stream::Depth => "DEPTH",
        };
        f.write_str(name)
    }
}

/// Per (stage, stream) production mode.
///
/// `Native` means the device delivers the stream directly and the pipeline
/// stage only routes; `Synthetic` means the stage computes it; `None` means
/// the stream is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Native,
    Synthetic,
    None,
}

/// Metadata carried alongside an image, decoded from the image-info packet.
///
/// Timestamp and exposure are in 10-microsecond units. The timestamp is a
/// power-on monotonic counter that wraps around 32 bits (~11.9 h); wrap is
/// expected and not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImgMeta {
    pub frame_id: u16,
    pub timestamp: u32,
    pub exposure_time: u16,
}

/// The external delivery record for one stream sample.
///
/// An empty `StreamData` (no matrix) is what disabled or not-yet-ready
/// streams return.
#[derive(Debug, Clone, Default)]
pub struct StreamData {
    /// Image metadata, when the sample originated from a device frame.
    pub img: Option<ImgMeta>,
    /// The decoded matrix. `None` marks an empty record.
    pub mat: Option<Mat>,
    /// The source frame, kept alive while any reader holds this record.
    pub frame: Option<Arc<Frame>>,
    pub frame_id: u16,
}

impl StreamData {
    pub fn is_empty(&self) -> bool {
        self.mat.is_none()
    }
}
