//! Stage input/output payloads.

use crate::mat::Mat;
use crate::stream::{ImgMeta, StreamData};

/// One matrix plus the identity of the frame it came from.
#[derive(Debug, Clone)]
pub struct MatSample {
    pub mat: Mat,
    pub frame_id: u16,
    pub meta: Option<ImgMeta>,
}

impl MatSample {
    pub fn from_stream_data(data: &StreamData) -> Option<Self> {
        Some(Self {
            mat: data.mat.clone()?,
            frame_id: data.frame_id,
            meta: data.img,
        })
    }

    pub fn into_stream_data(self) -> StreamData {
        StreamData {
            img: self.meta,
            mat: Some(self.mat),
            frame: None,
            frame_id: self.frame_id,
        }
    }
}

/// Which half of a paired payload a stream descriptor maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    Left,
    Right,
}

/// A stage input or output: either a single sample or a left/right pair.
/// Both halves of a pair are guaranteed to carry the same frame-id.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(MatSample),
    Pair { left: MatSample, right: MatSample },
}

impl Payload {
    pub fn frame_id(&self) -> u16 {
        match self {
            Payload::Single(s) => s.frame_id,
            Payload::Pair { left, .. } => left.frame_id,
        }
    }

    pub fn as_single(&self) -> Option<&MatSample> {
        match self {
            Payload::Single(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(&MatSample, &MatSample)> {
        match self {
            Payload::Pair { left, right } => Some((left, right)),
            _ => None,
        }
    }

    /// Extract one half of a pair, or the single sample if `side` is `None`.
    pub fn side(&self, side: Option<PairSide>) -> Option<&MatSample> {
        match (self, side) {
            (Payload::Single(s), _) => Some(s),
            (Payload::Pair { left, .. }, Some(PairSide::Left)) => Some(left),
            (Payload::Pair { right, .. }, Some(PairSide::Right)) => Some(right),
            (Payload::Pair { left, .. }, None) => Some(left),
        }
    }
}
