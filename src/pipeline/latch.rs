//! Pairing latch joining left- and right-eye samples by frame-id.

use crate::stream::StreamData;

use super::payload::{MatSample, PairSide, Payload};

/// Most-recent sample per eye. On every arrival the fresh sample overwrites
/// its slot; a pair is emitted iff both slots hold a matrix with equal
/// frame-ids. Nothing is cleared on emission, later frames simply
/// overwrite, and a mismatched pair just waits for the older side's next
/// frame. Frame-id comparison is plain equality, so the 16-bit wrap is
/// transparent.
///
/// The caller guards the latch with a mutex spanning the store and the emit
/// check.
#[derive(Default)]
pub struct PairLatch {
    left: Option<StreamData>,
    right: Option<StreamData>,
}

impl PairLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, side: PairSide, data: StreamData) -> Option<Payload> {
        match side {
            PairSide::Left => self.left = Some(data),
            PairSide::Right => self.right = Some(data),
        }
        let left = self.left.as_ref()?;
        let right = self.right.as_ref()?;
        if left.mat.is_none() || right.mat.is_none() || left.frame_id != right.frame_id {
            return None;
        }
        Some(Payload::Pair {
            left: MatSample::from_stream_data(left)?,
            right: MatSample::from_stream_data(right)?,
        })
    }
}
