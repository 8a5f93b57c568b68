//! Raw device frames and their decode into matrices.

use ndarray::Array3;

use crate::mat::Mat;

/// Pixel layout of a raw frame as delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Bgr888,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Bgr888 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A captured image. Immutable after publication; readers share it through
/// `Arc<Frame>` and the buffer is released when the last reader drops it.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u16,
    height: u16,
    format: PixelFormat,
    data: Vec<u8>,
    /// Monotonically increasing, wraps around 16 bits.
    pub frame_id: u16,
    /// 10-microsecond units, wraps around 32 bits.
    pub timestamp: u32,
    /// 10-microsecond units.
    pub exposure_time: u16,
}

impl Frame {
    pub fn new(
        width: u16,
        height: u16,
        format: PixelFormat,
        data: Vec<u8>,
        frame_id: u16,
        timestamp: u32,
        exposure_time: u16,
    ) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel()
        );
        Self {
            width,
            height,
            format,
            data,
            frame_id,
            timestamp,
            exposure_time,
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Decode a frame into a matrix view: YUYV becomes BGR, the byte formats
/// pass through. A frame whose buffer does not match its declared
/// dimensions decodes to an empty matrix.
pub fn frame_to_mat(frame: &Frame) -> Mat {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let expected = w * h * frame.format.bytes_per_pixel();
    if frame.data.len() < expected {
        tracing::error!(
            "frame {} buffer too short: {} bytes, expected {expected}",
            frame.frame_id,
            frame.data.len()
        );
        return Mat::U8(Array3::zeros((0, 0, 1)));
    }
    match frame.format {
        PixelFormat::Yuyv => Mat::U8(yuyv_to_bgr(&frame.data, w, h)),
        PixelFormat::Bgr888 => {
            let arr = Array3::from_shape_vec((h, w, 3), frame.data[..expected].to_vec())
                .unwrap_or_else(|_| Array3::zeros((0, 0, 3)));
            Mat::U8(arr)
        }
        PixelFormat::Gray8 => {
            let arr = Array3::from_shape_vec((h, w, 1), frame.data[..expected].to_vec())
                .unwrap_or_else(|_| Array3::zeros((0, 0, 1)));
            Mat::U8(arr)
        }
    }
}

// BT.601 conversion; YUYV packs two pixels as [Y0 U Y1 V].
fn yuyv_to_bgr(data: &[u8], width: usize, height: usize) -> Array3<u8> {
    let mut out = Array3::<u8>::zeros((height, width, 3));
    for y in 0..height {
        for xp in 0..width / 2 {
            let base = (y * width + xp * 2) * 2;
            let y0 = data[base] as f32;
            let u = data[base + 1] as f32;
            let y1 = data[base + 2] as f32;
            let v = data[base + 3] as f32;
            for (i, luma) in [y0, y1].into_iter().enumerate() {
                let c = 1.164 * (luma - 16.0);
                let d = u - 128.0;
                let e = v - 128.0;
                let x = xp * 2 + i;
                out[[y, x, 0]] = (c + 2.017 * d).clamp(0.0, 255.0) as u8;
                out[[y, x, 1]] = (c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8;
                out[[y, x, 2]] = (c + 1.596 * e).clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}
