//! Dynamically typed image matrices.
//!
//! Stages pass matrices of different element types between each other
//! (u8 camera images, f32 disparity and points, u16 depth), so `Mat` is a
//! small tagged union over `ndarray` buffers, shaped height x width x
//! channels.

use ndarray::{Array2, Array3};

#[derive(Debug, Clone)]
pub enum Mat {
    U8(Array3<u8>),
    U16(Array3<u16>),
    F32(Array3<f32>),
}

impl Mat {
    pub fn rows(&self) -> usize {
        match self {
            Mat::U8(a) => a.dim().0,
            Mat::U16(a) => a.dim().0,
            Mat::F32(a) => a.dim().0,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Mat::U8(a) => a.dim().1,
            Mat::U16(a) => a.dim().1,
            Mat::F32(a) => a.dim().1,
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Mat::U8(a) => a.dim().2,
            Mat::U16(a) => a.dim().2,
            Mat::F32(a) => a.dim().2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0 || self.cols() == 0
    }

    pub fn as_u8(&self) -> Option<&Array3<u8>> {
        match self {
            Mat::U8(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<&Array3<u16>> {
        match self {
            Mat::U16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&Array3<f32>> {
        match self {
            Mat::F32(a) => Some(a),
            _ => None,
        }
    }
}

/// Collapse a 1- or 3-channel u8 image to a single grayscale f32 plane.
///
/// 3-channel input is taken as BGR and weighted with the usual Rec.601
/// luma coefficients.
pub fn to_gray(mat: &Array3<u8>) -> Array2<f32> {
    let (h, w, c) = mat.dim();
    let mut gray = Array2::<f32>::zeros((h, w));
    if c >= 3 {
        for y in 0..h {
            for x in 0..w {
                let b = mat[[y, x, 0]] as f32;
                let g = mat[[y, x, 1]] as f32;
                let r = mat[[y, x, 2]] as f32;
                gray[[y, x]] = 0.114 * b + 0.587 * g + 0.299 * r;
            }
        }
    } else {
        for y in 0..h {
            for x in 0..w {
                gray[[y, x]] = mat[[y, x, 0]] as f32;
            }
        }
    }
    gray
}
