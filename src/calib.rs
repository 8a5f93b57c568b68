//! Camera calibration records shared by the rectify, points and depth
//! kernels.

use nalgebra::{Matrix3, Vector3};

/// Camera model reported by the device. Selects the rectify/points/depth
/// kernels and the graph shape downstream of disparity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationModel {
    Pinhole,
    KannalaBrandt,
    /// Anything the pipeline does not recognize; falls back to pinhole
    /// defaults at construction.
    Unknown,
}

/// Monocular intrinsics.
///
/// For `Pinhole` the coefficients are radial-tangential (k1, k2, p1, p2, k3);
/// for `KannalaBrandt` the first four are the equidistant coefficients
/// (k2..k5 in the paper's numbering).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub model: CalibrationModel,
    pub width: u16,
    pub height: u16,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub coeffs: [f64; 5],
}

/// Rigid transform from one camera to the other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub rotation: Matrix3<f64>,
    /// Meters.
    pub translation: Vector3<f64>,
}

impl Extrinsics {
    /// Stereo baseline in meters.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

/// The full calibration bundle a kernel is constructed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibPair {
    pub left: Intrinsics,
    pub right: Intrinsics,
    pub extrinsics: Extrinsics,
}

/// Stand-in intrinsics used when the device reports an unknown model or the
/// calibration source cannot answer.
pub fn default_intrinsics() -> Intrinsics {
    Intrinsics {
        model: CalibrationModel::Pinhole,
        width: 640,
        height: 400,
        fx: 360.0,
        fy: 360.0,
        cx: 320.0,
        cy: 200.0,
        coeffs: [0.0; 5],
    }
}

/// Stand-in extrinsics: 120 mm horizontal baseline, no rotation.
pub fn default_extrinsics() -> Extrinsics {
    Extrinsics {
        rotation: Matrix3::identity(),
        translation: Vector3::new(-0.12, 0.0, 0.0),
    }
}
