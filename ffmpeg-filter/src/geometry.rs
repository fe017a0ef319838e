//! Output geometry for the video lane.
//!
//! The source track carries a display transform (the container's display
//! matrix). Some rotations are baked into the pixel data before encoding,
//! the rest are carried over to the output track as metadata. Which ones are
//! baked in is decided by [`RotationClass::requires_bake_in`] alone.

/// Fixed-point scale of the linear and translation terms of a display matrix.
const FIXED_16_16: f64 = 65536.0;
/// Fixed-point scale of the projective column of a display matrix.
const FIXED_2_30: f64 = (1u32 << 30) as f64;
/// Tolerance, in degrees, when snapping an angle onto a quarter turn.
const ANGLE_EPSILON: f64 = 1e-3;

/// 2D affine transform in the row-vector form used by MOV/MP4 track headers:
/// `[x' y'] = [x y] * [[a b] [c d]] + [tx ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Pure rotation by `degrees`, measured the same way as [`Transform::degrees`].
    pub fn rotation(degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn with_translation(mut self, tx: f64, ty: f64) -> Self {
        self.tx = tx;
        self.ty = ty;
        self
    }

    /// Rotation angle in degrees, `atan2(b, a)`, in `(-180, 180]`.
    pub fn degrees(&self) -> f64 {
        self.b.atan2(self.a).to_degrees()
    }

    pub fn is_identity(&self) -> bool {
        let near = |x: f64, y: f64| (x - y).abs() < 1e-9;
        near(self.a, 1.0)
            && near(self.b, 0.0)
            && near(self.c, 0.0)
            && near(self.d, 1.0)
            && near(self.tx, 0.0)
            && near(self.ty, 0.0)
    }

    /// Reads an FFmpeg display matrix (`AV_PKT_DATA_DISPLAYMATRIX` layout).
    pub fn from_display_matrix(matrix: &[i32; 9]) -> Self {
        Self {
            a: matrix[0] as f64 / FIXED_16_16,
            b: matrix[1] as f64 / FIXED_16_16,
            c: matrix[3] as f64 / FIXED_16_16,
            d: matrix[4] as f64 / FIXED_16_16,
            tx: matrix[6] as f64 / FIXED_16_16,
            ty: matrix[7] as f64 / FIXED_16_16,
        }
    }

    pub fn to_display_matrix(&self) -> [i32; 9] {
        let fixed = |v: f64| (v * FIXED_16_16).round() as i32;
        [
            fixed(self.a),
            fixed(self.b),
            0,
            fixed(self.c),
            fixed(self.d),
            0,
            fixed(self.tx),
            fixed(self.ty),
            FIXED_2_30 as i32,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationClass {
    Identity,
    /// 90 degrees.
    Quarter,
    /// 180 degrees.
    Half,
    /// 270 (or -90) degrees.
    ThreeQuarter,
    Arbitrary,
}

impl RotationClass {
    pub fn classify(degrees: f64) -> Self {
        let normalized = degrees.rem_euclid(360.0);
        let near = |target: f64| (normalized - target).abs() < ANGLE_EPSILON;
        if near(0.0) || near(360.0) {
            Self::Identity
        } else if near(90.0) {
            Self::Quarter
        } else if near(180.0) {
            Self::Half
        } else if near(270.0) {
            Self::ThreeQuarter
        } else {
            Self::Arbitrary
        }
    }

    /// Only quarter turns are physically re-oriented; 180 and 270 degrees stay
    /// display metadata on the output track.
    pub fn requires_bake_in(self) -> bool {
        matches!(self, Self::Quarter)
    }
}

/// Encode geometry of the output video track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub rotation: RotationClass,
    /// Decoded frames must be rotated a quarter turn clockwise before processing.
    pub bake_in: bool,
    /// Display transform attached to the output track.
    pub transform: Transform,
}

impl OutputGeometry {
    pub fn normalize(natural_width: u32, natural_height: u32, transform: Transform) -> Self {
        let rotation = RotationClass::classify(transform.degrees());
        if rotation.requires_bake_in() {
            Self {
                width: natural_height,
                height: natural_width,
                rotation,
                bake_in: true,
                transform: Transform::IDENTITY,
            }
        } else {
            Self {
                width: natural_width,
                height: natural_height,
                rotation,
                bake_in: false,
                transform,
            }
        }
    }
}
