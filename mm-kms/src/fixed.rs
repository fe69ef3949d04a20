// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

/// A 16.16 fixed-point number, as used by plane source and destination
/// rectangles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed16(pub i32);

impl Fixed16 {
    pub const ZERO: Self = Self(0);

    pub fn from_int(v: i32) -> Self {
        Self(v << 16)
    }

    pub fn from_f64(v: f64) -> Self {
        Self((v * 65536.0) as i32)
    }

    /// Truncates toward negative infinity.
    pub fn to_int(self) -> i32 {
        self.0 >> 16
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 65536.0
    }
}

impl std::fmt::Display for Fixed16 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.to_f64())
    }
}

impl From<i32> for Fixed16 {
    fn from(value: i32) -> Self {
        Self::from_int(value)
    }
}

impl From<Fixed16> for f64 {
    fn from(value: Fixed16) -> Self {
        value.to_f64()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedRect {
    pub x: Fixed16,
    pub y: Fixed16,
    pub width: Fixed16,
    pub height: Fixed16,
}

impl FixedRect {
    pub fn from_ints(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            width: width.into(),
            height: height.into(),
        }
    }
}

/// An integer rectangle, used for CRTC geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn int_conversion() {
        assert_eq!(Fixed16::from_int(1920).to_int(), 1920);
        assert_eq!(Fixed16::from_int(-3).to_int(), -3);
        assert_eq!(Fixed16::from_f64(10.75).to_int(), 10);
        assert_eq!(Fixed16::from_f64(0.5).0, 0x8000);
    }

    #[test]
    fn rect_from_ints() {
        let rect = FixedRect::from_ints(10, 20, 64, 64);
        assert_eq!(rect.x.to_int(), 10);
        assert_eq!(rect.height, Fixed16(64 << 16));
    }
}
