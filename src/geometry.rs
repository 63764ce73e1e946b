//! Page-space and device-space geometry.
//!
//! Matrices use the row-vector convention `[x y 1] · M`:
//!
//! ```text
//! x' = a·x + c·y + e
//! y' = b·x + d·y + f
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

const EPSILON: f32 = 0.001;

/// Affine transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    pub fn scale(sx: f32, sy: f32) -> Self {
        Matrix {
            a: sx,
            d: sy,
            ..Self::IDENTITY
        }
    }

    pub fn translate(tx: f32, ty: f32) -> Self {
        Matrix {
            e: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    /// Rotation by `degrees` clockwise on the page. Multiples of 90 are exact.
    pub fn rotate(degrees: f32) -> Self {
        let mut deg = degrees % 360.0;
        if deg < 0.0 {
            deg += 360.0;
        }
        if deg.abs() < f32::EPSILON || (360.0 - deg).abs() < f32::EPSILON {
            return Self::IDENTITY;
        }
        let (s, c) = if (deg - 90.0).abs() < f32::EPSILON {
            (1.0, 0.0)
        } else if (deg - 180.0).abs() < f32::EPSILON {
            (0.0, -1.0)
        } else if (deg - 270.0).abs() < f32::EPSILON {
            (-1.0, 0.0)
        } else {
            deg.to_radians().sin_cos()
        };
        Matrix {
            a: c,
            b: s,
            c: -s,
            d: c,
            e: 0.0,
            f: 0.0,
        }
    }

    /// `self` followed by `then`.
    pub fn concat(&self, then: &Matrix) -> Matrix {
        Matrix {
            a: self.a * then.a + self.b * then.c,
            b: self.a * then.b + self.b * then.d,
            c: self.c * then.a + self.d * then.c,
            d: self.c * then.b + self.d * then.d,
            e: self.e * then.a + self.f * then.c + then.e,
            f: self.e * then.b + self.f * then.d + then.f,
        }
    }

    /// View transform: zoom, then rotation.
    pub fn view(zoom: f32, rotation_degrees: i32) -> Matrix {
        Matrix::scale(zoom, zoom).concat(&Matrix::rotate(rotation_degrees as f32))
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < f32::EPSILON * f32::EPSILON || !det.is_finite() {
            return None;
        }
        let rdet = 1.0 / det;
        let a = self.d * rdet;
        let b = -self.b * rdet;
        let c = -self.c * rdet;
        let d = self.a * rdet;
        Some(Matrix {
            a,
            b,
            c,
            d,
            e: -self.e * a - self.f * c,
            f: -self.e * b - self.f * d,
        })
    }

    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.a + y * self.c + self.e,
            x * self.b + y * self.d + self.f,
        )
    }

    /// Bounding box of the transformed corners.
    pub fn transform_rect(&self, r: &Rect) -> Rect {
        let corners = [
            self.transform_point(r.x0, r.y0),
            self.transform_point(r.x1, r.y0),
            self.transform_point(r.x0, r.y1),
            self.transform_point(r.x1, r.y1),
        ];
        let mut out = Rect::new(corners[0].0, corners[0].1, corners[0].0, corners[0].1);
        for (x, y) in &corners[1..] {
            out.x0 = out.x0.min(*x);
            out.y0 = out.y0.min(*y);
            out.x1 = out.x1.max(*x);
            out.y1 = out.y1.max(*y);
        }
        out
    }
}

/// Float rectangle, `x0 <= x1`, `y0 <= y1` when non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    /// All zeros. As a crop rectangle it selects the full page.
    pub const EMPTY: Rect = Rect {
        x0: 0.0,
        y0: 0.0,
        x1: 0.0,
        y1: 0.0,
    };

    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn is_zero(&self) -> bool {
        self.x0 == 0.0 && self.y0 == 0.0 && self.x1 == 0.0 && self.y1 == 0.0
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    /// Resolve a crop request against the page bounds: all zeros selects the
    /// page, anything else has each edge clamped to it.
    pub fn crop_to(&self, page: &Rect) -> Rect {
        if self.is_zero() {
            *page
        } else {
            self.intersect(page)
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.x0, self.y0, self.x1, self.y1)
    }
}

/// Integer device-space box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Smallest integer box covering `r`, ignoring slivers under 0.001.
    pub fn round(r: &Rect) -> IRect {
        let clamp = |v: f32| v.clamp(i32::MIN as f32, i32::MAX as f32) as i32;
        IRect {
            x0: clamp((r.x0 + EPSILON).floor()),
            y0: clamp((r.y0 + EPSILON).floor()),
            x1: clamp((r.x1 - EPSILON).ceil()),
            y1: clamp((r.y1 - EPSILON).ceil()),
        }
    }

    pub fn width(&self) -> u32 {
        (self.x1 as i64 - self.x0 as i64).clamp(0, u32::MAX as i64) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y1 as i64 - self.y0 as i64).clamp(0, u32::MAX as i64) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl fmt::Display for IRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.x0, self.y0, self.x1, self.y1)
    }
}

/// Requested page rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    /// The page's own rotation (PDF documents only; 0 for other formats).
    #[default]
    Page,
    /// Explicit rotation in degrees.
    Degrees(i32),
}

impl Rotation {
    /// Degrees to render with, given the page's intrinsic rotation.
    pub fn resolve(self, intrinsic: i32) -> i32 {
        match self {
            Rotation::Page => intrinsic,
            Rotation::Degrees(d) => d,
        }
    }

    /// Map the foreign-call convention where -1 selects the page rotation.
    pub fn from_code(code: i32) -> Self {
        if code == -1 {
            Rotation::Page
        } else {
            Rotation::Degrees(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Rect, b: &Rect) -> bool {
        (a.x0 - b.x0).abs() < 1e-4
            && (a.y0 - b.y0).abs() < 1e-4
            && (a.x1 - b.x1).abs() < 1e-4
            && (a.y1 - b.y1).abs() < 1e-4
    }

    #[test]
    fn right_angles_are_exact() {
        assert_eq!(Matrix::rotate(0.0), Matrix::IDENTITY);
        assert_eq!(Matrix::rotate(360.0), Matrix::IDENTITY);
        let r90 = Matrix::rotate(90.0);
        assert_eq!((r90.a, r90.b, r90.c, r90.d), (0.0, 1.0, -1.0, 0.0));
        assert_eq!(Matrix::rotate(-90.0), Matrix::rotate(270.0));
        let r180 = Matrix::rotate(180.0);
        assert_eq!((r180.a, r180.d), (-1.0, -1.0));
    }

    #[test]
    fn view_of_letter_page_rotated() {
        let page = Rect::new(0.0, 0.0, 612.0, 792.0);
        let ctm = Matrix::view(2.0, 90);
        let bbox = IRect::round(&ctm.transform_rect(&page));
        assert_eq!(bbox, IRect::new(-1584, 0, 0, 1224));
        assert_eq!((bbox.width(), bbox.height()), (1584, 1224));
    }

    #[test]
    fn round_ignores_slivers() {
        let r = Rect::new(0.0004, 1.9995, 10.0004, 20.5);
        assert_eq!(IRect::round(&r), IRect::new(0, 2, 10, 21));
    }

    #[test]
    fn concat_applies_left_first() {
        let m = Matrix::translate(5.0, 0.0).concat(&Matrix::scale(2.0, 2.0));
        assert_eq!(m.transform_point(1.0, 1.0), (12.0, 2.0));
    }

    #[test]
    fn invert_round_trips() {
        let m = Matrix::view(1.5, 30);
        let inv = m.invert().unwrap();
        let (x, y) = m.transform_point(10.0, 20.0);
        let (bx, by) = inv.transform_point(x, y);
        assert!((bx - 10.0).abs() < 1e-3 && (by - 20.0).abs() < 1e-3);
        assert!(Matrix::scale(0.0, 1.0).invert().is_none());
    }

    #[test]
    fn crop_rules() {
        let page = Rect::new(0.0, 0.0, 100.0, 200.0);
        assert_eq!(Rect::EMPTY.crop_to(&page), page);
        let c = Rect::new(-10.0, 50.0, 300.0, 150.0).crop_to(&page);
        assert!(close(&c, &Rect::new(0.0, 50.0, 100.0, 150.0)));
    }

    #[test]
    fn rotation_codes() {
        assert_eq!(Rotation::from_code(-1), Rotation::Page);
        assert_eq!(Rotation::from_code(90).resolve(270), 90);
        assert_eq!(Rotation::Page.resolve(270), 270);
    }
}
