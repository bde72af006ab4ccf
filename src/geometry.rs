use nalgebra::{Matrix3, Point2};

/// Represents a closed 4-point shape as produced by upstream polygon
/// approximation.
///
/// Corner order is whatever the extractor emitted: it is *not* normalized to
/// a fixed winding or starting corner. Several downstream formulas (edge
/// angles, flip detection) depend on corner identity rather than pure
/// geometry, so the order must be preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadrilateral {
    points: [Point2<f64>; 4],
}

impl Quadrilateral {
    pub fn new(p0: Point2<f64>, p1: Point2<f64>, p2: Point2<f64>, p3: Point2<f64>) -> Self {
        Self {
            points: [p0, p1, p2, p3],
        }
    }

    /// Builds a quadrilateral from `(x, y)` corner tuples in P0..P3 order.
    pub fn from_coords(coords: [(f64, f64); 4]) -> Self {
        Self {
            points: coords.map(|(x, y)| Point2::new(x, y)),
        }
    }

    /// The axis-aligned frame of a `width`×`height` image, in the corner
    /// order the upstream perspective unwarp targets: P0 top-left, P1
    /// bottom-left, P2 bottom-right, P3 top-right.
    pub fn upright(width: f64, height: f64) -> Self {
        Self::from_coords([(0.0, 0.0), (0.0, height), (width, height), (width, 0.0)])
    }

    pub fn points(&self) -> &[Point2<f64>; 4] {
        &self.points
    }

    pub fn p0(&self) -> Point2<f64> {
        self.points[0]
    }

    pub fn p1(&self) -> Point2<f64> {
        self.points[1]
    }

    pub fn p2(&self) -> Point2<f64> {
        self.points[2]
    }

    pub fn p3(&self) -> Point2<f64> {
        self.points[3]
    }

    pub fn min_x(&self) -> f64 {
        self.points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min)
    }

    pub fn min_y(&self) -> f64 {
        self.points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min)
    }

    pub fn max_x(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.x)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn max_y(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.y)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Axis-aligned bounding box as `(min_x, min_y, max_x, max_y)`.
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        (self.min_x(), self.min_y(), self.max_x(), self.max_y())
    }

    /// Approximate width: the largest absolute x-delta among the four edges
    /// (P0P1, P1P2, P2P3, P3P0).
    ///
    /// Not a true side length — the per-edge maximum stays stable under
    /// perspective skew, which is what the marker classifier needs.
    pub fn width(&self) -> f64 {
        self.max_edge_delta(|p| p.x)
    }

    /// Approximate height: the largest absolute y-delta among the four edges.
    pub fn height(&self) -> f64 {
        self.max_edge_delta(|p| p.y)
    }

    fn max_edge_delta(&self, axis: impl Fn(&Point2<f64>) -> f64) -> f64 {
        (0..4)
            .map(|i| (axis(&self.points[i]) - axis(&self.points[(i + 1) % 4])).abs())
            .fold(0.0, f64::max)
    }

    /// Returns a new quadrilateral with every corner run through the given
    /// homogeneous transform.
    pub fn transformed(&self, matrix: &Matrix3<f64>) -> Self {
        Self {
            points: self.points.map(|p| {
                let (x, y) = transform_point(matrix, p.x, p.y);
                Point2::new(x, y)
            }),
        }
    }

    /// Returns a new quadrilateral mirrored across the vertical axis of a
    /// `width`-wide image: `x' = width - x`.
    pub fn mirrored_horizontally(&self, width: f64) -> Self {
        Self {
            points: self.points.map(|p| Point2::new(width - p.x, p.y)),
        }
    }
}

/// Compute a rotation about an arbitrary center as a 3x3 homogeneous matrix
///
/// The transform is composed as: M = T_back × R × T_origin
/// Positive angles turn screen-clockwise in y-down image coordinates.
pub fn rotation_about_center(degrees: f64, cx: f64, cy: f64) -> Matrix3<f64> {
    let radians = degrees.to_radians();
    let (sin, cos) = radians.sin_cos();

    // Translate to origin, rotate, translate back
    let translate_to_origin = Matrix3::new(
        1.0, 0.0, -cx,
        0.0, 1.0, -cy,
        0.0, 0.0, 1.0,
    );

    let rotate = Matrix3::new(
        cos, -sin, 0.0,
        sin, cos, 0.0,
        0.0, 0.0, 1.0,
    );

    let translate_back = Matrix3::new(
        1.0, 0.0, cx,
        0.0, 1.0, cy,
        0.0, 0.0, 1.0,
    );

    translate_back * rotate * translate_to_origin
}

/// Transform a point using the affine matrix
pub fn transform_point(matrix: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let p = nalgebra::Vector3::new(x, y, 1.0);
    let result = matrix * p;
    (result.x / result.z, result.y / result.z)
}
