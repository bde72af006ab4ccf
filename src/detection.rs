use anyhow::{ensure, Result};
use nalgebra::{Matrix3, Point2};

use crate::geometry::{rotation_about_center, Quadrilateral};

/// Orientation of a long thin marker bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Horizontal,
    Vertical,
}

/// Combination of marker orientations found at the tag's top-left and
/// top-right corners. Encodes one of the four possible tag rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    VerticalVertical,
    HorizontalVertical,
    HorizontalHorizontal,
    VerticalHorizontal,
}

impl Layout {
    /// Number of quarter turns this layout is away from the upright tag.
    pub fn index(self) -> u32 {
        match self {
            Layout::VerticalVertical => 0,
            Layout::HorizontalVertical => 1,
            Layout::HorizontalHorizontal => 2,
            Layout::VerticalHorizontal => 3,
        }
    }
}

/// A candidate quadrilateral with its marker classification for one
/// rotation hypothesis. Produced fresh per hypothesis, never mutated.
#[derive(Debug, Clone, Copy)]
struct Classified {
    quad: Quadrilateral,
    kind: Option<MarkerKind>,
}

/// Result of a successful tag detection.
///
/// Absence of a tag is not an error; `TagDetector::detect` returns `None`
/// for it.
#[derive(Debug, Clone)]
pub struct TagDetection {
    /// Continuous rotation angle of the tag in degrees, in `[0, 360)`.
    pub rotation_angle: f64,
    /// Quarter turns (0..=3) needed to present the image upright.
    pub image_rotation: u32,
    /// Quarter turns needed to re-align the detected markers with an
    /// already-rotated image. May be negative.
    pub markers_rotation: i32,
    /// Whether the source image is mirrored left-to-right.
    pub flipped_horizontally: bool,
    /// Classified candidates from the winning rotation hypothesis,
    /// index-aligned with the input; non-marker slots are `None`.
    pub markers: Vec<Option<Quadrilateral>>,
    /// Heuristic confidence in `[0, 1)`; 0.5 for a bare two-marker match,
    /// raised by corroborating markers in the bottom corners.
    pub confidence: f64,
}

/// Detects the presence and orientation of a tag in a collection of
/// quadrilaterals extracted from a fixed-size sub-image.
///
/// The quadrilaterals must be distributed over the area of the suspected
/// tag only. The detector holds nothing but size-derived constants; every
/// call works on fresh values.
pub struct TagDetector {
    width: f64,
    height: f64,
    tolerance_x: f64,
    tolerance_y: f64,
    // Hypothesis transforms for 90, 180 and 270 degrees.
    quarter_turns: [Matrix3<f64>; 3],
}

impl TagDetector {
    /// Creates a detector for sub-images of the given size.
    ///
    /// Fails on zero dimensions; a misconfigured detector would silently
    /// classify everything as noise.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "sub-image size must be positive, got {}x{}",
            width,
            height
        );

        let (w, h) = (width as f64, height as f64);
        let (cx, cy) = (w / 2.0, h / 2.0);

        Ok(Self {
            width: w,
            height: h,
            tolerance_x: w * 0.05,
            tolerance_y: h * 0.05,
            quarter_turns: [
                rotation_about_center(90.0, cx, cy),
                rotation_about_center(180.0, cx, cy),
                rotation_about_center(270.0, cx, cy),
            ],
        })
    }

    /// Searches the four rotation hypotheses for a geometrically consistent
    /// marker layout.
    ///
    /// `source_quad` is the quadrilateral in the original camera frame that
    /// the sub-image was unwarped from; it only feeds the continuous angle
    /// and the flip resolution, never the geometry search.
    pub fn detect(
        &self,
        candidates: &[Quadrilateral],
        source_quad: &Quadrilateral,
    ) -> Option<TagDetection> {
        let mut matched = None;

        for angle_index in 0..4u32 {
            let rotated: Vec<Quadrilateral> = match angle_index {
                0 => candidates.to_vec(),
                _ => {
                    let matrix = &self.quarter_turns[angle_index as usize - 1];
                    candidates.iter().map(|q| q.transformed(matrix)).collect()
                }
            };

            let classified = self.classify(&rotated);
            if !self.markers_present(&classified) {
                continue;
            }

            if let Some((layout, r1, r2)) = self.match_layout(&classified) {
                matched = Some((angle_index, layout, r1, r2, classified));
                break;
            }
        }

        let (angle_index, layout, r1, r2, classified) = matched?;

        let confidence = self.score_confidence(&classified, layout, r1, r2);
        let rotation_angle = resolve_angle(source_quad, angle_index, layout);
        let flipped_horizontally = detect_horizontal_flip(source_quad);

        let image_rotation = (angle_index + layout.index()) % 4;
        let markers_rotation = image_rotation as i32 - angle_index as i32;

        let markers = classified
            .iter()
            .map(|c| c.kind.map(|_| c.quad))
            .collect();

        Some(TagDetection {
            rotation_angle,
            image_rotation,
            markers_rotation,
            flipped_horizontally,
            markers,
            confidence,
        })
    }

    /// Labels every candidate as a horizontal bar, a vertical bar, or noise.
    fn classify(&self, quads: &[Quadrilateral]) -> Vec<Classified> {
        quads
            .iter()
            .map(|quad| Classified {
                quad: *quad,
                kind: self.classify_marker(quad),
            })
            .collect()
    }

    fn classify_marker(&self, quad: &Quadrilateral) -> Option<MarkerKind> {
        let width = quad.width();
        let height = quad.height();

        // Too large in both dimensions is the outer frame border; too small
        // in either is noise. Degenerate quads land in the second arm.
        if (width > self.width * 0.08 && height > self.height * 0.08)
            || width < self.width * 0.03
            || height < self.height * 0.03
        {
            return None;
        }

        let wtoh = width / height;
        let htow = height / width;

        // Long thin rectangle: not square, not an extreme sliver. Both
        // interval ends are open.
        if wtoh > 2.0 && wtoh < 4.5 {
            Some(MarkerKind::Horizontal)
        } else if htow > 2.0 && htow < 4.5 {
            Some(MarkerKind::Vertical)
        } else {
            None
        }
    }

    /// Quick rejection before the pairwise scan: a tag needs at least two
    /// markers, or one of each orientation.
    fn markers_present(&self, classified: &[Classified]) -> bool {
        let horizontal = classified
            .iter()
            .filter(|c| c.kind == Some(MarkerKind::Horizontal))
            .count();
        let vertical = classified
            .iter()
            .filter(|c| c.kind == Some(MarkerKind::Vertical))
            .count();

        horizontal >= 2 || vertical >= 2 || (horizontal >= 1 && vertical >= 1)
    }

    /// Looks for a marker pair positioned like the top two corners of a tag:
    /// `r1` in the top-left region, `r2` on the right at matching height.
    ///
    /// Scan order is array order for both loops; the first pair wins, which
    /// keeps tie-breaking reproducible.
    fn match_layout(&self, classified: &[Classified]) -> Option<(Layout, usize, usize)> {
        let near_left = self.width * 0.3;
        let near_top = self.height * 0.25;

        for (i, r1) in classified.iter().enumerate() {
            let Some(r1_kind) = r1.kind else { continue };
            if r1.quad.min_x() >= near_left || r1.quad.min_y() >= near_top {
                continue;
            }

            for (j, r2) in classified.iter().enumerate() {
                if i == j {
                    continue;
                }

                let min_y_delta = (r2.quad.min_y() - r1.quad.min_y()).abs();
                let max_y_delta = (r2.quad.max_y() - r1.quad.max_y()).abs();

                match (r1_kind, r2.kind) {
                    (MarkerKind::Horizontal, Some(MarkerKind::Horizontal)) => {
                        if min_y_delta < self.tolerance_y
                            && max_y_delta < self.tolerance_y
                            && r2.quad.min_x() > self.width * 0.6
                            && r2.quad.max_x() > self.width * 0.7
                        {
                            return Some((Layout::HorizontalHorizontal, i, j));
                        }
                    }
                    (MarkerKind::Horizontal, Some(MarkerKind::Vertical)) => {
                        if min_y_delta < self.tolerance_y
                            && r2.quad.min_x() > self.width * 0.7
                            && r2.quad.max_x() > self.width * 0.7
                        {
                            return Some((Layout::HorizontalVertical, i, j));
                        }
                    }
                    (MarkerKind::Vertical, Some(MarkerKind::Horizontal)) => {
                        if min_y_delta < self.tolerance_y
                            && r2.quad.min_x() > self.width * 0.6
                            && r2.quad.max_x() > self.width * 0.7
                        {
                            return Some((Layout::VerticalHorizontal, i, j));
                        }
                    }
                    (MarkerKind::Vertical, Some(MarkerKind::Vertical)) => {
                        if min_y_delta < self.tolerance_y
                            && max_y_delta < self.tolerance_y
                            && r2.quad.min_x() > self.width * 0.7
                            && r2.quad.max_x() > self.width * 0.7
                        {
                            return Some((Layout::VerticalVertical, i, j));
                        }
                    }
                    _ => {}
                }
            }
        }

        None
    }

    /// Raises the base confidence of 0.5 when markers in the bottom corners
    /// corroborate the matched top pair.
    ///
    /// The physical tag carries the opposite bar orientations along its
    /// bottom edge, so the expected kinds follow from the layout. A lone
    /// corroborator adds 0.15; a second one on the opposite side at matching
    /// height adds 0.2 more and ends the scan.
    fn score_confidence(
        &self,
        classified: &[Classified],
        layout: Layout,
        r1: usize,
        r2: usize,
    ) -> f64 {
        let bottom = self.height * 0.75;
        let near_left = self.width * 0.3;
        let near_right = self.width * 0.7;

        let (left_kind, right_kind) = match layout {
            Layout::VerticalVertical => (MarkerKind::Horizontal, MarkerKind::Horizontal),
            Layout::HorizontalHorizontal => (MarkerKind::Vertical, MarkerKind::Vertical),
            Layout::VerticalHorizontal => (MarkerKind::Vertical, MarkerKind::Horizontal),
            Layout::HorizontalVertical => (MarkerKind::Horizontal, MarkerKind::Vertical),
        };

        let mut confidence = 0.5;
        let mut remembered: Option<&Classified> = None;

        for (k, r3) in classified.iter().enumerate() {
            if k == r1 || k == r2 {
                continue;
            }
            let Some(kind) = r3.kind else { continue };
            if r3.quad.max_y() <= bottom {
                continue;
            }

            if kind == left_kind
                && r3.quad.min_x() < near_left
                && (r3.quad.min_x() - classified[r1].quad.min_x()).abs() < self.tolerance_x
            {
                if let Some(other) = remembered {
                    if other.quad.max_x() > near_right
                        && (r3.quad.max_y() - other.quad.max_y()).abs() < self.tolerance_y
                    {
                        confidence += 0.2;
                        break;
                    }
                }
                confidence += 0.15;
                remembered = Some(r3);
            } else if kind == right_kind
                && r3.quad.max_x() > near_right
                && (r3.quad.max_x() - classified[r2].quad.max_x()).abs() < self.tolerance_x
            {
                if let Some(other) = remembered {
                    if other.quad.min_x() < near_left
                        && (r3.quad.max_y() - other.quad.max_y()).abs() < self.tolerance_y
                    {
                        confidence += 0.2;
                        break;
                    }
                }
                confidence += 0.15;
                remembered = Some(r3);
            }
        }

        confidence
    }
}

/// Direction of the edge from `b` to `a`, in degrees.
///
/// Argument order is x-delta first: the angle is measured against the y
/// axis, which is what the per-layout resolution formulas expect.
fn edge_angle(a: Point2<f64>, b: Point2<f64>) -> f64 {
    (a.x - b.x).atan2(a.y - b.y).to_degrees()
}

/// Relabels which corner of `quad` counts as P0, shifting the cyclic order
/// by `quarter_turns`. Points do not move; only their labels rotate to
/// match the winning analysis frame.
fn relabel_corners(quad: &Quadrilateral, quarter_turns: u32) -> Quadrilateral {
    let p = quad.points();
    let s = quarter_turns as usize % 4;
    Quadrilateral::new(p[s], p[(s + 1) % 4], p[(s + 2) % 4], p[(s + 3) % 4])
}

/// Converts the discrete hypothesis plus the source quadrilateral's edge
/// directions into a continuous rotation angle in `[0, 360)`.
fn resolve_angle(source_quad: &Quadrilateral, angle_index: u32, layout: Layout) -> f64 {
    let relabeled = relabel_corners(source_quad, angle_index);

    let angle01 = edge_angle(relabeled.p0(), relabeled.p1());
    let angle03 = edge_angle(relabeled.p0(), relabeled.p3());

    let mut angle = match layout {
        Layout::VerticalVertical => {
            if angle01 > 0.0 {
                180.0 - angle01
            } else {
                180.0 + angle01.abs()
            }
        }
        Layout::VerticalHorizontal => {
            if angle03 > 0.0 {
                360.0 - angle03
            } else {
                angle03.abs()
            }
        }
        Layout::HorizontalHorizontal => {
            if angle01 > 0.0 {
                360.0 - angle01
            } else {
                -angle01
            }
        }
        Layout::HorizontalVertical => 180.0 - angle03,
    };

    if angle < 0.0 {
        angle += 360.0;
    }
    if angle >= 360.0 {
        angle %= 360.0;
    }

    angle
}

/// Flip resolution from the original, unrotated source quadrilateral.
///
/// The corner crossings only say that *some* mirroring happened; the edge
/// angle signs decide whether it reads as a horizontal flip.
fn detect_horizontal_flip(source_quad: &Quadrilateral) -> bool {
    let crossed_x =
        source_quad.p0().x > source_quad.p2().x || source_quad.p1().x > source_quad.p3().x;
    let crossed_y =
        source_quad.p0().y > source_quad.p2().y || source_quad.p1().y < source_quad.p3().y;

    if !crossed_x && !crossed_y {
        return false;
    }

    let angle01 = edge_angle(source_quad.p0(), source_quad.p1());
    let angle03 = edge_angle(source_quad.p0(), source_quad.p3());

    angle01 < 0.0 || angle03 > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation_about_center;

    const SIZE: u32 = 128;

    fn detector() -> TagDetector {
        TagDetector::new(SIZE, SIZE).unwrap()
    }

    fn upright_source() -> Quadrilateral {
        Quadrilateral::upright(SIZE as f64, SIZE as f64)
    }

    /// Horizontal bar with top-left corner at (x, y), 24x8.
    fn horizontal_bar(x: f64, y: f64) -> Quadrilateral {
        Quadrilateral::from_coords([(x, y), (x + 24.0, y), (x + 24.0, y + 8.0), (x, y + 8.0)])
    }

    /// Vertical bar with top-left corner at (x, y), 8x24.
    fn vertical_bar(x: f64, y: f64) -> Quadrilateral {
        Quadrilateral::from_coords([(x, y), (x + 8.0, y), (x + 8.0, y + 24.0), (x, y + 24.0)])
    }

    fn bar_of_size(x: f64, y: f64, w: f64, h: f64) -> Quadrilateral {
        Quadrilateral::from_coords([(x, y), (x + w, y), (x + w, y + h), (x, y + h)])
    }

    #[test]
    fn test_detector_rejects_zero_size() {
        assert!(TagDetector::new(0, 128).is_err());
        assert!(TagDetector::new(128, 0).is_err());
    }

    #[test]
    fn test_classifier_aspect_boundaries_are_open() {
        let det = detector();
        // Ratio exactly 2.0 and exactly 4.5: non-markers on both endpoints.
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 20.0, 10.0)).is_none());
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 10.0, 20.0)).is_none());
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 18.0, 4.0)).is_none());
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 4.0, 18.0)).is_none());
        // Just inside the interval.
        assert_eq!(
            det.classify_marker(&bar_of_size(10.0, 10.0, 24.0, 8.0)),
            Some(MarkerKind::Horizontal)
        );
        assert_eq!(
            det.classify_marker(&bar_of_size(10.0, 10.0, 8.0, 24.0)),
            Some(MarkerKind::Vertical)
        );
    }

    #[test]
    fn test_classifier_size_filter() {
        let det = detector();
        // Both dimensions over 8% of the image: frame border, not a marker,
        // even at a marker-like aspect ratio.
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 30.0, 12.0)).is_none());
        // Either dimension under 3%: noise.
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 9.0, 3.0)).is_none());
        // Degenerate quad.
        assert!(det.classify_marker(&bar_of_size(10.0, 10.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_detects_vv_layout_upright() {
        let det = detector();
        // Index 0 is a 40x30 blob (ratio 1.33): present but not a marker.
        let candidates = [
            Quadrilateral::from_coords([(10.0, 10.0), (10.0, 40.0), (50.0, 40.0), (50.0, 10.0)]),
            vertical_bar(10.0, 10.0),
            vertical_bar(100.0, 10.0),
        ];

        let detection = det.detect(&candidates, &upright_source()).unwrap();
        assert_eq!(detection.image_rotation, 0);
        assert_eq!(detection.markers_rotation, 0);
        assert!(!detection.flipped_horizontally);
        assert!((detection.rotation_angle - 0.0).abs() < 1e-9);
        assert!((detection.confidence - 0.5).abs() < 1e-9);

        // Marker slots stay index-aligned with the candidates.
        assert_eq!(detection.markers.len(), 3);
        assert!(detection.markers[0].is_none());
        assert!(detection.markers[1].is_some());
        assert!(detection.markers[2].is_some());
    }

    #[test]
    fn test_detects_hv_layout() {
        let det = detector();
        let candidates = [horizontal_bar(10.0, 10.0), vertical_bar(100.0, 10.0)];

        let detection = det.detect(&candidates, &upright_source()).unwrap();
        assert_eq!(detection.image_rotation, 1);
        assert_eq!(detection.markers_rotation, 1);
        assert!((detection.rotation_angle - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_detects_hh_layout() {
        let det = detector();
        let candidates = [horizontal_bar(10.0, 10.0), horizontal_bar(90.0, 10.0)];

        let detection = det.detect(&candidates, &upright_source()).unwrap();
        assert_eq!(detection.image_rotation, 2);
        assert_eq!(detection.markers_rotation, 2);
        assert!((detection.rotation_angle - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_detects_vh_layout() {
        let det = detector();
        let candidates = [vertical_bar(10.0, 10.0), horizontal_bar(90.0, 10.0)];

        let detection = det.detect(&candidates, &upright_source()).unwrap();
        assert_eq!(detection.image_rotation, 3);
        assert_eq!(detection.markers_rotation, 3);
        assert!((detection.rotation_angle - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotated_candidates_shift_image_rotation() {
        let det = detector();
        let base = [vertical_bar(10.0, 10.0), vertical_bar(100.0, 10.0)];
        let source = upright_source();
        let center = SIZE as f64 / 2.0;

        let expected_angles = [0.0, 270.0, 180.0, 90.0];

        for turns in 0..4u32 {
            // Rotate the tag counter-clockwise by `turns` quarter turns;
            // the hypothesis search undoes it clockwise.
            let matrix = rotation_about_center(-90.0 * turns as f64, center, center);
            let rotated: Vec<Quadrilateral> = base.iter().map(|q| q.transformed(&matrix)).collect();

            let detection = det.detect(&rotated, &source).unwrap();
            assert_eq!(detection.image_rotation, turns, "turns = {}", turns);
            assert_eq!(
                detection.markers_rotation,
                detection.image_rotation as i32 - turns as i32
            );
            assert!(
                (detection.rotation_angle - expected_angles[turns as usize]).abs() < 1e-9,
                "turns = {}: got {}",
                turns,
                detection.rotation_angle
            );
        }
    }

    #[test]
    fn test_markers_reported_in_winning_frame() {
        let det = detector();
        let base = [vertical_bar(10.0, 10.0), vertical_bar(100.0, 10.0)];
        let center = SIZE as f64 / 2.0;
        let matrix = rotation_about_center(-90.0, center, center);
        let rotated: Vec<Quadrilateral> = base.iter().map(|q| q.transformed(&matrix)).collect();

        let detection = det.detect(&rotated, &upright_source()).unwrap();

        // The winning hypothesis rotated the candidates back into the VV
        // arrangement, so the reported markers sit at the base positions.
        let first = detection.markers[0].unwrap();
        assert!((first.min_x() - 10.0).abs() < 1e-9);
        assert!((first.min_y() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_raised_by_corroborating_markers() {
        let det = detector();
        let source = upright_source();

        let two = [vertical_bar(10.0, 10.0), vertical_bar(100.0, 10.0)];
        let three = [
            vertical_bar(10.0, 10.0),
            vertical_bar(100.0, 10.0),
            horizontal_bar(10.0, 110.0),
        ];
        let four = [
            vertical_bar(10.0, 10.0),
            vertical_bar(100.0, 10.0),
            horizontal_bar(10.0, 110.0),
            horizontal_bar(84.0, 110.0),
        ];

        let base = det.detect(&two, &source).unwrap().confidence;
        let one_extra = det.detect(&three, &source).unwrap().confidence;
        let both_extra = det.detect(&four, &source).unwrap().confidence;

        assert!((base - 0.5).abs() < 1e-9);
        assert!((one_extra - 0.65).abs() < 1e-9);
        assert!((both_extra - 0.85).abs() < 1e-9);
        assert!(one_extra > base && both_extra > one_extra);
    }

    #[test]
    fn test_misplaced_third_marker_keeps_base_confidence() {
        let det = detector();
        // Bottom-left corroborator with the wrong orientation for VV.
        let candidates = [
            vertical_bar(10.0, 10.0),
            vertical_bar(100.0, 10.0),
            vertical_bar(10.0, 94.0),
        ];

        let detection = det.detect(&candidates, &upright_source()).unwrap();
        assert!((detection.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_flip_detected_from_mirrored_source_quad() {
        let det = detector();
        let candidates = [vertical_bar(10.0, 10.0), vertical_bar(100.0, 10.0)];
        let mirrored = Quadrilateral::from_coords([
            (128.0, 0.0),
            (128.0, 128.0),
            (0.0, 128.0),
            (0.0, 0.0),
        ]);

        let detection = det.detect(&candidates, &mirrored).unwrap();
        assert!(detection.flipped_horizontally);
    }

    #[test]
    fn test_no_tag_in_empty_or_single_marker_sets() {
        let det = detector();
        let source = upright_source();

        assert!(det.detect(&[], &source).is_none());
        assert!(det.detect(&[vertical_bar(10.0, 10.0)], &source).is_none());
    }

    #[test]
    fn test_two_markers_without_layout_are_rejected() {
        let det = detector();
        // One of each orientation passes the presence precheck, but neither
        // sits in the top-left region.
        let candidates = [horizontal_bar(50.0, 60.0), vertical_bar(100.0, 60.0)];

        assert!(det.detect(&candidates, &upright_source()).is_none());
    }
}
