use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use tracing::instrument;

use crate::{error::Error, CandidateBox, Result};

/// Channels of the geometry grid: distances to the top, right, bottom and left
/// edges, then the rotation angle in radians.
pub const GEOMETRY_CHANNELS: usize = 5;

// Decoded coordinates beyond this are treated as garbage. Keeps every
// difference of two coordinates inside `i32`.
const MAX_COORD: f32 = (1 << 24) as f32;

/// Dense per-cell detector output. `scores` is `(rows, cols)` and `geometry`
/// is `(5, rows, cols)`.
#[derive(Debug, Clone)]
pub struct DetectionMap {
    scores: Array2<f32>,
    geometry: Array3<f32>,
}

impl DetectionMap {
    pub fn new(scores: Array2<f32>, geometry: Array3<f32>) -> Result<Self> {
        let (channels, rows, cols) = geometry.dim();
        if channels != GEOMETRY_CHANNELS {
            return Err(Error::configuration(format!(
                "geometry grid has {channels} channels, expected {GEOMETRY_CHANNELS}"
            )));
        }
        if scores.dim() != (rows, cols) {
            return Err(Error::configuration(format!(
                "score grid is {:?} but geometry grid is {:?}",
                scores.dim(),
                (rows, cols)
            )));
        }
        Ok(Self { scores, geometry })
    }

    pub fn rows(&self) -> usize {
        self.scores.len_of(Axis(0))
    }

    pub fn cols(&self) -> usize {
        self.scores.len_of(Axis(1))
    }

    pub fn scores(&self) -> ArrayView2<f32> {
        self.scores.view()
    }

    pub fn geometry(&self) -> ArrayView3<f32> {
        self.geometry.view()
    }
}

/// Turns every cell scoring at least `min_confidence` into a candidate box.
/// Cells are visited row-major.
#[instrument(skip(map), level = "debug")]
pub fn decode_candidates(
    map: &DetectionMap,
    min_confidence: f32,
    cell_stride: f32,
) -> Vec<CandidateBox> {
    let geometry = map.geometry();
    let mut discarded = 0usize;

    let candidates = map
        .scores()
        .indexed_iter()
        .filter(|(_, score)| **score >= min_confidence)
        .filter_map(|((y, i), score)| {
            let cell = geometry.slice(ndarray::s![.., y, i]);
            let candidate = decode_cell(
                i as f32 * cell_stride,
                y as f32 * cell_stride,
                [cell[0], cell[1], cell[2], cell[3]],
                cell[4],
                *score,
            );
            match candidate {
                Some(candidate) if !candidate.is_inverted() => Some(candidate),
                _ => {
                    log::trace!("Discarding candidate {candidate:?} at cell ({y}, {i})");
                    discarded += 1;
                    None
                }
            }
        })
        .collect::<Vec<_>>();

    log::debug!(
        "Decoded {} candidates from {}x{} cells ({discarded} discarded)",
        candidates.len(),
        map.rows(),
        map.cols()
    );
    candidates
}

/// `distances` is `[top, right, bottom, left]`. The angle only moves the
/// bottom-right anchor; the box itself stays axis-aligned. `None` when a
/// coordinate is NaN, infinite or absurdly large.
fn decode_cell(
    offset_x: f32,
    offset_y: f32,
    [top, right, bottom, left]: [f32; 4],
    angle: f32,
    confidence: f32,
) -> Option<CandidateBox> {
    let (sin, cos) = angle.sin_cos();
    let height = top + bottom;
    let width = right + left;

    let end_x = (offset_x + cos * right + sin * bottom).round();
    let end_y = (offset_y - sin * right + cos * bottom).round();
    let start_x = (end_x - width).round();
    let start_y = (end_y - height).round();

    let coord = |value: f32| (value.abs() <= MAX_COORD).then_some(value as i32);
    Some(CandidateBox {
        start_x: coord(start_x)?,
        start_y: coord(start_y)?,
        end_x: coord(end_x)?,
        end_y: coord(end_y)?,
        confidence,
        angle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_map(rows: usize, cols: usize) -> (Array2<f32>, Array3<f32>) {
        (
            Array2::zeros((rows, cols)),
            Array3::zeros((GEOMETRY_CHANNELS, rows, cols)),
        )
    }

    fn set_cell(geometry: &mut Array3<f32>, y: usize, x: usize, values: [f32; 5]) {
        for (channel, value) in values.into_iter().enumerate() {
            geometry[[channel, y, x]] = value;
        }
    }

    #[test]
    fn single_cell_decodes_to_expected_box() {
        let (mut scores, mut geometry) = blank_map(80, 80);
        scores[[10, 20]] = 0.95;
        set_cell(&mut geometry, 10, 20, [5.0, 8.0, 5.0, 8.0, 0.0]);
        let map = DetectionMap::new(scores, geometry).unwrap();

        let candidates = decode_candidates(&map, 0.9, 4.0);

        assert_eq!(candidates.len(), 1);
        let candidate = candidates[0];
        assert_eq!(
            (
                candidate.start_x,
                candidate.start_y,
                candidate.end_x,
                candidate.end_y
            ),
            (72, 35, 88, 45)
        );
        assert_eq!(candidate.confidence, 0.95);
    }

    #[test]
    fn cells_below_threshold_emit_nothing() {
        let (mut scores, geometry) = blank_map(8, 8);
        scores.fill(0.89);
        let map = DetectionMap::new(scores, geometry).unwrap();
        assert!(decode_candidates(&map, 0.9, 4.0).is_empty());
    }

    #[test]
    fn threshold_is_inclusive() {
        let (mut scores, geometry) = blank_map(2, 2);
        scores[[1, 1]] = 0.5;
        let map = DetectionMap::new(scores, geometry).unwrap();
        assert_eq!(decode_candidates(&map, 0.5, 4.0).len(), 1);
    }

    #[test]
    fn emission_is_row_major() {
        let (mut scores, mut geometry) = blank_map(4, 4);
        for (y, x) in [(2, 0), (0, 3), (0, 1)] {
            scores[[y, x]] = 0.99;
            set_cell(&mut geometry, y, x, [1.0, 1.0, 1.0, 1.0, 0.0]);
        }
        let map = DetectionMap::new(scores, geometry).unwrap();

        let anchors = decode_candidates(&map, 0.9, 4.0)
            .iter()
            .map(|it| (it.end_x, it.end_y))
            .collect::<Vec<_>>();

        assert_eq!(anchors, vec![(5, 1), (13, 1), (1, 9)]);
    }

    #[test]
    fn rotation_moves_anchor_but_keeps_box_axis_aligned() {
        let (mut scores, mut geometry) = blank_map(4, 4);
        scores[[1, 1]] = 0.99;
        let angle = std::f32::consts::FRAC_PI_2;
        set_cell(&mut geometry, 1, 1, [2.0, 6.0, 4.0, 3.0, angle]);
        let map = DetectionMap::new(scores, geometry).unwrap();

        let candidate = decode_candidates(&map, 0.9, 4.0)[0];

        // cos = 0, sin = 1: end_x = 4 + 4, end_y = 4 - 6
        assert_eq!((candidate.end_x, candidate.end_y), (8, -2));
        assert_eq!(candidate.width(), 9);
        assert_eq!(candidate.height(), 6);
        assert_eq!(candidate.angle, angle);
    }

    #[test]
    fn inverted_boxes_are_discarded() {
        let (mut scores, mut geometry) = blank_map(2, 2);
        scores[[0, 0]] = 0.99;
        set_cell(&mut geometry, 0, 0, [1.0, -10.0, 1.0, 2.0, 0.0]);
        let map = DetectionMap::new(scores, geometry).unwrap();
        assert!(decode_candidates(&map, 0.9, 4.0).is_empty());
    }

    #[test]
    fn huge_and_nan_distances_are_discarded() {
        let (mut scores, mut geometry) = blank_map(4, 4);
        scores[[1, 1]] = 0.99;
        set_cell(&mut geometry, 1, 1, [1.0, 3.0e9, 1.0, 3.0e9, 0.0]);
        scores[[2, 2]] = 0.99;
        set_cell(&mut geometry, 2, 2, [f32::NAN, 1.0, 1.0, 1.0, 0.0]);
        scores[[3, 3]] = 0.99;
        set_cell(&mut geometry, 3, 3, [1.0, 1.0, 1.0, 1.0, f32::INFINITY]);
        scores[[0, 0]] = 0.99;
        set_cell(&mut geometry, 0, 0, [2.0, 3.0, 2.0, 3.0, 0.0]);
        let map = DetectionMap::new(scores, geometry).unwrap();

        let candidates = decode_candidates(&map, 0.9, 4.0);

        assert_eq!(candidates.len(), 1);
        assert_eq!((candidates[0].end_x, candidates[0].end_y), (3, 2));
    }

    #[test]
    fn candidate_count_never_exceeds_cells() {
        let (mut scores, mut geometry) = blank_map(6, 5);
        scores.fill(1.0);
        geometry.fill(1.0);
        let map = DetectionMap::new(scores, geometry).unwrap();
        assert_eq!(decode_candidates(&map, 0.9, 4.0).len(), 30);
    }

    #[test]
    fn mismatched_grids_are_rejected() {
        let scores = Array2::zeros((80, 80));
        let geometry = Array3::zeros((GEOMETRY_CHANNELS, 80, 79));
        assert!(matches!(
            DetectionMap::new(scores, geometry),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let scores = Array2::zeros((4, 4));
        let geometry = Array3::zeros((4, 4, 4));
        assert!(matches!(
            DetectionMap::new(scores, geometry),
            Err(Error::Configuration(_))
        ));
    }
}
