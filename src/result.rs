use image::DynamicImage;
use serde::Serialize;

use crate::CatalogEntry;

/// Axis-aligned box proposed by a single detection cell, in resized-image
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateBox {
    pub start_x: i32,
    pub start_y: i32,
    pub end_x: i32,
    pub end_y: i32,
    pub confidence: f32,
    /// Rotation reported by the cell. Only used to place the anchor corner.
    pub angle: f32,
}

impl CandidateBox {
    pub fn width(&self) -> i64 {
        i64::from(self.end_x) - i64::from(self.start_x)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.end_y) - i64::from(self.start_y)
    }

    pub fn area(&self) -> f32 {
        (self.width().max(0) as f32) * (self.height().max(0) as f32)
    }

    pub fn is_inverted(&self) -> bool {
        self.start_x > self.end_x || self.start_y > self.end_y
    }

    pub fn intersection_area(&self, other: &CandidateBox) -> f32 {
        let x1 = i64::from(self.start_x.max(other.start_x));
        let y1 = i64::from(self.start_y.max(other.start_y));
        let x2 = i64::from(self.end_x.min(other.end_x));
        let y2 = i64::from(self.end_y.min(other.end_y));
        ((x2 - x1).max(0) as f32) * ((y2 - y1).max(0) as f32)
    }
}

/// A candidate that survived overlap suppression.
pub type SurvivingBox = CandidateBox;

/// Box in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OriginalBox {
    pub start_x: u32,
    pub start_y: u32,
    pub end_x: u32,
    pub end_y: u32,
}

impl OriginalBox {
    pub fn width(&self) -> u32 {
        self.end_x.saturating_sub(self.start_x)
    }

    pub fn height(&self) -> u32 {
        self.end_y.saturating_sub(self.start_y)
    }

    pub fn is_empty(&self) -> bool {
        self.start_x >= self.end_x || self.start_y >= self.end_y
    }
}

/// Cropped pixels for one surviving box.
#[derive(Debug, Clone)]
pub struct Region {
    pub bounds: OriginalBox,
    pub image: DynamicImage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TextLine {
    pub text: String,
    pub character_scores: Vec<f32>,
}

impl TextLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            character_scores: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub bounds: OriginalBox,
    /// Recognized text after the trailing trim.
    pub text: String,
    pub confidence: f32,
}

/// A detection joined against the catalog. Only produced for non-empty
/// matches.
#[derive(Debug, Clone, Serialize)]
pub struct MedicineMatch {
    pub detection: DetectionResult,
    pub entries: Vec<CatalogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(start_x: i32, start_y: i32, end_x: i32, end_y: i32) -> CandidateBox {
        CandidateBox {
            start_x,
            start_y,
            end_x,
            end_y,
            confidence: 1.0,
            angle: 0.0,
        }
    }

    #[test]
    fn intersection_of_disjoint_boxes_is_zero() {
        let a = candidate(0, 0, 10, 10);
        let b = candidate(20, 20, 30, 30);
        assert_eq!(a.intersection_area(&b), 0.0);
    }

    #[test]
    fn intersection_of_nested_boxes_is_inner_area() {
        let outer = candidate(0, 0, 100, 100);
        let inner = candidate(10, 10, 30, 20);
        assert_eq!(outer.intersection_area(&inner), 200.0);
        assert_eq!(inner.intersection_area(&outer), 200.0);
    }

    #[test]
    fn extreme_coordinates_do_not_overflow() {
        let huge = candidate(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(huge.width(), u32::MAX as i64);
        assert!(huge.area() > 0.0);
        assert!(huge.intersection_area(&candidate(0, 0, 10, 10)) == 100.0);
    }

    #[test]
    fn inverted_box_has_no_area() {
        let inverted = candidate(10, 0, 5, 10);
        assert!(inverted.is_inverted());
        assert_eq!(inverted.area(), 0.0);
    }

    #[test]
    fn original_box_reports_empty_crops() {
        let flat = OriginalBox {
            start_x: 4,
            start_y: 7,
            end_x: 20,
            end_y: 7,
        };
        assert!(flat.is_empty());
        assert_eq!(flat.width(), 16);
        assert_eq!(flat.height(), 0);
    }
}
