use std::cmp::Reverse;

use float_ord::FloatOrd;
use tracing::instrument;

use crate::{CandidateBox, SurvivingBox};

/// How much two boxes overlap, as a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapMetric {
    /// Intersection divided by the smaller of the two areas.
    #[default]
    IntersectionOverSmaller,
    IntersectionOverUnion,
}

impl OverlapMetric {
    pub fn overlap(self, a: &CandidateBox, b: &CandidateBox) -> f32 {
        let intersection = a.intersection_area(b);
        if intersection <= 0.0 {
            return 0.0;
        }
        let denominator = match self {
            Self::IntersectionOverSmaller => a.area().min(b.area()),
            Self::IntersectionOverUnion => a.area() + b.area() - intersection,
        };
        if denominator > 0.0 {
            intersection / denominator
        } else {
            0.0
        }
    }
}

/// Greedy suppression. Survivors come back sorted by descending confidence;
/// equal confidences keep their input order.
#[instrument(skip(candidates), fields(candidates = candidates.len()), level = "debug")]
pub fn suppress_overlaps(
    mut candidates: Vec<CandidateBox>,
    threshold: f32,
    metric: OverlapMetric,
) -> Vec<SurvivingBox> {
    candidates.sort_by_key(|it| Reverse(FloatOrd(it.confidence)));

    let mut kept: Vec<SurvivingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|survivor| metric.overlap(survivor, &candidate) <= threshold)
        {
            kept.push(candidate);
        }
    }

    log::debug!("{} boxes survived suppression", kept.len());
    kept
}
