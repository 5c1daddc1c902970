use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{ArrayView2, Axis, Ix2};
use ort::{inputs, Session};
use std::path::PathBuf;
use tracing::instrument;

use crate::{
    error::Error,
    pipeline::TextRecognizer,
    session::{build_session, ShapeProfile},
    util::subtract_mean_normalize,
    ExecutionProvider, Region, Result, TextLine,
};

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];
const DEST_HEIGHT: u32 = 48;

/// CRNN line recognizer with greedy CTC decoding. Index 0 is the blank.
pub struct CrnnNet {
    session: Session,
    keys: Vec<String>,
}

impl CrnnNet {
    #[instrument(level = "debug")]
    pub fn init(
        model_path: PathBuf,
        keys_path: PathBuf,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> Result<Self> {
        let profile = ShapeProfile {
            min: format!("x:1x3x{DEST_HEIGHT}x1"),
            opt: format!("x:1x3x{DEST_HEIGHT}x256"),
            max: format!("x:1x3x{DEST_HEIGHT}x{}", u16::MAX),
        };
        let session = build_session(
            &model_path,
            num_threads,
            execution_providers,
            cache_path.as_ref(),
            &profile,
        )?;

        let keys = std::fs::read_to_string(&keys_path)?;
        let keys = ["#".to_string()]
            .into_iter()
            .chain(keys.lines().map(|line| line.to_string()))
            .chain([" ".to_string()])
            .collect::<Vec<_>>();
        log::debug!("Loaded {} recognition keys from {keys_path:?}", keys.len());

        Ok(Self { session, keys })
    }

    #[instrument(level = "trace", skip(self, image))]
    fn get_text_line(&self, image: &DynamicImage) -> Result<TextLine> {
        let scale = DEST_HEIGHT as f32 / image.height() as f32;
        let dest_width = ((image.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
        let image = image.resize_exact(dest_width, DEST_HEIGHT, FilterType::Nearest);

        let tensor_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => tensor_values]?)?;
        let (_, output) = outputs
            .first_key_value()
            .ok_or_else(|| Error::Recognition("model produced no outputs".into()))?;
        let output_tensor = output.try_extract_tensor::<f32>()?;

        log::trace!("Output tensor size: {:?}", output_tensor.dim());
        let output = output_tensor
            .remove_axis(Axis(0))
            .into_dimensionality::<Ix2>()?;

        Ok(ctc_greedy_decode(&self.keys, output))
    }
}

/// Takes the best class per time step, collapsing repeats and dropping blanks
/// and out-of-vocabulary indices.
fn ctc_greedy_decode(keys: &[String], data: ArrayView2<f32>) -> TextLine {
    let mut previous = 0;
    let mut text = String::new();
    let mut character_scores = Vec::new();

    for (index, score) in data.outer_iter().filter_map(|step| {
        step.indexed_iter()
            .max_by_key(|(_, value)| FloatOrd(**value))
            .map(|(i, value)| (i, *value))
    }) {
        if index != previous && index > 0 && index < keys.len() {
            text.push_str(&keys[index]);
            character_scores.push(score);
        }
        previous = index;
    }

    TextLine {
        text,
        character_scores,
    }
}

impl TextRecognizer for CrnnNet {
    fn recognize(&self, region: &Region) -> Result<TextLine> {
        self.get_text_line(&region.image)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|it| it.to_string()).collect()
    }

    #[test]
    fn ctc_collapses_repeats_and_blanks() {
        let data = arr2(&[
            [0.1, 0.8, 0.1, 0.0],
            [0.1, 0.7, 0.2, 0.0],
            [0.9, 0.05, 0.05, 0.0],
            [0.1, 0.6, 0.3, 0.0],
            [0.0, 0.1, 0.9, 0.0],
        ]);
        let line = ctc_greedy_decode(&keys(&["#", "a", "b", " "]), data.view());
        assert_eq!(line.text, "aab");
        assert_eq!(line.character_scores, vec![0.8, 0.6, 0.9]);
    }

    #[test]
    fn indices_past_the_key_list_are_dropped() {
        let data = arr2(&[[0.0, 0.2, 0.8], [0.0, 0.9, 0.1]]);
        let line = ctc_greedy_decode(&keys(&["#", "a"]), data.view());
        assert_eq!(line.text, "a");
    }

    #[test]
    fn all_blank_is_empty_line() {
        let data = arr2(&[[0.9, 0.1], [0.8, 0.2]]);
        assert_eq!(
            ctc_greedy_decode(&keys(&["#", "a"]), data.view()),
            TextLine::default()
        );
    }
}
