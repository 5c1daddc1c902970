use std::{path::PathBuf, time::Duration};

use crnn_net::CrnnNet;
use east_net::EastNet;

mod catalog;
pub mod crnn_net;
pub mod east_net;
mod error;
pub mod geometry;
mod pipeline;
pub mod region;
mod result;
mod session;
pub mod suppression;
pub mod util;

pub use catalog::*;
pub use error::{Error, Result};
pub use geometry::DetectionMap;
pub use pipeline::{join_catalog, trim_trailing, Pipeline, TextDetector, TextRecognizer};
pub use result::*;
pub use suppression::OverlapMetric;
use tracing::instrument;

pub use ort as runtime;

/// Detection and recognition backed by the bundled ONNX nets.
pub type MedScan = Pipeline<EastNet, CrnnNet>;

pub struct MedScanBuilder {
    threads: usize,
    det_path: Option<PathBuf>,
    rec_paths: Option<(PathBuf, PathBuf)>,
    input_size: (u32, u32),
    channels_last: bool,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
}

impl MedScanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = Some(path.into());
        self
    }

    pub fn rec_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        self.rec_paths = Some((model_path.into(), keys_path.into()));
        self
    }

    /// Size the detector resizes every image to. Both sides must be
    /// multiples of 32.
    pub fn input_size(mut self, width: u32, height: u32) -> Self {
        self.input_size = (width, height);
        self
    }

    /// Feed the detector `NHWC` instead of `NCHW`, as TensorFlow exports
    /// expect.
    pub fn channels_last(mut self, channels_last: bool) -> Self {
        self.channels_last = channels_last;
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    #[instrument(skip(self), level = "debug")]
    fn init_models(&mut self) -> Result<(EastNet, CrnnNet)> {
        let (width, height) = self.input_size;
        if width == 0 || height == 0 || width % 32 != 0 || height % 32 != 0 {
            return Err(Error::configuration(format!(
                "detector input size {width}x{height} must be non-zero multiples of 32"
            )));
        }
        let det_path = self
            .det_path
            .take()
            .unwrap_or_else(|| "models/frozen_east_text_detection.onnx".into());
        let (rec_path, keys_path) = self.rec_paths.take().unwrap_or_else(|| {
            (
                "models/ch_PP-OCRv4_rec_infer/ch_PP-OCRv4_rec_infer.onnx".into(),
                "models/ppocr_keys_v1.txt".into(),
            )
        });
        Ok((
            EastNet::init(
                det_path,
                self.threads,
                self.input_size,
                self.channels_last,
                &self.execution_providers,
                self.cache_path.clone(),
            )?,
            CrnnNet::init(
                rec_path,
                keys_path,
                self.threads,
                &self.execution_providers,
                self.cache_path.clone(),
            )?,
        ))
    }

    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<MedScan> {
        let (det_model, rec_model) = self.init_models()?;
        Ok(Pipeline::new(det_model, rec_model))
    }
}

impl Default for MedScanBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            det_path: None,
            rec_paths: None,
            input_size: (320, 320),
            channels_last: false,
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

/// Per-call tunables for [`Pipeline::detect_and_recognize`].
#[derive(Debug, Clone, Copy)]
pub struct DetectionOptions {
    /// Cells scoring below this produce no candidate.
    pub min_confidence: f32,
    /// Input pixels per detection cell.
    pub cell_stride: f32,
    /// Largest overlap two surviving boxes may share.
    pub overlap_threshold: f32,
    pub overlap_metric: OverlapMetric,
    /// Characters dropped from the end of every recognized line before it is
    /// used as a lookup key.
    pub trim_trailing_chars: usize,
    /// `None` waits for the recognizer indefinitely.
    pub recognition_timeout: Option<Duration>,
}

impl DetectionOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::configuration(format!(
                "min_confidence {} is outside [0, 1]",
                self.min_confidence
            )));
        }
        if !(self.cell_stride.is_finite() && self.cell_stride > 0.0) {
            return Err(Error::configuration(format!(
                "cell_stride {} must be positive",
                self.cell_stride
            )));
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(Error::configuration(format!(
                "overlap_threshold {} is outside [0, 1]",
                self.overlap_threshold
            )));
        }
        if self.recognition_timeout == Some(Duration::ZERO) {
            return Err(Error::configuration("recognition_timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.9,
            cell_stride: 4.0,
            overlap_threshold: 0.3,
            overlap_metric: OverlapMetric::IntersectionOverSmaller,
            trim_trailing_chars: 2,
            recognition_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        let options = DetectionOptions::default();
        assert_eq!(options.min_confidence, 0.9);
        assert_eq!(options.cell_stride, 4.0);
        assert_eq!(options.overlap_threshold, 0.3);
        assert_eq!(options.trim_trailing_chars, 2);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn nan_and_out_of_range_tunables_are_rejected() {
        let nan_confidence = DetectionOptions {
            min_confidence: f32::NAN,
            ..Default::default()
        };
        let zero_stride = DetectionOptions {
            cell_stride: 0.0,
            ..Default::default()
        };
        let zero_timeout = DetectionOptions {
            recognition_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        for options in [nan_confidence, zero_stride, zero_timeout] {
            assert!(matches!(options.validate(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn builder_rejects_unaligned_input_size() {
        let result = MedScanBuilder::new()
            .input_size(300, 320)
            .det_model("missing.onnx")
            .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
