use std::path::PathBuf;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array3, ArrayViewD, Axis, Ix4};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    error::Error,
    geometry::{DetectionMap, GEOMETRY_CHANNELS},
    pipeline::TextDetector,
    session::{build_session, ShapeProfile},
    util::subtract_mean_normalize,
    ExecutionProvider, Result,
};

// Per-channel RGB means on a 0..255 scale.
const MEAN_VALUES: [f32; 3] = [123.68 / 255.0, 116.78 / 255.0, 103.94 / 255.0];
const NORM_VALUES: [f32; 3] = [255.0, 255.0, 255.0];

/// EAST scene-text detector. Produces one score channel and five geometry
/// channels at a quarter of the input resolution.
pub struct EastNet {
    session: Session,
    input_name: String,
    input_width: u32,
    input_height: u32,
    channels_last: bool,
}

impl EastNet {
    #[instrument(level = "debug")]
    pub fn init(
        path: PathBuf,
        num_threads: usize,
        (input_width, input_height): (u32, u32),
        channels_last: bool,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> Result<Self> {
        let shape = |width: u32, height: u32| {
            if channels_last {
                format!("x:1x{height}x{width}x3")
            } else {
                format!("x:1x3x{height}x{width}")
            }
        };
        let profile = ShapeProfile {
            min: shape(32, 32),
            opt: shape(input_width, input_height),
            max: shape(input_width, input_height),
        };
        let session = build_session(
            &path,
            num_threads,
            execution_providers,
            cache_path.as_ref(),
            &profile,
        )?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| Error::configuration(format!("{path:?} declares no inputs")))?;

        Ok(Self {
            session,
            input_name,
            input_width,
            input_height,
            channels_last,
        })
    }

    #[instrument(skip(self, image), level = "debug")]
    fn run(&self, image: &DynamicImage) -> Result<DetectionMap> {
        let image = image.resize_exact(self.input_width, self.input_height, FilterType::Triangle);
        let input_values = subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES);
        let input_values = if self.channels_last {
            input_values
                .permuted_axes([1, 2, 0])
                .as_standard_layout()
                .into_owned()
        } else {
            input_values
        }
        .insert_axis(Axis(0));

        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input_values]?)?;

        let mut scores = None;
        let mut geometry = None;
        for (name, value) in outputs.iter() {
            let grid = to_channel_first(value.try_extract_tensor::<f32>()?)?;
            log::trace!("Output {name} has shape {:?}", grid.dim());
            match grid.len_of(Axis(0)) {
                1 => scores = Some(grid.index_axis_move(Axis(0), 0)),
                GEOMETRY_CHANNELS => geometry = Some(grid),
                channels => log::debug!("Ignoring output {name} with {channels} channels"),
            }
        }

        match (scores, geometry) {
            (Some(scores), Some(geometry)) => DetectionMap::new(scores, geometry),
            _ => Err(Error::Inference(
                "model did not produce both a score map and a geometry map".into(),
            )),
        }
    }
}

impl TextDetector for EastNet {
    fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    fn infer(&self, image: &DynamicImage) -> Result<DetectionMap> {
        self.run(image).map_err(|err| match err {
            Error::Configuration(_) | Error::Inference(_) => err,
            other => Error::Inference(other.to_string()),
        })
    }
}

/// Accepts `(1, C, H, W)` or `(1, H, W, C)` and returns `(C, H, W)`.
fn to_channel_first(tensor: ArrayViewD<f32>) -> Result<Array3<f32>> {
    let tensor = tensor.into_dimensionality::<Ix4>()?;
    let (_, second, _, last) = tensor.dim();
    let tensor = tensor.index_axis_move(Axis(0), 0);
    let is_channel = |len: usize| len == 1 || len == GEOMETRY_CHANNELS;
    let grid = if is_channel(second) || !is_channel(last) {
        tensor
    } else {
        tensor.permuted_axes([2, 0, 1])
    };
    Ok(grid.as_standard_layout().into_owned())
}
