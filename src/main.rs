use std::{
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use image::Rgb;
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use medscan::{
    join_catalog, DetectionOptions, DetectionResult, InMemoryCatalog, MedScanBuilder,
    OverlapMetric,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Metric {
    Smaller,
    Union,
}

impl From<Metric> for OverlapMetric {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::Smaller => OverlapMetric::IntersectionOverSmaller,
            Metric::Union => OverlapMetric::IntersectionOverUnion,
        }
    }
}

/// Detect and read the text on a medicine package photo.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    image: PathBuf,
    #[arg(
        long,
        env = "MEDSCAN_DET_MODEL",
        default_value = "models/frozen_east_text_detection.onnx"
    )]
    det_model: PathBuf,
    #[arg(
        long,
        env = "MEDSCAN_REC_MODEL",
        default_value = "models/ch_PP-OCRv4_rec_infer/ch_PP-OCRv4_rec_infer.onnx"
    )]
    rec_model: PathBuf,
    #[arg(long, env = "MEDSCAN_REC_KEYS", default_value = "models/ppocr_keys_v1.txt")]
    rec_keys: PathBuf,
    /// JSON array of catalog entries. Without it raw detections are printed.
    #[arg(long, env = "MEDSCAN_CATALOG")]
    catalog: Option<PathBuf>,
    #[arg(long, default_value_t = 0.9)]
    min_confidence: f32,
    #[arg(long, default_value_t = 0.3)]
    overlap_threshold: f32,
    #[arg(long, value_enum, default_value_t = Metric::Smaller)]
    overlap_metric: Metric,
    #[arg(long, default_value_t = 2)]
    trim: usize,
    /// Per-region recognition timeout; 0 waits forever.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    #[arg(long, default_value_t = 4)]
    threads: usize,
    #[arg(long)]
    channels_last: bool,
    #[arg(long)]
    engine_cache: Option<PathBuf>,
    /// Write a copy of the image with detected boxes drawn on it.
    #[arg(long)]
    annotate: Option<PathBuf>,
}

fn annotate(
    image: &image::DynamicImage,
    detections: &[DetectionResult],
    path: &Path,
) -> medscan::Result<()> {
    let mut canvas = image.to_rgb8();
    for detection in detections {
        let bounds = detection.bounds;
        let rect = Rect::at(bounds.start_x as i32, bounds.start_y as i32)
            .of_size(bounds.width(), bounds.height());
        draw_hollow_rect_mut(&mut canvas, rect, Rgb([255, 0, 0]));
    }
    canvas.save(path)?;
    Ok(())
}

fn main() -> medscan::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let options = DetectionOptions {
        min_confidence: args.min_confidence,
        overlap_threshold: args.overlap_threshold,
        overlap_metric: args.overlap_metric.into(),
        trim_trailing_chars: args.trim,
        recognition_timeout: (args.timeout_ms > 0)
            .then(|| Duration::from_millis(args.timeout_ms)),
        ..Default::default()
    };
    options.validate()?;

    let image = image::open(&args.image)?;
    let mut builder = MedScanBuilder::new()
        .threads(args.threads)
        .det_model(args.det_model)
        .rec_model(args.rec_model, args.rec_keys)
        .channels_last(args.channels_last);
    if let Some(cache) = args.engine_cache {
        std::fs::create_dir_all(&cache)?;
        builder = builder.with_engine_cache_path(cache);
    }
    let engine = builder.build()?;

    let start = Instant::now();
    let detections = engine.detect_and_recognize(&image, &options)?;
    log::debug!("Detection took {:?}", start.elapsed());

    if let Some(path) = &args.annotate {
        annotate(&image, &detections, path)?;
    }

    let mut stdout = std::io::stdout().lock();
    match args.catalog {
        Some(path) => {
            let catalog = InMemoryCatalog::from_json_file(&path)?;
            let matches = join_catalog(detections, &catalog);
            serde_json::to_writer_pretty(&mut stdout, &matches).map_err(std::io::Error::from)?;
        }
        None => {
            serde_json::to_writer_pretty(&mut stdout, &detections).map_err(std::io::Error::from)?;
        }
    }
    writeln!(stdout)?;
    Ok(())
}
