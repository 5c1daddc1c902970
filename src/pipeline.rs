use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::Duration,
};

use image::{DynamicImage, GenericImageView};
use tracing::instrument;

use crate::{
    error::Error,
    geometry::{decode_candidates, DetectionMap},
    region::extract_region,
    suppression::suppress_overlaps,
    util::Scale,
    CatalogLookup, DetectionOptions, DetectionResult, MedicineMatch, OriginalBox, Region, Result,
    TextLine,
};

/// Produces a detection map for a whole image.
pub trait TextDetector {
    /// `(width, height)` the detector resizes images to before inference.
    fn input_size(&self) -> (u32, u32);

    fn infer(&self, image: &DynamicImage) -> Result<DetectionMap>;
}

/// Reads the text in one cropped region. May return an empty line.
pub trait TextRecognizer: Send + Sync + 'static {
    fn recognize(&self, region: &Region) -> Result<TextLine>;
}

/// Runs decode, suppression, rescaling, cropping and recognition for one image
/// at a time.
pub struct Pipeline<D, R> {
    detector: D,
    recognizer: Arc<R>,
}

impl<D: TextDetector, R: TextRecognizer> Pipeline<D, R> {
    pub fn new(detector: D, recognizer: R) -> Self {
        Self {
            detector,
            recognizer: Arc::new(recognizer),
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    /// Surviving boxes in original-image pixels, paired with their confidence,
    /// in suppression order.
    #[instrument(skip(self, image), level = "debug")]
    pub fn select_regions(
        &self,
        image: &DynamicImage,
        options: &DetectionOptions,
    ) -> Result<Vec<(OriginalBox, f32)>> {
        options.validate()?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage(format!(
                "image has no pixels ({width}x{height})"
            )));
        }
        let input_size = self.detector.input_size();
        if input_size.0 == 0 || input_size.1 == 0 {
            return Err(Error::configuration(format!(
                "detector input size {input_size:?} has a zero dimension"
            )));
        }

        let map = self.detector.infer(image)?;
        let candidates = decode_candidates(&map, options.min_confidence, options.cell_stride);
        let survivors = suppress_overlaps(
            candidates,
            options.overlap_threshold,
            options.overlap_metric,
        );

        let scale = Scale::between((width, height), input_size);
        Ok(survivors
            .iter()
            .map(|survivor| (scale.rescale(survivor), survivor.confidence))
            .collect())
    }

    /// Detects text regions and recognizes each of them. Regions that are
    /// empty, time out or fail recognition are left out; the rest keep
    /// suppression order.
    #[instrument(skip(self, image))]
    pub fn detect_and_recognize(
        &self,
        image: &DynamicImage,
        options: &DetectionOptions,
    ) -> Result<Vec<DetectionResult>> {
        let regions = self.select_regions(image, options)?;
        let mut results = Vec::with_capacity(regions.len());
        let mut worker = None;

        for (_index, (bounds, confidence)) in regions.into_iter().enumerate() {
            let region = match extract_region(image, bounds) {
                Ok(region) => region,
                Err(err @ Error::EmptyRegion(_)) => {
                    log::debug!("Skipping recognition: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            #[cfg(feature = "debug")]
            if let Err(err) = region.image.save(format!("part_images/{_index}.png")) {
                log::warn!("Failed to dump region {_index}: {err}");
            }

            match self.recognize_region(&mut worker, region, options.recognition_timeout) {
                Ok(line) => results.push(DetectionResult {
                    bounds,
                    text: trim_trailing(&line.text, options.trim_trailing_chars),
                    confidence,
                }),
                Err(err) => log::warn!("Omitting region {bounds:?}: {err}"),
            }
        }

        log::debug!("Recognized {} regions", results.len());
        Ok(results)
    }

    /// Joins recognized text against the catalog by prefix. Detections with
    /// empty text or without a match are dropped.
    #[instrument(skip(self, image, catalog))]
    pub fn lookup_medicines(
        &self,
        image: &DynamicImage,
        options: &DetectionOptions,
        catalog: &impl CatalogLookup,
    ) -> Result<Vec<MedicineMatch>> {
        let detections = self.detect_and_recognize(image, options)?;
        Ok(join_catalog(detections, catalog))
    }

    /// Recognizes on `worker`, spawning it first if needed. A worker that
    /// times out or dies is dropped so the next region gets a fresh one.
    #[instrument(level = "trace", skip(self, worker, region), fields(bounds = ?region.bounds))]
    fn recognize_region(
        &self,
        worker: &mut Option<RecognitionWorker>,
        region: Region,
        timeout: Option<Duration>,
    ) -> Result<TextLine> {
        let result = match timeout {
            None => recognize_isolated(self.recognizer.as_ref(), &region),
            Some(timeout) => {
                let active = match worker.take() {
                    Some(active) => active,
                    None => RecognitionWorker::spawn(Arc::clone(&self.recognizer))?,
                };
                if active.jobs.send(region).is_err() {
                    return Err(Error::Recognition(
                        "recognizer exited without a result".into(),
                    ));
                }
                match active.results.recv_timeout(timeout) {
                    Ok(result) => {
                        *worker = Some(active);
                        result
                    }
                    // The stalled thread keeps running; its late result is
                    // discarded along with the channels.
                    Err(RecvTimeoutError::Timeout) => Err(Error::RecognitionTimeout(timeout)),
                    Err(RecvTimeoutError::Disconnected) => Err(Error::Recognition(
                        "recognizer exited without a result".into(),
                    )),
                }
            }
        };

        result.map_err(|err| match err {
            Error::RecognitionTimeout(_) | Error::Recognition(_) => err,
            other => Error::Recognition(other.to_string()),
        })
    }
}

/// Background thread serving the regions of one `detect_and_recognize` call.
struct RecognitionWorker {
    jobs: Sender<Region>,
    results: Receiver<Result<TextLine>>,
}

impl RecognitionWorker {
    fn spawn<R: TextRecognizer>(recognizer: Arc<R>) -> Result<Self> {
        let (jobs, pending) = mpsc::channel::<Region>();
        let (sender, results) = mpsc::channel();
        thread::Builder::new()
            .name("medscan-recognize".into())
            .spawn(move || {
                for region in pending {
                    if sender
                        .send(recognize_isolated(recognizer.as_ref(), &region))
                        .is_err()
                    {
                        break;
                    }
                }
            })?;
        Ok(Self { jobs, results })
    }
}

/// A panicking recognizer becomes a recognition failure.
fn recognize_isolated<R: TextRecognizer>(recognizer: &R, region: &Region) -> Result<TextLine> {
    panic::catch_unwind(AssertUnwindSafe(|| recognizer.recognize(region)))
        .unwrap_or_else(|_| Err(Error::Recognition("recognizer panicked".into())))
}

/// Looks every detection up by prefix, dropping empty text, misses and
/// failed lookups.
#[instrument(skip_all, fields(detections = detections.len()))]
pub fn join_catalog(
    detections: Vec<DetectionResult>,
    catalog: &impl CatalogLookup,
) -> Vec<MedicineMatch> {
    let mut matches = Vec::new();
    for detection in detections {
        if detection.text.trim().is_empty() {
            log::trace!("No text at {:?}, skipping lookup", detection.bounds);
            continue;
        }
        match catalog.lookup_by_prefix(&detection.text) {
            Ok(entries) if entries.is_empty() => {
                log::debug!("No catalog entry for {:?}", detection.text);
            }
            Ok(entries) => matches.push(MedicineMatch { detection, entries }),
            Err(err) => log::warn!("Lookup for {:?} failed: {err}", detection.text),
        }
    }
    matches
}

/// Drops the last `count` characters. Some recognizers end every line with
/// artifacts such as a newline and form feed.
pub fn trim_trailing(text: &str, count: usize) -> String {
    let keep = text.chars().count().saturating_sub(count);
    text.chars().take(keep).collect()
}
