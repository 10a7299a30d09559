use anyhow::anyhow;
use image::{DynamicImage, RgbaImage};

use super::{
    envelope::{FrameEnvelope, into_renderable},
    recording::Recorder,
    source::FrameSource,
    tracking::TrackingStage,
    transform::{Interpolation, Transformer},
    views::{View, ViewSet},
};
use crate::{
    calibration::CameraKind,
    error::PipelineError,
    ledger::HandleLedger,
    present::Presenter,
    render::{Palette, Renderer},
    types::{BODY_INDEX_BACKGROUND, ImagePlane, Outcome, PlaneRole, Timeout, TrackingResult},
};

pub const DEFAULT_QUIT_KEY: char = 'q';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
}

/// How a session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    EndOfStream,
    QuitRequested,
}

type Windows = Vec<(String, DynamicImage)>;

/// Runs Acquire → Record → Extract → Track → Transform → Render → Present →
/// PollInput until the source ends, the user quits, or a collaborator fails.
pub struct PipelineController {
    state: State,
    source: FrameSource,
    presenter: Box<dyn Presenter>,
    tracking: Option<Box<dyn TrackingStage>>,
    transformer: Option<Transformer>,
    recorder: Option<Box<dyn Recorder>>,
    renderer: Renderer,
    views: ViewSet,
    timeout: Timeout,
    quit_key: char,
    ledger: HandleLedger,
    source_label: String,
    ticks: u64,
    teardowns: usize,
}

impl PipelineController {
    pub fn new(
        source: FrameSource,
        presenter: Box<dyn Presenter>,
        views: ViewSet,
        ledger: &HandleLedger,
    ) -> Self {
        let renderer = Renderer::new(Palette::default(), source.calibration().clone());
        let source_label = source.label();
        Self {
            state: State::Idle,
            source,
            presenter,
            tracking: None,
            transformer: None,
            recorder: None,
            renderer,
            views,
            timeout: Timeout::Infinite,
            quit_key: DEFAULT_QUIT_KEY,
            ledger: ledger.clone(),
            source_label,
            ticks: 0,
            teardowns: 0,
        }
    }

    pub fn with_tracking(mut self, stage: Box<dyn TrackingStage>) -> Self {
        self.tracking = Some(stage);
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_quit_key(mut self, key: char) -> Self {
        self.quit_key = key;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of times teardown actually ran.
    #[cfg(test)]
    pub fn teardowns(&self) -> usize {
        self.teardowns
    }

    #[cfg(test)]
    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn run(&mut self) -> Result<Completion, PipelineError> {
        if self.state != State::Idle {
            return Err(PipelineError::configuration(
                "pipeline controller already ran",
            ));
        }
        if self.views.needs_tracking() && self.tracking.is_none() {
            return Err(PipelineError::configuration(
                "selected views need body tracking",
            ));
        }
        if self.views.needs_transformer() && self.transformer.is_none() {
            return Err(PipelineError::configuration(
                "selected views need a transformer",
            ));
        }

        self.state = State::Running;
        log::info!("session started on {}", self.source_label);

        let outcome = loop {
            match self.tick() {
                Ok(None) => continue,
                Ok(Some(completion)) => break Ok(completion),
                Err(err) => break Err(err),
            }
        };

        self.teardown();
        match &outcome {
            Ok(completion) => log::info!(
                "session on {} finished after {} ticks: {completion:?}",
                self.source_label,
                self.ticks
            ),
            Err(err) => log::error!(
                "session on {} stopped after {} ticks: {err:#}",
                self.source_label,
                self.ticks
            ),
        }
        outcome
    }

    /// One full tick. `Ok(None)` means keep running.
    fn tick(&mut self) -> Result<Option<Completion>, PipelineError> {
        const ACQUIRE: &str = "acquire capture";
        let capture = match self.source.next(self.timeout) {
            Outcome::Ready(capture) => capture,
            Outcome::EndOfStream => return Ok(Some(Completion::EndOfStream)),
            Outcome::Timeout => {
                return Err(PipelineError::AcquisitionTimeout { operation: ACQUIRE });
            }
            Outcome::Fatal(source) => {
                return Err(PipelineError::AcquisitionFatal {
                    operation: ACQUIRE,
                    source,
                });
            }
        };
        log::debug!("tick {}: capture at {:?}", self.ticks, capture.timestamp());

        if let Some(recorder) = self.recorder.as_mut() {
            recorder
                .write_capture(&capture)
                .map_err(PipelineError::Recording)?;
        }

        let mut envelope = FrameEnvelope::new(capture);
        let windows = self.derive(&mut envelope);
        drop(envelope);
        let windows = windows?;
        self.check_ledger();

        for (label, image) in &windows {
            self.presenter
                .present(label, image)
                .map_err(|source| PipelineError::Presentation {
                    label: label.clone(),
                    source,
                })?;
        }
        drop(windows);

        let key = self.presenter.poll_key();
        self.ticks += 1;
        if key == Some(self.quit_key) {
            return Ok(Some(Completion::QuitRequested));
        }
        Ok(None)
    }

    /// Extract, track, transform and render. Every handle taken here is
    /// released before returning.
    fn derive(&mut self, envelope: &mut FrameEnvelope) -> Result<Windows, PipelineError> {
        let color = if self.views.contains(View::Color) {
            envelope.plane(PlaneRole::Color)
        } else {
            None
        };
        let depth = envelope.plane(PlaneRole::Depth);
        let infrared = if self.views.contains(View::Infrared) {
            envelope.plane(PlaneRole::Infrared)
        } else {
            None
        };

        let bgra = if self.views.contains(View::Transformation) && self.transformer.is_some() {
            envelope
                .bgra_color()
                .map_err(|source| PipelineError::Render {
                    view: View::Transformation.name(),
                    source,
                })?
        } else {
            None
        };

        let result = self.track(envelope)?;
        envelope.release();

        let color_image = match color {
            Some(plane) => Some(self.render(View::Color, plane, |r, p| r.color(p))?),
            None => None,
        };
        // Overlays draw on the frame the tracker saw.
        let tracked_color = result
            .as_ref()
            .and_then(TrackingResult::capture)
            .and_then(|capture| capture.plane(PlaneRole::Color));
        let overlay_base = match tracked_color {
            Some(plane) => Some(self.render(View::Skeleton, plane, |r, p| r.color(p))?),
            None => None,
        };

        let mut windows = Windows::new();
        for view in self.views.iter() {
            match view {
                View::Color => {
                    if let Some(image) = &color_image {
                        self.push(&mut windows, "color", DynamicImage::ImageRgba8(image.clone()));
                    }
                }
                View::Depth => {
                    if let Some(plane) = depth.clone() {
                        let image = self.render(view, plane, |r, p| r.depth(p))?;
                        self.push(&mut windows, "depth", DynamicImage::ImageLuma8(image));
                    }
                }
                View::Infrared => {
                    if let Some(plane) = infrared.clone() {
                        let image = self.render(view, plane, |r, p| r.infrared(p))?;
                        self.push(&mut windows, "infrared", DynamicImage::ImageLuma8(image));
                    }
                }
                View::Transformation => {
                    if let (Some(depth), Some(bgra)) = (&depth, &bgra) {
                        self.transformation(&mut windows, depth, bgra)?;
                    }
                }
                View::PointCloud => {
                    if let Some(depth) = &depth {
                        self.point_cloud(&mut windows, depth)?;
                    }
                }
                View::IndexMap => {
                    if let (Some(depth), Some(result), Some(base)) =
                        (&depth, &result, &overlay_base)
                    {
                        self.index_map(&mut windows, depth, result, base)?;
                    }
                }
                View::Skeleton => {
                    if let (Some(result), Some(base)) = (&result, &overlay_base) {
                        let image = self.renderer.skeletons(base, result.skeletons());
                        self.push(&mut windows, "skeleton", DynamicImage::ImageRgb8(image));
                    }
                }
            }
        }
        Ok(windows)
    }

    /// Hands the capture to the tracking stage, then waits for its result.
    fn track(
        &mut self,
        envelope: &mut FrameEnvelope,
    ) -> Result<Option<TrackingResult>, PipelineError> {
        const ENQUEUE: &str = "enqueue capture";
        const POP: &str = "pop tracking result";
        let Some(stage) = self.tracking.as_mut() else {
            return Ok(None);
        };
        let Some(capture) = envelope.hand_off() else {
            return Ok(None);
        };

        match stage.enqueue(capture, self.timeout) {
            Outcome::Ready(()) => {}
            Outcome::Timeout => {
                return Err(PipelineError::AcquisitionTimeout { operation: ENQUEUE });
            }
            Outcome::EndOfStream => {
                return Err(PipelineError::AcquisitionFatal {
                    operation: ENQUEUE,
                    source: anyhow!("tracking stage closed its input"),
                });
            }
            Outcome::Fatal(source) => {
                return Err(PipelineError::AcquisitionFatal {
                    operation: ENQUEUE,
                    source,
                });
            }
        }

        match stage.pop(self.timeout) {
            Outcome::Ready(result) => Ok(Some(result)),
            Outcome::Timeout => Err(PipelineError::AcquisitionTimeout { operation: POP }),
            Outcome::EndOfStream => Err(PipelineError::AcquisitionFatal {
                operation: POP,
                source: anyhow!("tracking stage produced no result"),
            }),
            Outcome::Fatal(source) => Err(PipelineError::AcquisitionFatal {
                operation: POP,
                source,
            }),
        }
    }

    fn transformation(
        &self,
        windows: &mut Windows,
        depth: &ImagePlane,
        bgra: &ImagePlane,
    ) -> Result<(), PipelineError> {
        let Some(transformer) = &self.transformer else {
            return Ok(());
        };
        if let Some(aligned) = transformer.color_to_depth(depth, bgra)? {
            let image = self.render(View::Transformation, aligned, |r, p| r.color(p))?;
            self.push(windows, "transformed color", DynamicImage::ImageRgba8(image));
        }
        if let Some(aligned) = transformer.depth_to_color(depth)? {
            let image = self.render(View::Transformation, aligned, |r, p| r.depth(p))?;
            self.push(windows, "transformed depth", DynamicImage::ImageLuma8(image));
        }
        Ok(())
    }

    fn point_cloud(&self, windows: &mut Windows, depth: &ImagePlane) -> Result<(), PipelineError> {
        let Some(transformer) = &self.transformer else {
            return Ok(());
        };
        let Some(aligned) = transformer.depth_to_color(depth)? else {
            return Ok(());
        };
        let cloud = transformer.depth_to_point_cloud(&aligned, CameraKind::Color)?;
        drop(aligned);
        if let Some(cloud) = cloud {
            let image = self.render(View::PointCloud, cloud, |r, p| r.point_cloud(p))?;
            self.push(windows, "point cloud", DynamicImage::ImageLuma8(image));
        }
        Ok(())
    }

    fn index_map(
        &self,
        windows: &mut Windows,
        depth: &ImagePlane,
        result: &TrackingResult,
        base: &RgbaImage,
    ) -> Result<(), PipelineError> {
        let Some(map) = result.body_index_map() else {
            return Ok(());
        };
        let Some(transformer) = &self.transformer else {
            return Ok(());
        };

        let aligned = transformer.depth_to_color_with_aux(
            depth,
            &map,
            Interpolation::Nearest,
            BODY_INDEX_BACKGROUND as u16,
        )?;
        let image = self.render(View::IndexMap, map, |r, p| r.body_index_map(p))?;
        self.push(windows, "body index map", DynamicImage::ImageRgb8(image));

        if let Some((aligned_depth, aligned_map)) = aligned {
            drop(aligned_depth);
            let overlay = self.render(View::IndexMap, aligned_map, |r, p| r.body_index_map(p))?;
            let blended = self
                .renderer
                .blend(base, &overlay)
                .map_err(|source| PipelineError::Render {
                    view: View::IndexMap.name(),
                    source,
                })?;
            self.push(
                windows,
                "transformed body index map",
                DynamicImage::ImageRgb8(blended),
            );
        }
        Ok(())
    }

    fn render<T>(
        &self,
        view: View,
        plane: ImagePlane,
        convert: impl FnOnce(&Renderer, &ImagePlane) -> anyhow::Result<T>,
    ) -> Result<T, PipelineError> {
        into_renderable(plane, |p| convert(&self.renderer, p)).map_err(|source| {
            PipelineError::Render {
                view: view.name(),
                source,
            }
        })
    }

    fn push(&self, windows: &mut Windows, window: &str, image: DynamicImage) {
        windows.push((format!("{window} ({})", self.source_label), image));
    }

    fn check_ledger(&self) {
        let outstanding = self.ledger.outstanding();
        if !outstanding.is_clear() {
            log::warn!("handles outstanding at end of tick {}: {outstanding:?}", self.ticks);
        }
    }

    /// Shuts the collaborators down in order. Runs at most once.
    pub fn teardown(&mut self) {
        if self.teardowns > 0 {
            return;
        }
        self.teardowns += 1;

        if let Some(stage) = self.tracking.as_mut() {
            stage.shutdown();
        }
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(err) = recorder.flush() {
                log::warn!("failed to flush recording: {err:?}");
            }
            if let Err(err) = recorder.close() {
                log::warn!("failed to close recording: {err:?}");
            }
        }
        self.source.close();
        if let Err(err) = self.presenter.close() {
            log::warn!("failed to close presenter: {err:?}");
        }
        self.state = State::Stopped;
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.teardown();
    }
}
