//! Scripted collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use image::DynamicImage;

use crate::{
    calibration::{Calibration, Extrinsics, Intrinsics},
    ledger::HandleLedger,
    pipeline::{
        device::{
            ColorResolution, DepthMode, Device, DeviceConfiguration, DeviceDriver, RawCapture,
            RawPlane,
        },
        tracking::TrackingStage,
    },
    present::Presenter,
    types::{Capture, ImagePlane, Outcome, PixelFormat, PlaneRole, Timeout, TrackingResult},
};

pub const TINY_WIDTH: u32 = 8;
pub const TINY_HEIGHT: u32 = 6;

/// Coaxial 8x6 depth and colour cameras.
pub fn tiny_calibration() -> Calibration {
    let intrinsics = Intrinsics {
        width: TINY_WIDTH,
        height: TINY_HEIGHT,
        fx: 8.0,
        fy: 8.0,
        cx: 3.5,
        cy: 2.5,
    };
    Calibration {
        depth_mode: DepthMode::NfovUnbinned,
        color_resolution: ColorResolution::R720p,
        depth: intrinsics,
        color: intrinsics,
        depth_to_color: Extrinsics::IDENTITY,
    }
}

pub fn tiny_raw_capture(frame: u64) -> RawCapture {
    let pixels = (TINY_WIDTH * TINY_HEIGHT) as usize;
    let depth: Vec<u16> = (0..pixels)
        .map(|i| if i % TINY_WIDTH as usize >= 6 { 3000 } else { 1000 })
        .collect();
    let u16_plane = |role, format, samples: &[u16]| RawPlane {
        role,
        format,
        width: TINY_WIDTH,
        height: TINY_HEIGHT,
        stride: TINY_WIDTH as usize * 2,
        data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    };
    RawCapture {
        timestamp: Duration::from_millis(frame * 33),
        planes: vec![
            RawPlane {
                role: PlaneRole::Color,
                format: PixelFormat::Bgra32,
                width: TINY_WIDTH,
                height: TINY_HEIGHT,
                stride: TINY_WIDTH as usize * 4,
                data: [40u8, 80, 120, 255].repeat(pixels),
            },
            u16_plane(PlaneRole::Depth, PixelFormat::Depth16, &depth),
            u16_plane(PlaneRole::Infrared, PixelFormat::Ir16, &vec![200; pixels]),
        ],
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Step {
    Frame,
    Missing(PlaneRole),
    /// The plane for this role loses all but its first 16 bytes.
    Truncated(PlaneRole),
    Timeout,
    Fatal,
}

/// Devices replay `steps`, then produce frames forever.
pub struct ScriptedDriver {
    count: u32,
    steps: Vec<Step>,
    stops: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new(count: u32, steps: Vec<Step>) -> Self {
        Self {
            count,
            steps,
            stops: Arc::default(),
            requests: Arc::default(),
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl DeviceDriver for ScriptedDriver {
    fn installed_count(&self) -> Result<u32> {
        Ok(self.count)
    }

    fn open(&self, _index: u32) -> Result<Box<dyn Device>> {
        Ok(Box::new(ScriptedDevice {
            steps: self.steps.iter().copied().collect(),
            frame: 0,
            stops: self.stops.clone(),
            requests: self.requests.clone(),
        }))
    }
}

struct ScriptedDevice {
    steps: VecDeque<Step>,
    frame: u64,
    stops: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl Device for ScriptedDevice {
    fn start_cameras(&mut self, _config: &DeviceConfiguration) -> Result<()> {
        Ok(())
    }

    fn calibration(&self, _: DepthMode, _: ColorResolution) -> Result<Calibration> {
        Ok(tiny_calibration())
    }

    fn get_capture(&mut self, _timeout: Timeout) -> Outcome<RawCapture> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.pop_front().unwrap_or(Step::Frame);
        let mut capture = tiny_raw_capture(self.frame);
        self.frame += 1;
        match step {
            Step::Frame => Outcome::Ready(capture),
            Step::Missing(role) => {
                capture.planes.retain(|p| p.role != role);
                Outcome::Ready(capture)
            }
            Step::Truncated(role) => {
                for plane in capture.planes.iter_mut().filter(|p| p.role == role) {
                    plane.data.truncate(16);
                }
                Outcome::Ready(capture)
            }
            Step::Timeout => Outcome::Timeout,
            Step::Fatal => Outcome::Fatal(anyhow!("scripted device failure")),
        }
    }

    fn stop_cameras(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct PresenterLog {
    pub presented: Vec<String>,
    pub images: Vec<DynamicImage>,
    /// Ledger state observed at each key poll.
    pub clear_at_poll: Vec<bool>,
    pub closes: usize,
}

/// Records what it is shown and replays one scripted key per poll.
pub struct RecordingPresenter {
    ledger: HandleLedger,
    keys: VecDeque<Option<char>>,
    log: Arc<Mutex<PresenterLog>>,
}

impl RecordingPresenter {
    pub fn new(
        ledger: &HandleLedger,
        keys: impl IntoIterator<Item = Option<char>>,
    ) -> (Self, Arc<Mutex<PresenterLog>>) {
        let log = Arc::new(Mutex::new(PresenterLog::default()));
        let presenter = Self {
            ledger: ledger.clone(),
            keys: keys.into_iter().collect(),
            log: log.clone(),
        };
        (presenter, log)
    }
}

impl Presenter for RecordingPresenter {
    fn present(&mut self, label: &str, image: &DynamicImage) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.presented.push(label.to_string());
        log.images.push(image.clone());
        Ok(())
    }

    fn poll_key(&mut self) -> Option<char> {
        let outstanding = self.ledger.outstanding();
        self.log
            .lock()
            .unwrap()
            .clear_at_poll
            .push(outstanding.captures == 0 && outstanding.results == 0);
        self.keys.pop_front().flatten()
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStep {
    Track,
    /// The result's capture carries a colour plane filled with this BGRA
    /// pixel instead of the enqueued one.
    Repaint([u8; 4]),
    EnqueueFatal,
    PopFatal,
}

#[derive(Debug, Default)]
pub struct StageLog {
    pub enqueued: usize,
    pub shutdowns: usize,
}

/// Synchronous tracking stage: every popped result owns the enqueued
/// capture and carries no bodies.
pub struct ScriptedStage {
    steps: VecDeque<StageStep>,
    pending: Option<(Capture, StageStep)>,
    log: Arc<Mutex<StageLog>>,
}

impl ScriptedStage {
    pub fn new(steps: impl IntoIterator<Item = StageStep>) -> (Self, Arc<Mutex<StageLog>>) {
        let log = Arc::new(Mutex::new(StageLog::default()));
        let stage = Self {
            steps: steps.into_iter().collect(),
            pending: None,
            log: log.clone(),
        };
        (stage, log)
    }
}

impl TrackingStage for ScriptedStage {
    fn enqueue(&mut self, capture: Capture, _timeout: Timeout) -> Outcome<()> {
        self.log.lock().unwrap().enqueued += 1;
        let step = self.steps.pop_front().unwrap_or(StageStep::Track);
        if step == StageStep::EnqueueFatal {
            return Outcome::Fatal(anyhow!("scripted enqueue failure"));
        }
        self.pending = Some((capture, step));
        Outcome::Ready(())
    }

    fn pop(&mut self, _timeout: Timeout) -> Outcome<TrackingResult> {
        match self.pending.take() {
            Some((_, StageStep::PopFatal)) => Outcome::Fatal(anyhow!("scripted pop failure")),
            Some((capture, StageStep::Repaint(bgra))) => {
                let ledger = capture.ledger().clone();
                let planes = capture
                    .planes()
                    .iter()
                    .map(|plane| match plane.role() {
                        PlaneRole::Color => {
                            let (width, height) = plane.dimensions();
                            ImagePlane::packed(
                                &ledger,
                                PlaneRole::Color,
                                PixelFormat::Bgra32,
                                width,
                                height,
                                bgra.repeat((width * height) as usize),
                            )
                        }
                        _ => plane.clone(),
                    })
                    .collect();
                let repainted = Capture::new(&ledger, capture.timestamp(), planes);
                drop(capture);
                Outcome::Ready(TrackingResult::new(&ledger, None, Vec::new(), Some(repainted)))
            }
            Some((capture, _)) => {
                let ledger = capture.ledger().clone();
                Outcome::Ready(TrackingResult::new(&ledger, None, Vec::new(), Some(capture)))
            }
            None => Outcome::Timeout,
        }
    }

    fn shutdown(&mut self) {
        self.pending.take();
        self.log.lock().unwrap().shutdowns += 1;
    }
}
