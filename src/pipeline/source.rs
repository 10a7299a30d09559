use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::anyhow;

use super::{
    device::{Device, DeviceConfiguration, DeviceDriver, RawCapture},
    recording::{RecordingHeader, RecordingReader},
};
use crate::{
    calibration::Calibration,
    error::PipelineError,
    ledger::HandleLedger,
    types::{Capture, ImagePlane, Outcome, PlaneRole, Timeout},
};

pub struct LiveDevice {
    index: u32,
    device: Box<dyn Device>,
    config: DeviceConfiguration,
    calibration: Calibration,
    ledger: HandleLedger,
    running: bool,
}

pub struct PlaybackFile {
    path: PathBuf,
    reader: RecordingReader<BufReader<File>>,
    header: RecordingHeader,
    ledger: HandleLedger,
    requests: u64,
    exhausted: bool,
}

impl PlaybackFile {
    /// Number of `next()` calls served so far.
    #[cfg(test)]
    pub fn requests(&self) -> u64 {
        self.requests
    }
}

/// Live sensor or recorded file, fixed for the session.
pub enum FrameSource {
    Live(LiveDevice),
    Playback(PlaybackFile),
}

impl FrameSource {
    pub fn open_device(
        driver: &dyn DeviceDriver,
        index: u32,
        config: DeviceConfiguration,
        ledger: &HandleLedger,
    ) -> Result<Self, PipelineError> {
        let installed = driver
            .installed_count()
            .map_err(|source| PipelineError::AcquisitionFatal {
                operation: "enumerate devices",
                source,
            })?;
        if installed == 0 {
            return Err(PipelineError::configuration("no depth camera found"));
        }
        if index >= installed {
            return Err(PipelineError::configuration(format!(
                "device {index} requested but only {installed} installed"
            )));
        }
        config
            .validate()
            .map_err(|err| PipelineError::configuration(format!("{err:#}")))?;

        let open_failed = |source| PipelineError::AcquisitionFatal {
            operation: "open device",
            source,
        };
        let mut device = driver.open(index).map_err(open_failed)?;
        let calibration = device
            .calibration(config.depth_mode, config.color_resolution)
            .map_err(open_failed)?;
        device.start_cameras(&config).map_err(open_failed)?;

        log::info!(
            "opened device {index}: {:?} {:?} color, {:?} depth",
            config.color_resolution,
            config.color_format,
            config.depth_mode
        );
        Ok(FrameSource::Live(LiveDevice {
            index,
            device,
            config,
            calibration,
            ledger: ledger.clone(),
            running: true,
        }))
    }

    pub fn open_playback(path: &Path, ledger: &HandleLedger) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::configuration(format!(
                "{} is not a recording file",
                path.display()
            )));
        }
        let file = File::open(path).map_err(|err| {
            PipelineError::configuration(format!("cannot open {}: {err}", path.display()))
        })?;
        let (reader, header) = RecordingReader::open(BufReader::new(file)).map_err(|err| {
            PipelineError::configuration(format!("{}: {err:#}", path.display()))
        })?;

        log::info!("playing back {}", path.display());
        Ok(FrameSource::Playback(PlaybackFile {
            path: path.to_path_buf(),
            reader,
            header,
            ledger: ledger.clone(),
            requests: 0,
            exhausted: false,
        }))
    }

    pub fn calibration(&self) -> &Calibration {
        match self {
            FrameSource::Live(live) => &live.calibration,
            FrameSource::Playback(file) => &file.header.calibration,
        }
    }

    pub fn device_configuration(&self) -> &DeviceConfiguration {
        match self {
            FrameSource::Live(live) => &live.config,
            FrameSource::Playback(file) => &file.header.device_configuration,
        }
    }

    pub fn label(&self) -> String {
        match self {
            FrameSource::Live(live) => format!("device {}", live.index),
            FrameSource::Playback(file) => file
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.path.display().to_string()),
        }
    }

    /// Either a complete capture or a non-ready outcome, never a partial one.
    pub fn next(&mut self, timeout: Timeout) -> Outcome<Capture> {
        match self {
            FrameSource::Live(live) => live.next(timeout),
            FrameSource::Playback(file) => file.next(),
        }
    }

    pub fn close(&mut self) {
        match self {
            FrameSource::Live(live) => {
                if live.running {
                    live.device.stop_cameras();
                    live.running = false;
                    log::info!("closed device {}", live.index);
                }
            }
            FrameSource::Playback(file) => file.exhausted = true,
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl LiveDevice {
    fn next(&mut self, timeout: Timeout) -> Outcome<Capture> {
        if !self.running {
            return Outcome::Fatal(anyhow!("device {} is closed", self.index));
        }
        match self.device.get_capture(timeout) {
            Outcome::Ready(raw) => {
                if self.config.synchronized_images_only {
                    for role in [PlaneRole::Color, PlaneRole::Depth] {
                        if !raw.has(role) {
                            return Outcome::Fatal(anyhow!(
                                "synchronized capture is missing its {role:?} image"
                            ));
                        }
                    }
                }
                if let Err(err) = raw.validate() {
                    return Outcome::Fatal(err.context(format!("device {}", self.index)));
                }
                Outcome::Ready(admit(raw, &self.ledger))
            }
            // Live streams never end on their own.
            Outcome::EndOfStream => Outcome::Fatal(anyhow!("device stream ended")),
            other => other.map(|raw| admit(raw, &self.ledger)),
        }
    }
}

impl PlaybackFile {
    fn next(&mut self) -> Outcome<Capture> {
        self.requests += 1;
        if self.exhausted {
            return Outcome::EndOfStream;
        }
        match self.reader.next_capture() {
            Ok(Some(raw)) => Outcome::Ready(admit(raw, &self.ledger)),
            Ok(None) => {
                self.exhausted = true;
                Outcome::EndOfStream
            }
            Err(err) => Outcome::Fatal(err.context(format!("reading {}", self.path.display()))),
        }
    }
}

/// Puts a driver capture on the ledger.
fn admit(raw: RawCapture, ledger: &HandleLedger) -> Capture {
    let planes = raw
        .planes
        .into_iter()
        .map(|p| ImagePlane::new(ledger, p.role, p.format, p.width, p.height, p.stride, p.data))
        .collect();
    Capture::new(ledger, raw.timestamp, planes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::recording::{FileRecorder, Recorder},
        testing::{ScriptedDriver, Step, tiny_calibration},
        types::PixelFormat,
    };

    fn config() -> DeviceConfiguration {
        DeviceConfiguration::synchronized(PixelFormat::Bgra32)
    }

    #[test]
    fn zero_devices_is_a_configuration_error() {
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(0, Vec::new());
        let err = FrameSource::open_device(&driver, 0, config(), &ledger)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn live_source_labels_and_closes_once() {
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, Vec::new());
        let mut source = FrameSource::open_device(&driver, 0, config(), &ledger).unwrap();
        assert_eq!(source.label(), "device 0");
        assert_eq!(source.calibration(), &tiny_calibration());

        let capture = match source.next(Timeout::Infinite) {
            Outcome::Ready(capture) => capture,
            other => panic!("expected a capture, got {other:?}"),
        };
        assert!(capture.has(PlaneRole::Depth));
        drop(capture);
        assert!(ledger.outstanding().is_clear());

        source.close();
        source.close();
        assert_eq!(driver.stops(), 1);
        assert!(matches!(source.next(Timeout::Infinite), Outcome::Fatal(_)));
    }

    #[test]
    fn partial_synchronized_capture_is_fatal() {
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, vec![Step::Missing(PlaneRole::Color)]);
        let mut source = FrameSource::open_device(&driver, 0, config(), &ledger).unwrap();
        assert!(matches!(source.next(Timeout::Infinite), Outcome::Fatal(_)));
        assert!(ledger.outstanding().is_clear());
    }

    #[test]
    fn short_device_plane_is_fatal() {
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, vec![Step::Truncated(PlaneRole::Depth)]);
        let mut source = FrameSource::open_device(&driver, 0, config(), &ledger).unwrap();
        assert!(matches!(source.next(Timeout::Infinite), Outcome::Fatal(_)));
        assert!(ledger.outstanding().is_clear());
    }

    #[test]
    fn playback_of_a_short_plane_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dcap");
        let ledger = HandleLedger::new();

        let header = RecordingHeader {
            calibration: tiny_calibration(),
            device_configuration: config(),
        };
        let mut recorder = FileRecorder::create(&path, header).unwrap();
        recorder.write_header().unwrap();
        let good = admit(crate::testing::tiny_raw_capture(0), &ledger);
        recorder.write_capture(&good).unwrap();
        let mut raw = crate::testing::tiny_raw_capture(1);
        raw.planes[0].data.truncate(16);
        recorder.write_capture(&admit(raw, &ledger)).unwrap();
        recorder.close().unwrap();
        drop(good);

        let mut source = FrameSource::open_playback(&path, &ledger).unwrap();
        assert!(matches!(source.next(Timeout::Infinite), Outcome::Ready(_)));
        assert!(matches!(source.next(Timeout::Infinite), Outcome::Fatal(_)));
        assert!(ledger.outstanding().is_clear());
    }

    #[test]
    fn missing_or_directory_path_is_a_configuration_error() {
        let ledger = HandleLedger::new();
        let dir = tempfile::tempdir().unwrap();
        for path in [dir.path().to_path_buf(), dir.path().join("absent.dcap")] {
            let err = FrameSource::open_playback(&path, &ledger).err().unwrap();
            assert!(err.is_configuration());
        }
    }

    #[test]
    fn playback_yields_recorded_captures_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.dcap");
        let ledger = HandleLedger::new();

        let header = RecordingHeader {
            calibration: tiny_calibration(),
            device_configuration: config(),
        };
        let mut recorder = FileRecorder::create(&path, header).unwrap();
        recorder.write_header().unwrap();
        for frame in 0..2 {
            let capture = admit(crate::testing::tiny_raw_capture(frame), &ledger);
            recorder.write_capture(&capture).unwrap();
        }
        recorder.close().unwrap();

        let mut source = FrameSource::open_playback(&path, &ledger).unwrap();
        assert_eq!(source.label(), "take.dcap");
        assert_eq!(source.calibration(), &tiny_calibration());
        for _ in 0..2 {
            assert!(matches!(source.next(Timeout::Infinite), Outcome::Ready(_)));
        }
        assert!(matches!(source.next(Timeout::Infinite), Outcome::EndOfStream));
        assert!(ledger.outstanding().is_clear());
    }
}
