use std::path::PathBuf;

use chrono::Local;

use super::{
    controller::{Completion, PipelineController},
    device::{DeviceConfiguration, DeviceDriver},
    foreground::ForegroundTracker,
    recording::{FileRecorder, Recorder, RecordingHeader},
    source::FrameSource,
    tracking::{TrackerConfig, WorkerTrackingStage},
    transform::Transformer,
    views::ViewSet,
};
use crate::{
    error::PipelineError,
    ledger::HandleLedger,
    present::{Presenter, SnapshotPresenter},
    types::{PixelFormat, Timeout},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceIdentity {
    Device(u32),
    Playback(PathBuf),
}

/// Everything a session needs, already validated.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub source: SourceIdentity,
    pub record: bool,
    pub views: ViewSet,
    pub tracking: Option<TrackerConfig>,
    pub timeout: Timeout,
    pub out_dir: PathBuf,
    pub snapshot_every: u64,
    pub quit_key: char,
}

impl SessionConfig {
    /// Live devices stream BGRA32, except in record mode where colour is
    /// kept compressed.
    pub fn device_configuration(&self) -> DeviceConfiguration {
        let color_format = if self.record {
            PixelFormat::Mjpg
        } else {
            PixelFormat::Bgra32
        };
        DeviceConfiguration::synchronized(color_format)
    }
}

/// Opens the source first; the presenter is only created once the source is
/// known to work, and a recording only once the presenter exists.
pub fn open_session<F>(
    config: &SessionConfig,
    driver: &dyn DeviceDriver,
    ledger: &HandleLedger,
    make_presenter: F,
) -> Result<PipelineController, PipelineError>
where
    F: FnOnce(&SessionConfig) -> anyhow::Result<Box<dyn Presenter>>,
{
    let source = match &config.source {
        SourceIdentity::Device(index) => {
            FrameSource::open_device(driver, *index, config.device_configuration(), ledger)?
        }
        SourceIdentity::Playback(path) => {
            if config.record {
                return Err(PipelineError::configuration(
                    "cannot record while playing back",
                ));
            }
            FrameSource::open_playback(path, ledger)?
        }
    };
    let calibration = source.calibration().clone();

    let presenter = make_presenter(config).map_err(|source| PipelineError::Presentation {
        label: "session".to_string(),
        source,
    })?;

    let recorder = if config.record {
        let path = FileRecorder::timestamped_path(&config.out_dir, Local::now());
        std::fs::create_dir_all(&config.out_dir)
            .map_err(|err| PipelineError::Recording(err.into()))?;
        let header = RecordingHeader {
            calibration: calibration.clone(),
            device_configuration: *source.device_configuration(),
        };
        let mut recorder =
            FileRecorder::create(path, header).map_err(PipelineError::Recording)?;
        println!("Recording to {}", recorder.path().display());
        log::info!("recording to {}", recorder.path().display());
        recorder.write_header().map_err(PipelineError::Recording)?;
        Some(recorder)
    } else {
        None
    };

    let mut controller = PipelineController::new(source, presenter, config.views.clone(), ledger)
        .with_timeout(config.timeout)
        .with_quit_key(config.quit_key);
    if let Some(tracker_config) = config.tracking {
        let engine = ForegroundTracker::new(calibration.clone());
        controller =
            controller.with_tracking(Box::new(WorkerTrackingStage::start(engine, tracker_config)));
    }
    if config.views.needs_transformer() {
        controller = controller.with_transformer(Transformer::new(calibration));
    }
    if let Some(recorder) = recorder {
        controller = controller.with_recorder(Box::new(recorder) as Box<dyn Recorder>);
    }
    Ok(controller)
}

/// Runs a session that snapshots windows to `out_dir` and reads keys from
/// stdin.
pub fn run_session(
    config: &SessionConfig,
    driver: &dyn DeviceDriver,
) -> Result<Completion, PipelineError> {
    let ledger = HandleLedger::new();
    let mut controller = open_session(config, driver, &ledger, |config| {
        let presenter = SnapshotPresenter::create(&config.out_dir, config.snapshot_every)?
            .with_stdin_keys();
        Ok(Box::new(presenter) as Box<dyn Presenter>)
    })?;
    controller.run()
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, fs::File};

    use super::*;
    use crate::{
        pipeline::{recording::RecordingReader, views::View},
        testing::{RecordingPresenter, ScriptedDriver, tiny_calibration},
    };

    fn config(source: SourceIdentity, out_dir: PathBuf) -> SessionConfig {
        SessionConfig {
            source,
            record: false,
            views: ViewSet::default(),
            tracking: None,
            timeout: Timeout::Infinite,
            out_dir,
            snapshot_every: 1,
            quit_key: 'q',
        }
    }

    #[test]
    fn no_device_means_no_presenter() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(0, Vec::new());
        let created = Cell::new(false);

        let err = open_session(
            &config(SourceIdentity::Device(0), dir.path().to_path_buf()),
            &driver,
            &ledger,
            |_| {
                created.set(true);
                let (presenter, _) = RecordingPresenter::new(&ledger, Vec::new());
                Ok(Box::new(presenter) as Box<dyn Presenter>)
            },
        )
        .err()
        .unwrap();

        assert!(err.is_configuration());
        assert!(!created.get());
    }

    #[test]
    fn bad_playback_path_means_no_presenter() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, Vec::new());
        let created = Cell::new(false);
        let path = dir.path().join("missing.dcap");

        let err = open_session(
            &config(SourceIdentity::Playback(path), dir.path().to_path_buf()),
            &driver,
            &ledger,
            |_| {
                created.set(true);
                let (presenter, _) = RecordingPresenter::new(&ledger, Vec::new());
                Ok(Box::new(presenter) as Box<dyn Presenter>)
            },
        )
        .err()
        .unwrap();

        assert!(err.is_configuration());
        assert!(!created.get());
    }

    #[test]
    fn record_session_writes_a_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, Vec::new());
        let mut session = config(SourceIdentity::Device(0), dir.path().join("takes"));
        session.record = true;

        let mut controller = open_session(&session, &driver, &ledger, |_| {
            let (presenter, _) = RecordingPresenter::new(&ledger, [None, Some('q')]);
            Ok(Box::new(presenter) as Box<dyn Presenter>)
        })
        .unwrap();
        assert_eq!(controller.run().unwrap(), Completion::QuitRequested);
        drop(controller);

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("takes"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].extension().unwrap(), "dcap");

        let (mut reader, header) = RecordingReader::open(File::open(&entries[0]).unwrap()).unwrap();
        assert_eq!(header.calibration, tiny_calibration());
        assert_eq!(header.device_configuration.color_format, PixelFormat::Mjpg);
        assert!(reader.next_capture().unwrap().is_some());
        assert!(reader.next_capture().unwrap().is_some());
        assert!(reader.next_capture().unwrap().is_none());
    }

    #[test]
    fn presenter_failure_leaves_no_recording() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, Vec::new());
        let mut session = config(SourceIdentity::Device(0), dir.path().join("takes"));
        session.record = true;

        let err = open_session(&session, &driver, &ledger, |_| {
            Err(anyhow::anyhow!("no display"))
        })
        .err()
        .unwrap();

        assert!(matches!(err, PipelineError::Presentation { .. }));
        assert!(!dir.path().join("takes").exists());
        assert_eq!(driver.stops(), 1);
    }

    #[test]
    fn tracking_views_get_a_worker_and_transformer() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::new();
        let driver = ScriptedDriver::new(1, Vec::new());
        let mut session = config(SourceIdentity::Device(0), dir.path().to_path_buf());
        session.views = ViewSet::new([View::IndexMap, View::Skeleton]);
        session.tracking = Some(TrackerConfig::default());

        let mut controller = open_session(&session, &driver, &ledger, |_| {
            let (presenter, _) = RecordingPresenter::new(&ledger, [Some('q')]);
            Ok(Box::new(presenter) as Box<dyn Presenter>)
        })
        .unwrap();
        assert_eq!(controller.run().unwrap(), Completion::QuitRequested);
    }
}
