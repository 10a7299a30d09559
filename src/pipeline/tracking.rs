use std::thread;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};

use crate::types::{Capture, ImagePlane, Outcome, Skeleton, Timeout, TrackingResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SensorOrientation {
    #[default]
    Default,
    Clockwise90,
    CounterClockwise90,
    Flip180,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    pub orientation: SensorOrientation,
    pub body_index_map: bool,
    pub skeletons: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            orientation: SensorOrientation::Default,
            body_index_map: true,
            skeletons: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackedBodies {
    pub body_index_map: Option<ImagePlane>,
    pub skeletons: Vec<Skeleton>,
}

/// Inference backend run by [`WorkerTrackingStage`] off the control thread.
pub trait BodyTracker: Send + 'static {
    fn label(&self) -> &'static str;
    fn track(&mut self, capture: &Capture, config: &TrackerConfig) -> Result<TrackedBodies>;
}

/// Asynchronous boundary between the controller and body tracking. Results
/// come back in submission order.
pub trait TrackingStage {
    fn enqueue(&mut self, capture: Capture, timeout: Timeout) -> Outcome<()>;
    fn pop(&mut self, timeout: Timeout) -> Outcome<TrackingResult>;
    fn shutdown(&mut self);
}

pub struct WorkerTrackingStage {
    capture_tx: Option<Sender<Capture>>,
    result_rx: Receiver<Result<TrackingResult>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerTrackingStage {
    pub fn start<E: BodyTracker>(engine: E, config: TrackerConfig) -> Self {
        let (capture_tx, capture_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(1);

        log::info!("starting body tracking backend: {}", engine.label());
        let handle = thread::spawn(move || run_worker_loop(engine, config, capture_rx, result_tx));

        Self {
            capture_tx: Some(capture_tx),
            result_rx,
            handle: Some(handle),
        }
    }
}

fn run_worker_loop<E: BodyTracker>(
    mut engine: E,
    config: TrackerConfig,
    capture_rx: Receiver<Capture>,
    result_tx: Sender<Result<TrackingResult>>,
) {
    while let Ok(capture) = capture_rx.recv() {
        let outcome = engine.track(&capture, &config).map(|bodies| {
            let ledger = capture.ledger().clone();
            TrackingResult::new(
                &ledger,
                bodies.body_index_map,
                bodies.skeletons,
                Some(capture),
            )
        });

        // An engine failure ends the stage; the controller sees it on pop.
        let failed = outcome.is_err();
        if result_tx.send(outcome).is_err() || failed {
            break;
        }
    }
}

impl TrackingStage for WorkerTrackingStage {
    fn enqueue(&mut self, capture: Capture, timeout: Timeout) -> Outcome<()> {
        let Some(tx) = &self.capture_tx else {
            return Outcome::Fatal(anyhow!("body tracking stage is shut down"));
        };

        let sent = match timeout {
            Timeout::Infinite => tx
                .send(capture)
                .map_err(|_| SendTimeoutError::Disconnected(())),
            Timeout::Bounded(limit) => tx.send_timeout(capture, limit).map_err(|err| match err {
                SendTimeoutError::Timeout(_) => SendTimeoutError::Timeout(()),
                SendTimeoutError::Disconnected(_) => SendTimeoutError::Disconnected(()),
            }),
        };

        match sent {
            Ok(()) => Outcome::Ready(()),
            Err(SendTimeoutError::Timeout(())) => Outcome::Timeout,
            Err(SendTimeoutError::Disconnected(())) => {
                Outcome::Fatal(anyhow!("body tracking worker stopped"))
            }
        }
    }

    fn pop(&mut self, timeout: Timeout) -> Outcome<TrackingResult> {
        let received = match timeout {
            Timeout::Infinite => self
                .result_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
            Timeout::Bounded(limit) => self.result_rx.recv_timeout(limit),
        };

        match received {
            Ok(Ok(result)) => Outcome::Ready(result),
            Ok(Err(err)) => Outcome::Fatal(err.context("body tracking failed")),
            Err(RecvTimeoutError::Timeout) => Outcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => {
                Outcome::Fatal(anyhow!("body tracking worker stopped"))
            }
        }
    }

    fn shutdown(&mut self) {
        self.capture_tx.take();
        if let Some(handle) = self.handle.take() {
            // Drains until the worker drops its sender, releasing any result
            // nobody popped.
            while self.result_rx.recv().is_ok() {}
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerTrackingStage {
    fn drop(&mut self) {
        self.shutdown();
    }
}
