use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{
    calibration::Calibration,
    types::{Outcome, PixelFormat, PlaneRole, Timeout},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorResolution {
    Off,
    R720p,
    R1080p,
    R1440p,
    R1536p,
    R2160p,
    R3072p,
}

impl ColorResolution {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            ColorResolution::Off => (0, 0),
            ColorResolution::R720p => (1280, 720),
            ColorResolution::R1080p => (1920, 1080),
            ColorResolution::R1440p => (2560, 1440),
            ColorResolution::R1536p => (2048, 1536),
            ColorResolution::R2160p => (3840, 2160),
            ColorResolution::R3072p => (4096, 3072),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthMode {
    Off,
    NfovBinned,
    NfovUnbinned,
    WfovBinned,
    WfovUnbinned,
    PassiveIr,
}

impl DepthMode {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            DepthMode::Off => (0, 0),
            DepthMode::NfovBinned => (320, 288),
            DepthMode::NfovUnbinned => (640, 576),
            DepthMode::WfovBinned => (512, 512),
            DepthMode::WfovUnbinned | DepthMode::PassiveIr => (1024, 1024),
        }
    }

    /// Horizontal and vertical field of view in degrees.
    pub fn field_of_view(self) -> (f32, f32) {
        match self {
            DepthMode::NfovBinned | DepthMode::NfovUnbinned => (75.0, 65.0),
            DepthMode::WfovBinned | DepthMode::WfovUnbinned | DepthMode::PassiveIr => {
                (120.0, 120.0)
            }
            DepthMode::Off => (0.0, 0.0),
        }
    }

    pub fn produces_depth(self) -> bool {
        !matches!(self, DepthMode::Off | DepthMode::PassiveIr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRate {
    Fps5,
    Fps15,
    Fps30,
}

impl FrameRate {
    pub fn interval(self) -> Duration {
        match self {
            FrameRate::Fps5 => Duration::from_millis(200),
            FrameRate::Fps15 => Duration::from_micros(66_667),
            FrameRate::Fps30 => Duration::from_micros(33_333),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WiredSyncMode {
    Standalone,
    Master,
    Subordinate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub color_format: PixelFormat,
    pub color_resolution: ColorResolution,
    pub depth_mode: DepthMode,
    pub camera_fps: FrameRate,
    pub synchronized_images_only: bool,
    pub wired_sync_mode: WiredSyncMode,
}

impl DeviceConfiguration {
    /// Synchronized 720p color with NFOV unbinned depth, standalone sync.
    pub fn synchronized(color_format: PixelFormat) -> Self {
        Self {
            color_format,
            color_resolution: ColorResolution::R720p,
            depth_mode: DepthMode::NfovUnbinned,
            camera_fps: FrameRate::Fps30,
            synchronized_images_only: true,
            wired_sync_mode: WiredSyncMode::Standalone,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.color_format,
            PixelFormat::Bgra32 | PixelFormat::Mjpg | PixelFormat::Nv12 | PixelFormat::Yuy2
        ) {
            bail!("{:?} is not a color format", self.color_format);
        }
        if self.synchronized_images_only
            && (self.color_resolution == ColorResolution::Off || self.depth_mode == DepthMode::Off)
        {
            bail!("synchronized images require both the color and depth cameras");
        }
        Ok(())
    }
}

/// One plane as handed over by a driver, before it is counted.
#[derive(Clone, Debug)]
pub struct RawPlane {
    pub role: PlaneRole,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct RawCapture {
    pub timestamp: Duration,
    pub planes: Vec<RawPlane>,
}

impl RawPlane {
    pub fn validate(&self) -> Result<()> {
        self.format
            .check_layout(self.width, self.height, self.stride, self.data.len())
            .with_context(|| format!("{:?} plane is malformed", self.role))
    }
}

impl RawCapture {
    pub fn has(&self, role: PlaneRole) -> bool {
        self.planes.iter().any(|p| p.role == role)
    }

    /// Every plane holds the bytes its header promises.
    pub fn validate(&self) -> Result<()> {
        self.planes.iter().try_for_each(RawPlane::validate)
    }
}

pub trait DeviceDriver {
    fn installed_count(&self) -> Result<u32>;
    fn open(&self, index: u32) -> Result<Box<dyn Device>>;
}

pub trait Device: Send {
    fn start_cameras(&mut self, config: &DeviceConfiguration) -> Result<()>;
    fn calibration(
        &self,
        depth_mode: DepthMode,
        color_resolution: ColorResolution,
    ) -> Result<Calibration>;
    fn get_capture(&mut self, timeout: Timeout) -> Outcome<RawCapture>;
    fn stop_cameras(&mut self);
}
