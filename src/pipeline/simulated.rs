use std::{thread, time::Instant};

use anyhow::{Result, anyhow, bail};
use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};
use rayon::prelude::*;

use super::device::{
    ColorResolution, DepthMode, Device, DeviceConfiguration, DeviceDriver, RawCapture, RawPlane,
};
use crate::{
    calibration::Calibration,
    types::{Outcome, PixelFormat, PlaneRole, Timeout},
};

const WALL_MM: u16 = 3000;
const SUBJECT_MM: u16 = 1500;
/// Columns at the left edge that never return depth, like a real sensor.
const INVALID_BORDER: u32 = 8;
const JPEG_QUALITY: u8 = 80;

/// A driver for synthetic sensors: a wall with one person-sized shape
/// sweeping across it.
#[derive(Clone, Debug, Default)]
pub struct SimulatedDriver {
    devices: u32,
    fail_after: Option<u64>,
    realtime: bool,
}

impl SimulatedDriver {
    pub fn new(devices: u32) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    /// Every opened device reports a fatal error once it has produced `frames`.
    #[cfg(test)]
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Paces captures at the configured frame rate.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }
}

impl DeviceDriver for SimulatedDriver {
    fn installed_count(&self) -> Result<u32> {
        Ok(self.devices)
    }

    fn open(&self, index: u32) -> Result<Box<dyn Device>> {
        if index >= self.devices {
            bail!(
                "device index {index} out of range ({} installed)",
                self.devices
            );
        }
        Ok(Box::new(SimulatedDevice {
            config: None,
            frames: 0,
            fail_after: self.fail_after,
            realtime: self.realtime,
            next_due: None,
        }))
    }
}

pub struct SimulatedDevice {
    config: Option<DeviceConfiguration>,
    frames: u64,
    fail_after: Option<u64>,
    realtime: bool,
    next_due: Option<Instant>,
}

impl Device for SimulatedDevice {
    fn start_cameras(&mut self, config: &DeviceConfiguration) -> Result<()> {
        config.validate()?;
        if !matches!(config.color_format, PixelFormat::Bgra32 | PixelFormat::Mjpg) {
            bail!(
                "simulated color camera only produces BGRA32 or MJPG, not {:?}",
                config.color_format
            );
        }
        if self.config.is_some() {
            bail!("cameras already started");
        }
        self.config = Some(*config);
        Ok(())
    }

    fn calibration(
        &self,
        depth_mode: DepthMode,
        color_resolution: ColorResolution,
    ) -> Result<Calibration> {
        Ok(Calibration::nominal(depth_mode, color_resolution))
    }

    fn get_capture(&mut self, timeout: Timeout) -> Outcome<RawCapture> {
        let Some(config) = self.config else {
            return Outcome::Fatal(anyhow!("cameras are not started"));
        };
        if self.fail_after.is_some_and(|limit| self.frames >= limit) {
            return Outcome::Fatal(anyhow!("device stopped responding"));
        }

        let interval = config.camera_fps.interval();
        if self.realtime {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            let wait = due.saturating_duration_since(now);
            if let Timeout::Bounded(limit) = timeout {
                if wait > limit {
                    thread::sleep(limit);
                    return Outcome::Timeout;
                }
            }
            thread::sleep(wait);
            self.next_due = Some(due.max(now) + interval);
        }

        let timestamp = interval * self.frames as u32;
        match synthesize(&config, self.frames) {
            Ok(planes) => {
                self.frames += 1;
                Outcome::Ready(RawCapture { timestamp, planes })
            }
            Err(err) => Outcome::Fatal(err),
        }
    }

    fn stop_cameras(&mut self) {
        if self.config.take().is_some() {
            log::info!("simulated device stopped after {} frames", self.frames);
        }
    }
}

/// Horizontal centre of the subject as a fraction of the image width.
fn subject_centre(frame: u64) -> f32 {
    0.5 + 0.25 * (frame as f32 * 0.05).sin()
}

fn synthesize(config: &DeviceConfiguration, frame: u64) -> Result<Vec<RawPlane>> {
    let mut planes = Vec::with_capacity(3);
    let centre = subject_centre(frame);

    if config.depth_mode != DepthMode::Off {
        let (width, height) = config.depth_mode.dimensions();
        let depth = depth_samples(width, height, centre);
        if config.depth_mode.produces_depth() {
            planes.push(u16_plane(
                PlaneRole::Depth,
                PixelFormat::Depth16,
                width,
                height,
                &depth,
            ));
        }
        let infrared: Vec<u16> = depth
            .iter()
            .map(|&d| if d == 0 { 0 } else { (400_000 / d as u32) as u16 })
            .collect();
        planes.push(u16_plane(
            PlaneRole::Infrared,
            PixelFormat::Ir16,
            width,
            height,
            &infrared,
        ));
    }

    if config.color_resolution != ColorResolution::Off {
        let (width, height) = config.color_resolution.dimensions();
        let bgra = color_pixels(width, height, centre);
        let plane = match config.color_format {
            PixelFormat::Bgra32 => RawPlane {
                role: PlaneRole::Color,
                format: PixelFormat::Bgra32,
                width,
                height,
                stride: width as usize * 4,
                data: bgra,
            },
            PixelFormat::Mjpg => RawPlane {
                role: PlaneRole::Color,
                format: PixelFormat::Mjpg,
                width,
                height,
                stride: 0,
                data: encode_jpeg(&bgra, width, height)?,
            },
            other => bail!("cannot synthesize {other:?} color"),
        };
        planes.push(plane);
    }

    Ok(planes)
}

fn inside_subject(u: f32, v: f32, centre: f32) -> bool {
    let half_width = 0.07;
    let torso = (u - centre).abs() < half_width && (0.35..0.97).contains(&v);
    let (du, dv) = ((u - centre) / 0.055, (v - 0.26) / 0.07);
    torso || du * du + dv * dv < 1.0
}

fn depth_samples(width: u32, height: u32, centre: f32) -> Vec<u16> {
    let mut samples = vec![0u16; width as usize * height as usize];
    samples
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let v = y as f32 / height as f32;
            for (x, sample) in row.iter_mut().enumerate() {
                if (x as u32) < INVALID_BORDER {
                    continue;
                }
                let u = x as f32 / width as f32;
                *sample = if inside_subject(u, v, centre) {
                    SUBJECT_MM
                } else {
                    WALL_MM
                };
            }
        });
    samples
}

fn color_pixels(width: u32, height: u32, centre: f32) -> Vec<u8> {
    let mut bgra = vec![0u8; width as usize * height as usize * 4];
    bgra.par_chunks_mut(width as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let v = y as f32 / height as f32;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let u = x as f32 / width as f32;
                if inside_subject(u, v, centre) {
                    px.copy_from_slice(&[60, 90, 200, 255]);
                } else {
                    px.copy_from_slice(&[(u * 255.0) as u8, (v * 255.0) as u8, 96, 255]);
                }
            }
        });
    bgra
}

fn encode_jpeg(bgra: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let rgb: Vec<u8> = bgra
        .chunks_exact(4)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|err| anyhow!("MJPEG encode failed: {err}"))?;
    Ok(jpeg)
}

fn u16_plane(
    role: PlaneRole,
    format: PixelFormat,
    width: u32,
    height: u32,
    samples: &[u16],
) -> RawPlane {
    RawPlane {
        role,
        format,
        width,
        height,
        stride: width as usize * 2,
        data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}
