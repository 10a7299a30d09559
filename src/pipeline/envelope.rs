use anyhow::Result;

use super::rgba_converter::to_bgra_plane;
use crate::types::{Capture, ImagePlane, PlaneRole};

/// Per-tick owner of the acquired capture. The capture leaves the envelope
/// exactly once: handed to tracking, or released.
#[derive(Debug)]
pub struct FrameEnvelope {
    capture: Option<Capture>,
}

impl FrameEnvelope {
    pub fn new(capture: Capture) -> Self {
        Self {
            capture: Some(capture),
        }
    }

    /// A fresh handle on the plane for `role`. Absent planes, and planes of an
    /// envelope that already gave up its capture, are `None`.
    pub fn plane(&self, role: PlaneRole) -> Option<ImagePlane> {
        self.capture.as_ref()?.plane(role)
    }

    /// The colour plane decoded to BGRA32, ready for the transformer.
    pub fn bgra_color(&self) -> Result<Option<ImagePlane>> {
        let Some(color) = self.plane(PlaneRole::Color) else {
            return Ok(None);
        };
        into_renderable(color, to_bgra_plane).map(Some)
    }

    pub fn hand_off(&mut self) -> Option<Capture> {
        self.capture.take()
    }

    pub fn release(&mut self) {
        self.capture.take();
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.capture.is_none()
    }
}

/// Converts `plane` and releases it straight away, so the result never
/// depends on the source handle.
pub fn into_renderable<T>(
    plane: ImagePlane,
    convert: impl FnOnce(&ImagePlane) -> Result<T>,
) -> Result<T> {
    let converted = convert(&plane);
    drop(plane);
    converted
}
