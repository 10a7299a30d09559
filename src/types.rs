use std::{borrow::Cow, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::ledger::{HandleKind, HandleLedger, Lease};

/// Label written into body index maps where no body was segmented.
pub const BODY_INDEX_BACKGROUND: u8 = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra32,
    Mjpg,
    Nv12,
    Yuy2,
    Depth16,
    Ir16,
    Custom8,
    Custom16,
    Xyz16,
}

impl PixelFormat {
    pub fn code(self) -> u8 {
        match self {
            PixelFormat::Bgra32 => 0,
            PixelFormat::Mjpg => 1,
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuy2 => 3,
            PixelFormat::Depth16 => 4,
            PixelFormat::Ir16 => 5,
            PixelFormat::Custom8 => 6,
            PixelFormat::Custom16 => 7,
            PixelFormat::Xyz16 => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PixelFormat::Bgra32,
            1 => PixelFormat::Mjpg,
            2 => PixelFormat::Nv12,
            3 => PixelFormat::Yuy2,
            4 => PixelFormat::Depth16,
            5 => PixelFormat::Ir16,
            6 => PixelFormat::Custom8,
            7 => PixelFormat::Custom16,
            8 => PixelFormat::Xyz16,
            _ => return None,
        })
    }

    /// Bytes per pixel for row-addressable formats. `None` for compressed and
    /// planar layouts.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Bgra32 => Some(4),
            PixelFormat::Depth16 | PixelFormat::Ir16 | PixelFormat::Custom16 => Some(2),
            PixelFormat::Yuy2 => Some(2),
            PixelFormat::Custom8 => Some(1),
            PixelFormat::Xyz16 => Some(6),
            PixelFormat::Mjpg | PixelFormat::Nv12 => None,
        }
    }

    /// Smallest buffer holding `height` rows of `width` pixels laid out at
    /// `stride`. `None` when only a decoder can tell.
    fn required_len(self, width: u32, height: u32, stride: usize) -> Option<usize> {
        let (width, rows) = (width as usize, height as usize);
        if width == 0 || rows == 0 {
            return Some(0);
        }
        match self {
            PixelFormat::Mjpg => None,
            PixelFormat::Nv12 => {
                let luma = stride.max(width) * rows;
                Some(luma + luma / 2)
            }
            _ => {
                let row_bytes = self.bytes_per_pixel()? * width;
                Some(stride.max(row_bytes) * (rows - 1) + row_bytes)
            }
        }
    }

    /// Rejects buffers that cannot hold the rows their header describes.
    pub fn check_layout(self, width: u32, height: u32, stride: usize, len: usize) -> Result<()> {
        if let Some(bpp) = self.bytes_per_pixel() {
            let row_bytes = bpp * width as usize;
            if height > 1 && stride < row_bytes {
                bail!("{self:?} stride {stride} is shorter than a {width} pixel row");
            }
        }
        match self.required_len(width, height, stride) {
            Some(required) if len < required => {
                bail!("{self:?} {width}x{height} needs {required} bytes, buffer holds {len}")
            }
            None if len == 0 && width > 0 && height > 0 => {
                bail!("{self:?} {width}x{height} buffer is empty")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaneRole {
    Color,
    Depth,
    Infrared,
    BodyIndexMap,
    TransformedColor,
    TransformedDepth,
    TransformedBodyIndexMap,
    PointCloud,
}

impl PlaneRole {
    pub fn code(self) -> u8 {
        match self {
            PlaneRole::Color => 0,
            PlaneRole::Depth => 1,
            PlaneRole::Infrared => 2,
            PlaneRole::BodyIndexMap => 3,
            PlaneRole::TransformedColor => 4,
            PlaneRole::TransformedDepth => 5,
            PlaneRole::TransformedBodyIndexMap => 6,
            PlaneRole::PointCloud => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PlaneRole::Color,
            1 => PlaneRole::Depth,
            2 => PlaneRole::Infrared,
            3 => PlaneRole::BodyIndexMap,
            4 => PlaneRole::TransformedColor,
            5 => PlaneRole::TransformedDepth,
            6 => PlaneRole::TransformedBodyIndexMap,
            7 => PlaneRole::PointCloud,
            _ => return None,
        })
    }
}

/// A typed 2D buffer. Clones share pixel data but hold their own lease.
#[derive(Clone, Debug)]
pub struct ImagePlane {
    role: PlaneRole,
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    data: Arc<[u8]>,
    lease: Lease,
}

impl ImagePlane {
    pub fn new(
        ledger: &HandleLedger,
        role: PlaneRole,
        format: PixelFormat,
        width: u32,
        height: u32,
        stride: usize,
        data: Vec<u8>,
    ) -> Self {
        Self {
            role,
            format,
            width,
            height,
            stride,
            data: data.into(),
            lease: ledger.lease(HandleKind::Plane),
        }
    }

    /// Builds a plane whose rows are tightly packed.
    pub fn packed(
        ledger: &HandleLedger,
        role: PlaneRole,
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        let stride = format
            .bytes_per_pixel()
            .map(|bpp| bpp * width as usize)
            .unwrap_or(width as usize);
        Self::new(ledger, role, format, width, height, stride, data)
    }

    pub fn from_u16(
        ledger: &HandleLedger,
        role: PlaneRole,
        format: PixelFormat,
        width: u32,
        height: u32,
        samples: &[u16],
    ) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::packed(ledger, role, format, width, height, data)
    }

    /// A newly owned plane counted on the same ledger as `self`.
    pub fn derive(
        &self,
        role: PlaneRole,
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        Self::packed(self.lease.ledger(), role, format, width, height, data)
    }

    pub fn role(&self) -> PlaneRole {
        self.role
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// False when the buffer is shorter than its dimensions require.
    pub fn is_complete(&self) -> bool {
        self.format
            .check_layout(self.width, self.height, self.stride, self.data.len())
            .is_ok()
    }

    pub fn ledger(&self) -> &HandleLedger {
        self.lease.ledger()
    }

    /// Pixel bytes with stride padding removed.
    pub fn packed_data(&self) -> Cow<'_, [u8]> {
        let Some(bpp) = self.format.bytes_per_pixel() else {
            return Cow::Borrowed(&self.data);
        };
        let row_bytes = bpp * self.width as usize;
        let rows = self.height as usize;
        if self.stride == row_bytes {
            let end = (row_bytes * rows).min(self.data.len());
            return Cow::Borrowed(&self.data[..end]);
        }

        let mut packed = Vec::with_capacity(row_bytes * rows);
        for row in self.data.chunks(self.stride.max(1)).take(rows) {
            packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
        }
        Cow::Owned(packed)
    }

    /// Little-endian 16-bit samples in row-major order.
    pub fn u16_samples(&self) -> Vec<u16> {
        self.packed_data()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// One synchronized acquisition.
#[derive(Clone, Debug)]
pub struct Capture {
    planes: Vec<ImagePlane>,
    timestamp: Duration,
    lease: Lease,
}

impl Capture {
    pub fn new(ledger: &HandleLedger, timestamp: Duration, planes: Vec<ImagePlane>) -> Self {
        Self {
            planes,
            timestamp,
            lease: ledger.lease(HandleKind::Capture),
        }
    }

    /// Extracts a fresh handle for `role`, or `None` if the capture lacks it.
    pub fn plane(&self, role: PlaneRole) -> Option<ImagePlane> {
        self.planes.iter().find(|p| p.role() == role).cloned()
    }

    #[cfg(test)]
    pub fn has(&self, role: PlaneRole) -> bool {
        self.planes.iter().any(|p| p.role() == role)
    }

    pub fn planes(&self) -> &[ImagePlane] {
        &self.planes
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn ledger(&self) -> &HandleLedger {
        self.lease.ledger()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JointConfidence {
    None,
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JointId {
    Pelvis,
    SpineNavel,
    SpineChest,
    Neck,
    ClavicleLeft,
    ShoulderLeft,
    ElbowLeft,
    WristLeft,
    HandLeft,
    HandTipLeft,
    ThumbLeft,
    ClavicleRight,
    ShoulderRight,
    ElbowRight,
    WristRight,
    HandRight,
    HandTipRight,
    ThumbRight,
    HipLeft,
    KneeLeft,
    AnkleLeft,
    FootLeft,
    HipRight,
    KneeRight,
    AnkleRight,
    FootRight,
    Head,
    Nose,
    EyeLeft,
    EarLeft,
    EyeRight,
    EarRight,
}

impl JointId {
    pub const ALL: [JointId; 32] = [
        JointId::Pelvis,
        JointId::SpineNavel,
        JointId::SpineChest,
        JointId::Neck,
        JointId::ClavicleLeft,
        JointId::ShoulderLeft,
        JointId::ElbowLeft,
        JointId::WristLeft,
        JointId::HandLeft,
        JointId::HandTipLeft,
        JointId::ThumbLeft,
        JointId::ClavicleRight,
        JointId::ShoulderRight,
        JointId::ElbowRight,
        JointId::WristRight,
        JointId::HandRight,
        JointId::HandTipRight,
        JointId::ThumbRight,
        JointId::HipLeft,
        JointId::KneeLeft,
        JointId::AnkleLeft,
        JointId::FootLeft,
        JointId::HipRight,
        JointId::KneeRight,
        JointId::AnkleRight,
        JointId::FootRight,
        JointId::Head,
        JointId::Nose,
        JointId::EyeLeft,
        JointId::EarLeft,
        JointId::EyeRight,
        JointId::EarRight,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Joint {
    pub id: JointId,
    /// Millimetres in depth camera space.
    pub position: [f32; 3],
    pub confidence: JointConfidence,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Skeleton {
    /// 1-based, stable across frames for the same body.
    pub id: u32,
    pub joints: Vec<Joint>,
}

#[derive(Debug)]
pub struct TrackingResult {
    body_index_map: Option<ImagePlane>,
    skeletons: Vec<Skeleton>,
    capture: Option<Capture>,
    _lease: Lease,
}

impl TrackingResult {
    pub fn new(
        ledger: &HandleLedger,
        body_index_map: Option<ImagePlane>,
        skeletons: Vec<Skeleton>,
        capture: Option<Capture>,
    ) -> Self {
        Self {
            body_index_map,
            skeletons,
            capture,
            _lease: ledger.lease(HandleKind::TrackingResult),
        }
    }

    pub fn body_index_map(&self) -> Option<ImagePlane> {
        self.body_index_map.clone()
    }

    pub fn skeletons(&self) -> &[Skeleton] {
        &self.skeletons
    }

    /// The capture this result was computed from.
    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Bounded(Duration),
}

/// Result of a blocking collaborator call.
#[derive(Debug)]
pub enum Outcome<T> {
    Ready(T),
    Timeout,
    EndOfStream,
    Fatal(anyhow::Error),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ready(value) => Outcome::Ready(f(value)),
            Outcome::Timeout => Outcome::Timeout,
            Outcome::EndOfStream => Outcome::EndOfStream,
            Outcome::Fatal(err) => Outcome::Fatal(err),
        }
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }
}
