use anyhow::{Result, anyhow};

use super::tracking::{BodyTracker, SensorOrientation, TrackedBodies, TrackerConfig};
use crate::{
    calibration::Calibration,
    types::{
        BODY_INDEX_BACKGROUND, Capture, Joint, JointConfidence, JointId, PixelFormat, PlaneRole,
        Skeleton,
    },
};

const DEFAULT_NEAR_MM: u16 = 300;
const DEFAULT_FAR_MM: u16 = 2500;
const DEFAULT_MIN_PIXELS: usize = 400;
/// Share of the body's vertical extent treated as the head.
const HEAD_BAND: f32 = 0.15;

/// Depth-range segmentation backend: everything between the near and far
/// planes is one body (label 0, skeleton id 1).
pub struct ForegroundTracker {
    calibration: Calibration,
    near_mm: u16,
    far_mm: u16,
    min_pixels: usize,
}

struct BodyPoint {
    up: f32,
    lateral: f32,
    position: [f32; 3],
}

impl ForegroundTracker {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            calibration,
            near_mm: DEFAULT_NEAR_MM,
            far_mm: DEFAULT_FAR_MM,
            min_pixels: DEFAULT_MIN_PIXELS,
        }
    }

    #[cfg(test)]
    pub fn with_min_pixels(mut self, min_pixels: usize) -> Self {
        self.min_pixels = min_pixels.max(1);
        self
    }

    fn confidence(&self, pixels: usize) -> JointConfidence {
        if pixels >= self.min_pixels * 4 {
            JointConfidence::High
        } else if pixels >= self.min_pixels * 2 {
            JointConfidence::Medium
        } else {
            JointConfidence::Low
        }
    }

    fn estimate_skeleton(&self, points: &[BodyPoint], orientation: SensorOrientation) -> Skeleton {
        let pelvis = centroid(points.iter()).unwrap_or([0.0; 3]);

        let (low, high) = points
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), p| (lo.min(p.up), hi.max(p.up)));
        let cutoff = high - (high - low) * HEAD_BAND;
        let head = centroid(points.iter().filter(|p| p.up >= cutoff)).unwrap_or(pelvis);

        let extreme = |pick_max: bool| {
            points
                .iter()
                .max_by(|a, b| {
                    let ordering = a.lateral.total_cmp(&b.lateral);
                    if pick_max { ordering } else { ordering.reverse() }
                })
                .map(|p| p.position)
                .unwrap_or(pelvis)
        };
        // Image-left is the subject's right when facing the camera, unless
        // the sensor is upside down.
        let mirrored = orientation == SensorOrientation::Flip180;
        let (hand_left, hand_right) = if mirrored {
            (extreme(false), extreme(true))
        } else {
            (extreme(true), extreme(false))
        };

        let confidence = self.confidence(points.len());
        let joints = JointId::ALL
            .iter()
            .map(|&id| {
                let estimated = match id {
                    JointId::Pelvis => Some(pelvis),
                    JointId::SpineNavel => Some(lerp(pelvis, head, 0.25)),
                    JointId::SpineChest => Some(lerp(pelvis, head, 0.55)),
                    JointId::Neck => Some(lerp(pelvis, head, 0.8)),
                    JointId::Head => Some(head),
                    JointId::HandLeft => Some(hand_left),
                    JointId::HandRight => Some(hand_right),
                    _ => None,
                };
                Joint {
                    id,
                    position: estimated.unwrap_or(pelvis),
                    confidence: if estimated.is_some() {
                        confidence
                    } else {
                        JointConfidence::None
                    },
                }
            })
            .collect();

        Skeleton { id: 1, joints }
    }
}

impl BodyTracker for ForegroundTracker {
    fn label(&self) -> &'static str {
        "foreground"
    }

    fn track(&mut self, capture: &Capture, config: &TrackerConfig) -> Result<TrackedBodies> {
        let depth = capture
            .plane(PlaneRole::Depth)
            .ok_or_else(|| anyhow!("capture has no depth image"))?;
        let (width, height) = depth.dimensions();
        let intrinsics = &self.calibration.depth;
        if (intrinsics.width, intrinsics.height) != (width, height) {
            return Err(anyhow!(
                "depth image is {width}x{height}, calibration expects {}x{}",
                intrinsics.width,
                intrinsics.height
            ));
        }

        let samples = depth.u16_samples();
        let range = self.near_mm..=self.far_mm;
        let mut labels = vec![BODY_INDEX_BACKGROUND; samples.len()];
        let mut points = Vec::new();
        for (idx, &d) in samples.iter().enumerate() {
            if d == 0 || !range.contains(&d) {
                continue;
            }
            labels[idx] = 0;
            if config.skeletons {
                let (u, v) = ((idx % width as usize) as f32, (idx / width as usize) as f32);
                let (up, lateral) = match config.orientation {
                    SensorOrientation::Default => (-v, u),
                    SensorOrientation::Flip180 => (v, u),
                    SensorOrientation::Clockwise90 => (u, v),
                    SensorOrientation::CounterClockwise90 => (-u, v),
                };
                points.push(BodyPoint {
                    up,
                    lateral,
                    position: intrinsics.unproject([u, v], d as f32),
                });
            }
        }

        let skeletons = if config.skeletons && points.len() >= self.min_pixels {
            vec![self.estimate_skeleton(&points, config.orientation)]
        } else {
            Vec::new()
        };
        let body_index_map = config.body_index_map.then(|| {
            depth.derive(
                PlaneRole::BodyIndexMap,
                PixelFormat::Custom8,
                width,
                height,
                labels,
            )
        });

        Ok(TrackedBodies {
            body_index_map,
            skeletons,
        })
    }
}

fn centroid<'a>(points: impl Iterator<Item = &'a BodyPoint>) -> Option<[f32; 3]> {
    let mut sum = [0.0f64; 3];
    let mut count = 0usize;
    for p in points {
        for (acc, c) in sum.iter_mut().zip(p.position) {
            *acc += c as f64;
        }
        count += 1;
    }
    (count > 0).then(|| sum.map(|s| (s / count as f64) as f32))
}

fn lerp(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}
