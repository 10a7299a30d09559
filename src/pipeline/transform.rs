use thiserror::Error;

use crate::{
    calibration::{Calibration, CameraKind, Intrinsics},
    types::{ImagePlane, PixelFormat, PlaneRole},
};

/// Colour samples whose depth in colour space lies further than this behind
/// the nearest surface are treated as occluded.
const OCCLUSION_TOLERANCE_MM: u16 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{operation}: expected {expected:?} {role:?} plane, got {found:?}")]
    UnsupportedFormat {
        operation: &'static str,
        role: PlaneRole,
        expected: PixelFormat,
        found: PixelFormat,
    },

    #[error("{operation}: {role:?} plane is {found:?}, camera expects {expected:?}")]
    DimensionMismatch {
        operation: &'static str,
        role: PlaneRole,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("{operation}: {role:?} plane holds {found} bytes, {expected} required")]
    ShortBuffer {
        operation: &'static str,
        role: PlaneRole,
        expected: usize,
        found: usize,
    },

    #[error("{operation}: linear interpolation would blend label values")]
    InterpolatedLabels { operation: &'static str },
}

/// Geometric remapping between the depth and colour cameras. Every operation
/// is a pure function of the calibration and its inputs.
#[derive(Clone, Debug)]
pub struct Transformer {
    calibration: Calibration,
}

/// Colour-space footprint of one depth pixel.
struct Footprint {
    source: usize,
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
    z: u16,
}

impl Transformer {
    pub fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }

    pub fn color_to_depth(
        &self,
        depth: &ImagePlane,
        color: &ImagePlane,
    ) -> Result<Option<ImagePlane>, TransformError> {
        const OP: &str = "color to depth camera";
        if depth.is_empty() || color.is_empty() {
            return Ok(None);
        }
        self.expect(OP, depth, PixelFormat::Depth16, CameraKind::Depth)?;
        self.expect(OP, color, PixelFormat::Bgra32, CameraKind::Color)?;

        let samples = depth.u16_samples();
        let (cw, ch) = color.dimensions();
        let zbuffer = self.color_space_zbuffer(&samples);
        let colors = color.packed_data();
        let mut out = vec![0u8; samples.len() * 4];

        let intr = &self.calibration.depth;
        for (idx, &d) in samples.iter().enumerate() {
            if d == 0 {
                continue;
            }
            let (u, v) = (idx % intr.width as usize, idx / intr.width as usize);
            let Some(pc) = self.calibration.convert_2d_to_3d(
                [u as f32, v as f32],
                d as f32,
                CameraKind::Depth,
                CameraKind::Color,
            ) else {
                continue;
            };
            let Some([x, y]) = self.calibration.color.project(pc) else {
                continue;
            };
            let (x, y) = (
                (x.round().max(0.0) as usize).min(cw as usize - 1),
                (y.round().max(0.0) as usize).min(ch as usize - 1),
            );
            let target = y * cw as usize + x;
            let z = clamp_mm(pc[2]);
            let nearest = zbuffer[target];
            if nearest != 0 && z > nearest.saturating_add(OCCLUSION_TOLERANCE_MM) {
                continue;
            }
            out[idx * 4..idx * 4 + 4].copy_from_slice(&colors[target * 4..target * 4 + 4]);
        }

        Ok(Some(depth.derive(
            PlaneRole::TransformedColor,
            PixelFormat::Bgra32,
            intr.width,
            intr.height,
            out,
        )))
    }

    pub fn depth_to_color(
        &self,
        depth: &ImagePlane,
    ) -> Result<Option<ImagePlane>, TransformError> {
        const OP: &str = "depth to color camera";
        if depth.is_empty() {
            return Ok(None);
        }
        self.expect(OP, depth, PixelFormat::Depth16, CameraKind::Depth)?;

        let samples = depth.u16_samples();
        let zbuffer = self.color_space_zbuffer(&samples);
        let color = &self.calibration.color;
        Ok(Some(ImagePlane::from_u16(
            depth.ledger(),
            PlaneRole::TransformedDepth,
            PixelFormat::Depth16,
            color.width,
            color.height,
            &zbuffer,
        )))
    }

    /// Maps depth into the colour camera and carries `aux` along with it.
    /// Output pixels with no depth sample receive `background`.
    pub fn depth_to_color_with_aux(
        &self,
        depth: &ImagePlane,
        aux: &ImagePlane,
        interpolation: Interpolation,
        background: u16,
    ) -> Result<Option<(ImagePlane, ImagePlane)>, TransformError> {
        const OP: &str = "depth to color camera (custom)";
        if depth.is_empty() || aux.is_empty() {
            return Ok(None);
        }
        self.expect(OP, depth, PixelFormat::Depth16, CameraKind::Depth)?;
        let wide = match aux.format() {
            PixelFormat::Custom8 => false,
            PixelFormat::Custom16 => true,
            found => {
                return Err(TransformError::UnsupportedFormat {
                    operation: OP,
                    role: aux.role(),
                    expected: PixelFormat::Custom8,
                    found,
                });
            }
        };
        if !wide && interpolation == Interpolation::Linear {
            return Err(TransformError::InterpolatedLabels { operation: OP });
        }
        if aux.dimensions() != depth.dimensions() {
            return Err(TransformError::DimensionMismatch {
                operation: OP,
                role: aux.role(),
                expected: depth.dimensions(),
                found: aux.dimensions(),
            });
        }
        complete(OP, aux)?;

        let samples = depth.u16_samples();
        let aux_values: Vec<u16> = if wide {
            aux.u16_samples()
        } else {
            aux.packed_data().iter().map(|&v| v as u16).collect()
        };

        let dw = self.calibration.depth.width as usize;
        let color = &self.calibration.color;
        let cw = color.width as usize;
        let mut zbuffer = vec![0u16; cw * color.height as usize];
        let mut carried = vec![background; zbuffer.len()];
        self.for_each_footprint(&samples, |fp| {
            for y in fp.y0..fp.y1 {
                for x in fp.x0..fp.x1 {
                    let target = y * cw + x;
                    if zbuffer[target] != 0 && zbuffer[target] <= fp.z {
                        continue;
                    }
                    zbuffer[target] = fp.z;
                    carried[target] = match interpolation {
                        Interpolation::Nearest => aux_values[fp.source],
                        Interpolation::Linear => {
                            let fx = (x - fp.x0) as f32 / (fp.x1 - fp.x0) as f32;
                            let fy = (y - fp.y0) as f32 / (fp.y1 - fp.y0) as f32;
                            sample_linear(&aux_values, &samples, dw, fp.source, fx, fy)
                        }
                    };
                }
            }
        });

        let aligned_depth = ImagePlane::from_u16(
            depth.ledger(),
            PlaneRole::TransformedDepth,
            PixelFormat::Depth16,
            color.width,
            color.height,
            &zbuffer,
        );
        let aligned_aux = if wide {
            ImagePlane::from_u16(
                aux.ledger(),
                PlaneRole::TransformedBodyIndexMap,
                PixelFormat::Custom16,
                color.width,
                color.height,
                &carried,
            )
        } else {
            aux.derive(
                PlaneRole::TransformedBodyIndexMap,
                PixelFormat::Custom8,
                color.width,
                color.height,
                carried.iter().map(|&v| v.min(255) as u8).collect(),
            )
        };
        Ok(Some((aligned_depth, aligned_aux)))
    }

    /// Unprojects every valid sample of a depth plane that already lives in
    /// `camera`'s geometry into millimetre XYZ.
    pub fn depth_to_point_cloud(
        &self,
        depth: &ImagePlane,
        camera: CameraKind,
    ) -> Result<Option<ImagePlane>, TransformError> {
        const OP: &str = "depth to point cloud";
        if depth.is_empty() {
            return Ok(None);
        }
        self.expect(OP, depth, PixelFormat::Depth16, camera)?;

        let intr = self.calibration.camera(camera);
        let samples = depth.u16_samples();
        let mut out = Vec::with_capacity(samples.len() * 6);
        for (idx, &d) in samples.iter().enumerate() {
            let xyz = if d == 0 {
                [0i16; 3]
            } else {
                let (u, v) = (idx % intr.width as usize, idx / intr.width as usize);
                let p = intr.unproject([u as f32, v as f32], d as f32);
                p.map(|c| c.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            };
            for c in xyz {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }

        Ok(Some(depth.derive(
            PlaneRole::PointCloud,
            PixelFormat::Xyz16,
            intr.width,
            intr.height,
            out,
        )))
    }

    fn expect(
        &self,
        operation: &'static str,
        plane: &ImagePlane,
        format: PixelFormat,
        camera: CameraKind,
    ) -> Result<(), TransformError> {
        if plane.format() != format {
            return Err(TransformError::UnsupportedFormat {
                operation,
                role: plane.role(),
                expected: format,
                found: plane.format(),
            });
        }
        let intr: &Intrinsics = self.calibration.camera(camera);
        if plane.dimensions() != (intr.width, intr.height) {
            return Err(TransformError::DimensionMismatch {
                operation,
                role: plane.role(),
                expected: (intr.width, intr.height),
                found: plane.dimensions(),
            });
        }
        complete(operation, plane)?;
        Ok(())
    }

    /// Nearest-surface depth per colour pixel.
    fn color_space_zbuffer(&self, samples: &[u16]) -> Vec<u16> {
        let color = &self.calibration.color;
        let cw = color.width as usize;
        let mut zbuffer = vec![0u16; cw * color.height as usize];
        self.for_each_footprint(samples, |fp| {
            for y in fp.y0..fp.y1 {
                for x in fp.x0..fp.x1 {
                    let target = y * cw + x;
                    if zbuffer[target] == 0 || fp.z < zbuffer[target] {
                        zbuffer[target] = fp.z;
                    }
                }
            }
        });
        zbuffer
    }

    fn for_each_footprint(&self, samples: &[u16], mut visit: impl FnMut(Footprint)) {
        let depth = &self.calibration.depth;
        let color = &self.calibration.color;
        let extrinsics = &self.calibration.depth_to_color;
        let dw = depth.width as usize;

        for (idx, &d) in samples.iter().enumerate() {
            if d == 0 {
                continue;
            }
            let (u, v) = ((idx % dw) as f32, (idx / dw) as f32);
            let corner = |du: f32, dv: f32| {
                let p = extrinsics.apply(depth.unproject([u + du, v + dv], d as f32));
                color.project_unbounded(p).map(|px| (px, p[2]))
            };
            let (Some(([ax, ay], _)), Some(([bx, by], _)), Some((_, z))) =
                (corner(-0.5, -0.5), corner(0.5, 0.5), corner(0.0, 0.0))
            else {
                continue;
            };

            let Some((x0, x1)) = pixel_span(ax.min(bx), ax.max(bx), color.width) else {
                continue;
            };
            let Some((y0, y1)) = pixel_span(ay.min(by), ay.max(by), color.height) else {
                continue;
            };
            visit(Footprint {
                source: idx,
                x0,
                x1,
                y0,
                y1,
                z: clamp_mm(z),
            });
        }
    }
}

fn complete(operation: &'static str, plane: &ImagePlane) -> Result<(), TransformError> {
    if plane.is_complete() {
        return Ok(());
    }
    let bpp = plane.format().bytes_per_pixel().unwrap_or(1);
    Err(TransformError::ShortBuffer {
        operation,
        role: plane.role(),
        expected: bpp * plane.width() as usize * plane.height() as usize,
        found: plane.data().len(),
    })
}

/// Half-open pixel range covered by `[lo, hi]`, at least one pixel wide.
fn pixel_span(lo: f32, hi: f32, limit: u32) -> Option<(usize, usize)> {
    let start = (lo + 0.5).floor();
    let mut end = (hi + 0.5).floor();
    if end <= start {
        end = start + 1.0;
    }
    let start = start.max(0.0);
    let end = end.min(limit as f32);
    (end > start).then(|| (start as usize, end as usize))
}

fn clamp_mm(z: f32) -> u16 {
    z.round().clamp(1.0, u16::MAX as f32) as u16
}

/// Bilinear blend of `values` around `source`, skipping neighbours that
/// carry no depth.
fn sample_linear(
    values: &[u16],
    depth: &[u16],
    width: usize,
    source: usize,
    fx: f32,
    fy: f32,
) -> u16 {
    let (u, v) = (source % width, source / width);
    let rows = depth.len() / width;
    let mut acc = 0.0f32;
    let mut weight = 0.0f32;
    for (du, dv, w) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        let (nu, nv) = (u + du, v + dv);
        if nu >= width || nv >= rows {
            continue;
        }
        let neighbour = nv * width + nu;
        if depth[neighbour] == 0 {
            continue;
        }
        acc += values[neighbour] as f32 * w;
        weight += w;
    }
    if weight <= f32::EPSILON {
        values[source]
    } else {
        (acc / weight).round() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::Extrinsics,
        ledger::HandleLedger,
        pipeline::device::{ColorResolution, DepthMode},
        types::BODY_INDEX_BACKGROUND,
    };

    fn coaxial() -> Calibration {
        let intrinsics = Intrinsics {
            width: 8,
            height: 6,
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

    fn flat_depth(ledger: &HandleLedger, mm: u16) -> ImagePlane {
        let mut samples = vec![mm; 48];
        samples[0] = 0;
        ImagePlane::from_u16(ledger, PlaneRole::Depth, PixelFormat::Depth16, 8, 6, &samples)
    }

    fn gradient_color(ledger: &HandleLedger) -> ImagePlane {
        let data = (0..48u8).flat_map(|i| [i, i + 1, i + 2, 255]).collect();
        ImagePlane::packed(ledger, PlaneRole::Color, PixelFormat::Bgra32, 8, 6, data)
    }

    #[test]
    fn coaxial_depth_maps_onto_itself() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let depth = flat_depth(&ledger, 1200);
        let aligned = transformer.depth_to_color(&depth).unwrap().unwrap();
        assert_eq!(aligned.role(), PlaneRole::TransformedDepth);
        assert_eq!(aligned.u16_samples(), depth.u16_samples());
    }

    #[test]
    fn color_to_depth_is_deterministic() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(Calibration {
            depth_to_color: Extrinsics::rotation_x(-6.0, [-3.0, 0.0, 0.0]),
            ..coaxial()
        });
        let depth = flat_depth(&ledger, 900);
        let color = gradient_color(&ledger);

        let first = transformer.color_to_depth(&depth, &color).unwrap().unwrap();
        let second = transformer.color_to_depth(&depth, &color).unwrap().unwrap();
        assert_eq!(first.data(), second.data());
        assert_eq!(first.dimensions(), (8, 6));
        assert_eq!(&first.data()[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn empty_planes_are_a_no_op() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let empty = ImagePlane::packed(
            &ledger,
            PlaneRole::Depth,
            PixelFormat::Depth16,
            0,
            0,
            Vec::new(),
        );
        assert!(transformer.depth_to_color(&empty).unwrap().is_none());
        assert!(
            transformer
                .depth_to_point_cloud(&empty, CameraKind::Depth)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn aux_pixels_without_depth_get_background() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let depth = flat_depth(&ledger, 1500);
        let labels = ImagePlane::packed(
            &ledger,
            PlaneRole::BodyIndexMap,
            PixelFormat::Custom8,
            8,
            6,
            vec![2; 48],
        );

        let (_, aligned) = transformer
            .depth_to_color_with_aux(
                &depth,
                &labels,
                Interpolation::Nearest,
                BODY_INDEX_BACKGROUND as u16,
            )
            .unwrap()
            .unwrap();
        let values = aligned.packed_data();
        assert_eq!(values[0], BODY_INDEX_BACKGROUND);
        assert!(values[1..].iter().all(|&v| v == 2));
    }

    #[test]
    fn linear_interpolation_is_refused_for_labels() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let depth = flat_depth(&ledger, 1500);
        let labels = ImagePlane::packed(
            &ledger,
            PlaneRole::BodyIndexMap,
            PixelFormat::Custom8,
            8,
            6,
            vec![0; 48],
        );
        let err = transformer
            .depth_to_color_with_aux(&depth, &labels, Interpolation::Linear, 255)
            .unwrap_err();
        assert!(matches!(err, TransformError::InterpolatedLabels { .. }));
    }

    #[test]
    fn mismatched_depth_size_is_rejected() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let depth = ImagePlane::from_u16(
            &ledger,
            PlaneRole::Depth,
            PixelFormat::Depth16,
            2,
            2,
            &[1, 2, 3, 4],
        );
        assert!(matches!(
            transformer.depth_to_color(&depth),
            Err(TransformError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn short_color_plane_is_a_transform_error() {
        let ledger = HandleLedger::new();
        let transformer = Transformer::new(coaxial());
        let depth = flat_depth(&ledger, 900);
        let color = ImagePlane::packed(
            &ledger,
            PlaneRole::Color,
            PixelFormat::Bgra32,
            8,
            6,
            vec![0; 16],
        );
        let err = transformer.color_to_depth(&depth, &color).unwrap_err();
        assert!(matches!(
            err,
            TransformError::ShortBuffer {
                role: PlaneRole::Color,
                expected: 192,
                found: 16,
                ..
            }
        ));
    }

    #[test]
    fn point_cloud_centre_lies_on_axis() {
        let ledger = HandleLedger::new();
        let mut calibration = coaxial();
        calibration.depth.cx = 4.0;
        calibration.depth.cy = 3.0;
        let transformer = Transformer::new(calibration);
        let depth = flat_depth(&ledger, 2000);

        let cloud = transformer
            .depth_to_point_cloud(&depth, CameraKind::Depth)
            .unwrap()
            .unwrap();
        assert_eq!(cloud.format(), PixelFormat::Xyz16);
        let centre = (3 * 8 + 4) * 6;
        let xyz: Vec<i16> = cloud.data()[centre..centre + 6]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(xyz, vec![0, 0, 2000]);
        assert!(cloud.data()[..6].iter().all(|&b| b == 0));
    }
}
