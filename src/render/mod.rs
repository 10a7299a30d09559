pub mod palette;
pub mod skeleton;

use anyhow::{Result, anyhow, bail};
use image::{GrayImage, Rgb, RgbImage, RgbaImage, buffer::ConvertBuffer};
use rayon::prelude::*;

pub use palette::Palette;

use crate::{
    calibration::Calibration,
    pipeline::rgba_converter::convert_color_plane,
    types::{BODY_INDEX_BACKGROUND, ImagePlane, PixelFormat, PlaneRole, Skeleton},
};

/// Far-plane normalisation for depth display, in millimetres.
pub const DEPTH_FAR_MM: f64 = 5000.0;
pub const OVERLAY_WEIGHT: f32 = 0.7;
pub const BASE_WEIGHT: f32 = 0.3;

/// Near surfaces bright, far ones dark; invalid zero samples saturate white.
pub fn depth_to_display(raw: u16) -> u8 {
    (raw as f64 * (-255.0 / DEPTH_FAR_MM) + 255.0)
        .round()
        .clamp(0.0, 255.0) as u8
}

pub fn infrared_to_display(raw: u16) -> u8 {
    (raw as f64 * 0.5).round().clamp(0.0, 255.0) as u8
}

/// Turns planes into displayable 8-bit images.
pub struct Renderer {
    palette: Palette,
    calibration: Calibration,
}

impl Renderer {
    pub fn new(palette: Palette, calibration: Calibration) -> Self {
        Self {
            palette,
            calibration,
        }
    }

    pub fn color(&self, plane: &ImagePlane) -> Result<RgbaImage> {
        expect_role(plane, &[PlaneRole::Color, PlaneRole::TransformedColor])?;
        let frame = convert_color_plane(plane)?;
        RgbaImage::from_raw(frame.width, frame.height, frame.rgba)
            .ok_or_else(|| anyhow!("colour buffer does not match its dimensions"))
    }

    pub fn depth(&self, plane: &ImagePlane) -> Result<GrayImage> {
        expect_role(plane, &[PlaneRole::Depth, PlaneRole::TransformedDepth])?;
        expect_format(plane, PixelFormat::Depth16)?;
        gray(plane, plane.u16_samples().par_iter().map(|&d| depth_to_display(d)).collect())
    }

    pub fn infrared(&self, plane: &ImagePlane) -> Result<GrayImage> {
        expect_role(plane, &[PlaneRole::Infrared])?;
        expect_format(plane, PixelFormat::Ir16)?;
        gray(
            plane,
            plane
                .u16_samples()
                .par_iter()
                .map(|&ir| infrared_to_display(ir))
                .collect(),
        )
    }

    /// Shows the Z channel through the depth map.
    pub fn point_cloud(&self, plane: &ImagePlane) -> Result<GrayImage> {
        expect_role(plane, &[PlaneRole::PointCloud])?;
        expect_format(plane, PixelFormat::Xyz16)?;
        let packed = plane.packed_data();
        let samples: &[u8] = &packed;
        let pixels = samples
            .par_chunks_exact(6)
            .map(|xyz| {
                let z = i16::from_le_bytes([xyz[4], xyz[5]]);
                depth_to_display(z.max(0) as u16)
            })
            .collect();
        gray(plane, pixels)
    }

    /// Labels through the palette, background black.
    pub fn body_index_map(&self, plane: &ImagePlane) -> Result<RgbImage> {
        expect_role(
            plane,
            &[PlaneRole::BodyIndexMap, PlaneRole::TransformedBodyIndexMap],
        )?;
        expect_format(plane, PixelFormat::Custom8)?;
        let (width, height) = plane.dimensions();
        let packed = plane.packed_data();
        let labels: &[u8] = &packed;
        let rgb: Vec<u8> = labels
            .par_iter()
            .flat_map_iter(|&label| {
                let Rgb(color) = if label == BODY_INDEX_BACKGROUND {
                    Rgb([0, 0, 0])
                } else {
                    self.palette.for_label(label as u32)
                };
                color
            })
            .collect();
        RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| anyhow!("index map buffer does not match its dimensions"))
    }

    /// Skeleton overlay on the colour-camera image.
    pub fn skeletons(&self, base: &RgbaImage, skeletons: &[Skeleton]) -> RgbImage {
        let mut image: RgbImage = base.convert();
        skeleton::draw_skeletons(&mut image, skeletons, &self.calibration, &self.palette);
        image
    }

    /// `overlay * 0.7 + base * 0.3`, base reduced to three channels first.
    pub fn blend(&self, base: &RgbaImage, overlay: &RgbImage) -> Result<RgbImage> {
        if base.dimensions() != overlay.dimensions() {
            bail!(
                "cannot blend {:?} overlay onto {:?} image",
                overlay.dimensions(),
                base.dimensions()
            );
        }
        let base: RgbImage = base.convert();
        let (width, height) = base.dimensions();
        let blended: Vec<u8> = base
            .as_raw()
            .par_iter()
            .zip(overlay.as_raw().par_iter())
            .map(|(&b, &o)| {
                (o as f32 * OVERLAY_WEIGHT + b as f32 * BASE_WEIGHT)
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect();
        RgbImage::from_raw(width, height, blended)
            .ok_or_else(|| anyhow!("blend buffer does not match its dimensions"))
    }
}

fn expect_role(plane: &ImagePlane, roles: &[PlaneRole]) -> Result<()> {
    if !roles.contains(&plane.role()) {
        bail!("cannot render a {:?} plane here", plane.role());
    }
    Ok(())
}

fn expect_format(plane: &ImagePlane, format: PixelFormat) -> Result<()> {
    if plane.format() != format {
        bail!(
            "{:?} plane is {:?}, expected {format:?}",
            plane.role(),
            plane.format()
        );
    }
    Ok(())
}

fn gray(plane: &ImagePlane, pixels: Vec<u8>) -> Result<GrayImage> {
    let (width, height) = plane.dimensions();
    GrayImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("{:?} buffer does not match its dimensions", plane.role()))
}
