use std::convert::TryFrom;

use anyhow::{Context, Result, anyhow, bail};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::{ImagePlane, PixelFormat};

#[derive(Debug)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Deep-copies a colour plane of any supported layout into packed RGBA.
pub fn convert_color_plane(plane: &ImagePlane) -> Result<RgbaFrame> {
    let (width, height) = plane.dimensions();
    let data = plane.data();
    let stride = u32::try_from(plane.stride()).map_err(|_| anyhow!("stride does not fit u32"))?;

    let (rgba, width, height) = match plane.format() {
        PixelFormat::Nv12 => (nv12_to_rgba(data, width, height, stride)?, width, height),
        PixelFormat::Yuy2 => (yuyv_to_rgba(data, width, height, stride)?, width, height),
        PixelFormat::Mjpg => mjpeg_to_rgba(data)?,
        PixelFormat::Bgra32 => (bgra_to_rgba(&plane.packed_data(), width, height)?, width, height),
        other => bail!("{other:?} plane is not a colour image"),
    };

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}

/// Returns a BGRA32 plane suitable for the transformer, decoding when the
/// source is compressed or YUV.
pub fn to_bgra_plane(plane: &ImagePlane) -> Result<ImagePlane> {
    if plane.format() == PixelFormat::Bgra32 {
        let (width, height) = plane.dimensions();
        PixelFormat::Bgra32
            .check_layout(width, height, plane.stride(), plane.data().len())
            .context("BGRA plane cannot be passed through")?;
        return Ok(plane.clone());
    }

    let mut frame = convert_color_plane(plane)?;
    frame.rgba.par_chunks_exact_mut(4).for_each(|px| px.swap(0, 2));
    Ok(plane.derive(
        plane.role(),
        PixelFormat::Bgra32,
        frame.width,
        frame.height,
        frame.rgba,
    ))
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32, stride: u32) -> Result<Vec<u8>> {
    let y_plane_len = stride as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;

    if data.len() < y_plane_len + uv_plane_len {
        return Err(anyhow!(
            "NV12 buffer too small: got {}, expected {}",
            data.len(),
            y_plane_len + uv_plane_len
        ));
    }

    let y_plane = &data[..y_plane_len];
    let uv_plane = &data[y_plane_len..y_plane_len + uv_plane_len];
    let mut rgba = vec![0u8; width as usize * height as usize * 4];

    let image = YuvBiPlanarImage {
        y_plane,
        y_stride: stride,
        uv_plane,
        uv_stride: stride,
        width,
        height,
    };

    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12→RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32, stride: u32) -> Result<Vec<u8>> {
    let expected_len = stride as usize * height as usize;
    if data.len() < expected_len {
        return Err(anyhow!(
            "YUY2 buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = vec![0u8; (width as usize * height as usize) * 4];
    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: stride,
        width,
        height,
    };

    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUY2→RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn mjpeg_to_rgba(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder reported no image info"))?;
    let width = u32::try_from(info.width).map_err(|_| anyhow!("MJPEG width does not fit u32"))?;
    let height =
        u32::try_from(info.height).map_err(|_| anyhow!("MJPEG height does not fit u32"))?;
    let expected_len = width as usize * height as usize * 4;
    if rgba.len() < expected_len {
        return Err(anyhow!(
            "MJPEG decode produced too few bytes: got {}, expected {}",
            rgba.len(),
            expected_len
        ));
    }

    Ok((rgba, width, height))
}

fn bgra_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 4;
    if data.len() < expected_len {
        return Err(anyhow!(
            "BGRA buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = data[..expected_len].to_vec();
    rgba.par_chunks_exact_mut(4).for_each(|px| px.swap(0, 2));
    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};

    use super::*;
    use crate::{ledger::HandleLedger, types::PlaneRole};

    #[test]
    fn bgra_is_swizzled_to_rgba() {
        let ledger = HandleLedger::new();
        let plane = ImagePlane::packed(
            &ledger,
            PlaneRole::Color,
            PixelFormat::Bgra32,
            1,
            1,
            vec![10, 20, 30, 255],
        );
        let frame = convert_color_plane(&plane).unwrap();
        assert_eq!(frame.rgba, vec![30, 20, 10, 255]);
    }

    #[test]
    fn mjpeg_plane_decodes_to_its_own_size() {
        let (width, height) = (16u32, 8u32);
        let rgb = vec![200u8; (width * height * 3) as usize];
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 95)
            .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
            .unwrap();

        let ledger = HandleLedger::new();
        let plane = ImagePlane::packed(
            &ledger,
            PlaneRole::Color,
            PixelFormat::Mjpg,
            width,
            height,
            jpeg,
        );
        let bgra = to_bgra_plane(&plane).unwrap();
        assert_eq!(bgra.format(), PixelFormat::Bgra32);
        assert_eq!(bgra.dimensions(), (width, height));
        assert!(bgra.data()[..3].iter().all(|&v| v.abs_diff(200) <= 3));
        assert_eq!(bgra.data()[3], 255);
    }

    #[test]
    fn neutral_nv12_is_grey() {
        let (width, height) = (4u32, 2u32);
        let mut data = vec![128u8; (width * height) as usize];
        data.extend(vec![128u8; (width * height / 2) as usize]);

        let ledger = HandleLedger::new();
        let plane = ImagePlane::packed(
            &ledger,
            PlaneRole::Color,
            PixelFormat::Nv12,
            width,
            height,
            data,
        );
        let frame = convert_color_plane(&plane).unwrap();
        assert_eq!(frame.rgba.len(), (width * height * 4) as usize);
        assert!(frame.rgba.chunks_exact(4).all(|px| px[0].abs_diff(128) <= 2));
    }

    #[test]
    fn short_bgra_plane_is_refused() {
        let ledger = HandleLedger::new();
        let plane = ImagePlane::packed(
            &ledger,
            PlaneRole::Color,
            PixelFormat::Bgra32,
            8,
            6,
            vec![0; 16],
        );
        assert!(to_bgra_plane(&plane).is_err());
    }

    #[test]
    fn depth_is_not_a_colour_plane() {
        let ledger = HandleLedger::new();
        let plane = ImagePlane::from_u16(
            &ledger,
            PlaneRole::Depth,
            PixelFormat::Depth16,
            1,
            1,
            &[1000],
        );
        assert!(convert_color_plane(&plane).is_err());
    }
}
