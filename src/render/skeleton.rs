use image::{Rgb, RgbImage};

use super::palette::Palette;
use crate::{
    calibration::{Calibration, CameraKind},
    types::{JointConfidence, JointId, Skeleton},
};

pub const MARKER_RADIUS: i32 = 5;
const BONE_THICKNESS: i32 = 1;

pub const BONES: &[(JointId, JointId)] = &[
    (JointId::Pelvis, JointId::SpineNavel),
    (JointId::SpineNavel, JointId::SpineChest),
    (JointId::SpineChest, JointId::Neck),
    (JointId::Neck, JointId::Head),
    (JointId::Head, JointId::Nose),
    (JointId::Nose, JointId::EyeLeft),
    (JointId::EyeLeft, JointId::EarLeft),
    (JointId::Nose, JointId::EyeRight),
    (JointId::EyeRight, JointId::EarRight),
    (JointId::SpineChest, JointId::ClavicleLeft),
    (JointId::ClavicleLeft, JointId::ShoulderLeft),
    (JointId::ShoulderLeft, JointId::ElbowLeft),
    (JointId::ElbowLeft, JointId::WristLeft),
    (JointId::WristLeft, JointId::HandLeft),
    (JointId::HandLeft, JointId::HandTipLeft),
    (JointId::WristLeft, JointId::ThumbLeft),
    (JointId::SpineChest, JointId::ClavicleRight),
    (JointId::ClavicleRight, JointId::ShoulderRight),
    (JointId::ShoulderRight, JointId::ElbowRight),
    (JointId::ElbowRight, JointId::WristRight),
    (JointId::WristRight, JointId::HandRight),
    (JointId::HandRight, JointId::HandTipRight),
    (JointId::WristRight, JointId::ThumbRight),
    (JointId::Pelvis, JointId::HipLeft),
    (JointId::HipLeft, JointId::KneeLeft),
    (JointId::KneeLeft, JointId::AnkleLeft),
    (JointId::AnkleLeft, JointId::FootLeft),
    (JointId::Pelvis, JointId::HipRight),
    (JointId::HipRight, JointId::KneeRight),
    (JointId::KneeRight, JointId::AnkleRight),
    (JointId::AnkleRight, JointId::FootRight),
];

/// Draws every skeleton onto a colour-camera image.
pub fn draw_skeletons(
    image: &mut RgbImage,
    skeletons: &[Skeleton],
    calibration: &Calibration,
    palette: &Palette,
) {
    for skeleton in skeletons {
        let color = palette.for_body_id(skeleton.id);
        let projected: Vec<(JointId, JointConfidence, (f32, f32))> = skeleton
            .joints
            .iter()
            .filter_map(|joint| {
                calibration
                    .convert_3d_to_2d(joint.position, CameraKind::Depth, CameraKind::Color)
                    .map(|[x, y]| (joint.id, joint.confidence, (x, y)))
            })
            .collect();
        let find = |id: JointId| projected.iter().find(|(j, _, _)| *j == id).map(|p| p.2);

        for &(a, b) in BONES {
            if let (Some(pa), Some(pb)) = (find(a), find(b)) {
                draw_line(image, &pa, &pb, color, BONE_THICKNESS);
            }
        }

        for &(_, confidence, (x, y)) in &projected {
            let center = (x.round() as i32, y.round() as i32);
            if confidence >= JointConfidence::Medium {
                draw_circle(image, center, MARKER_RADIUS, color);
            } else {
                draw_ring(image, center, MARKER_RADIUS, color);
            }
        }
    }
}

fn draw_line(image: &mut RgbImage, p0: &(f32, f32), p1: &(f32, f32), color: Rgb<u8>, thickness: i32) {
    let (mut x0, mut y0) = (p0.0.round() as i32, p0.1.round() as i32);
    let (x1, y1) = (p1.0.round() as i32, p1.1.round() as i32);
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let radius = (thickness.max(1) - 1) / 2;

    loop {
        for ox in -radius..=radius {
            for oy in -radius..=radius {
                if ox.abs() + oy.abs() <= radius {
                    put_pixel_safe(image, x0 + ox, y0 + oy, color);
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_circle(image: &mut RgbImage, center: (i32, i32), radius: i32, color: Rgb<u8>) {
    let (cx, cy) = center;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_safe(image, cx + dx, cy + dy, color);
            }
        }
    }
}

/// One-pixel outline of [`draw_circle`].
fn draw_ring(image: &mut RgbImage, center: (i32, i32), radius: i32, color: Rgb<u8>) {
    let (cx, cy) = center;
    let inner = (radius - 1) * (radius - 1);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let d2 = dx * dx + dy * dy;
            if d2 > inner && d2 <= radius * radius {
                put_pixel_safe(image, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel_safe(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x < 0 || y < 0 {
        return;
    }
    let (ux, uy) = (x as u32, y as u32);
    if ux >= image.width() || uy >= image.height() {
        return;
    }
    image.put_pixel(ux, uy, color);
}
