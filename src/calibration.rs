use serde::{Deserialize, Serialize};

use crate::pipeline::device::{ColorResolution, DepthMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraKind {
    Depth,
    Color,
}

/// Pinhole intrinsics; pixel centres sit on integer coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    pub fn from_fov(width: u32, height: u32, hfov_deg: f32, vfov_deg: f32) -> Self {
        let fx = width as f32 / 2.0 / (hfov_deg.to_radians() / 2.0).tan();
        let fy = height as f32 / 2.0 / (vfov_deg.to_radians() / 2.0).tan();
        Self {
            width,
            height,
            fx,
            fy,
            cx: (width as f32 - 1.0) / 2.0,
            cy: (height as f32 - 1.0) / 2.0,
        }
    }

    /// Projects without checking the image bounds. `None` behind the camera.
    pub fn project_unbounded(&self, point: [f32; 3]) -> Option<[f32; 2]> {
        let [x, y, z] = point;
        if z <= 0.0 || !z.is_finite() {
            return None;
        }
        Some([self.fx * x / z + self.cx, self.fy * y / z + self.cy])
    }

    pub fn project(&self, point: [f32; 3]) -> Option<[f32; 2]> {
        let [u, v] = self.project_unbounded(point)?;
        let inside =
            u >= -0.5 && v >= -0.5 && u < self.width as f32 - 0.5 && v < self.height as f32 - 0.5;
        inside.then_some([u, v])
    }

    pub fn unproject(&self, pixel: [f32; 2], depth_mm: f32) -> [f32; 3] {
        let [u, v] = pixel;
        [
            (u - self.cx) / self.fx * depth_mm,
            (v - self.cy) / self.fy * depth_mm,
            depth_mm,
        ]
    }
}

/// Rigid transform, row-major rotation and millimetre translation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extrinsics {
    pub rotation: [f32; 9],
    pub translation: [f32; 3],
}

impl Extrinsics {
    #[cfg(test)]
    pub const IDENTITY: Extrinsics = Extrinsics {
        rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        translation: [0.0, 0.0, 0.0],
    };

    pub fn rotation_x(degrees: f32, translation: [f32; 3]) -> Self {
        let (s, c) = degrees.to_radians().sin_cos();
        Self {
            rotation: [1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c],
            translation,
        }
    }

    pub fn apply(&self, p: [f32; 3]) -> [f32; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + t[0],
            r[3] * p[0] + r[4] * p[1] + r[5] * p[2] + t[1],
            r[6] * p[0] + r[7] * p[1] + r[8] * p[2] + t[2],
        ]
    }

    pub fn inverse(&self) -> Self {
        let r = &self.rotation;
        let rt = [r[0], r[3], r[6], r[1], r[4], r[7], r[2], r[5], r[8]];
        let t = &self.translation;
        Self {
            rotation: rt,
            translation: [
                -(rt[0] * t[0] + rt[1] * t[1] + rt[2] * t[2]),
                -(rt[3] * t[0] + rt[4] * t[1] + rt[5] * t[2]),
                -(rt[6] * t[0] + rt[7] * t[1] + rt[8] * t[2]),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub depth_mode: DepthMode,
    pub color_resolution: ColorResolution,
    pub depth: Intrinsics,
    pub color: Intrinsics,
    pub depth_to_color: Extrinsics,
}

impl Calibration {
    /// Ideal pinhole calibration for the given modes: nominal fields of view,
    /// a 32 mm baseline and the colour camera tilted 6° down.
    pub fn nominal(depth_mode: DepthMode, color_resolution: ColorResolution) -> Self {
        let (dw, dh) = depth_mode.dimensions();
        let (dh_fov, dv_fov) = depth_mode.field_of_view();
        let (cw, ch) = color_resolution.dimensions();
        let color_vfov = if cw * 3 == ch * 4 { 74.3 } else { 59.0 };
        Self {
            depth_mode,
            color_resolution,
            depth: Intrinsics::from_fov(dw, dh, dh_fov, dv_fov),
            color: Intrinsics::from_fov(cw, ch, 90.0, color_vfov),
            depth_to_color: Extrinsics::rotation_x(-6.0, [-32.0, -2.0, 4.0]),
        }
    }

    pub fn camera(&self, kind: CameraKind) -> &Intrinsics {
        match kind {
            CameraKind::Depth => &self.depth,
            CameraKind::Color => &self.color,
        }
    }

    pub fn convert_3d_to_3d(
        &self,
        point: [f32; 3],
        source: CameraKind,
        target: CameraKind,
    ) -> [f32; 3] {
        match (source, target) {
            (CameraKind::Depth, CameraKind::Color) => self.depth_to_color.apply(point),
            (CameraKind::Color, CameraKind::Depth) => self.depth_to_color.inverse().apply(point),
            _ => point,
        }
    }

    /// `None` when the point lands outside the target camera's image.
    pub fn convert_3d_to_2d(
        &self,
        point: [f32; 3],
        source: CameraKind,
        target: CameraKind,
    ) -> Option<[f32; 2]> {
        let moved = self.convert_3d_to_3d(point, source, target);
        self.camera(target).project(moved)
    }

    pub fn convert_2d_to_3d(
        &self,
        pixel: [f32; 2],
        depth_mm: f32,
        source: CameraKind,
        target: CameraKind,
    ) -> Option<[f32; 3]> {
        if depth_mm <= 0.0 {
            return None;
        }
        let point = self.camera(source).unproject(pixel, depth_mm);
        Some(self.convert_3d_to_3d(point, source, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-2)
    }

    #[test]
    fn nominal_sizes_follow_modes() {
        let calibration = Calibration::nominal(DepthMode::NfovUnbinned, ColorResolution::R720p);
        assert_eq!((calibration.depth.width, calibration.depth.height), (640, 576));
        assert_eq!((calibration.color.width, calibration.color.height), (1280, 720));
    }

    #[test]
    fn extrinsic_inverse_undoes_transform() {
        let extrinsics = Extrinsics::rotation_x(-6.0, [-32.0, -2.0, 4.0]);
        let p = [120.0, -40.0, 1500.0];
        assert!(approx(extrinsics.inverse().apply(extrinsics.apply(p)), p));
    }

    #[test]
    fn optical_axis_projects_to_principal_point() {
        let calibration = Calibration::nominal(DepthMode::NfovUnbinned, ColorResolution::R720p);
        let pixel = calibration
            .convert_3d_to_2d([0.0, 0.0, 2000.0], CameraKind::Depth, CameraKind::Depth)
            .unwrap();
        assert!((pixel[0] - calibration.depth.cx).abs() < 1e-3);
        assert!((pixel[1] - calibration.depth.cy).abs() < 1e-3);
    }

    #[test]
    fn points_outside_view_do_not_project() {
        let calibration = Calibration::nominal(DepthMode::NfovUnbinned, ColorResolution::R720p);
        assert!(
            calibration
                .convert_3d_to_2d([5000.0, 0.0, 1000.0], CameraKind::Depth, CameraKind::Color)
                .is_none()
        );
        assert!(
            calibration
                .convert_3d_to_2d([0.0, 0.0, -1000.0], CameraKind::Depth, CameraKind::Color)
                .is_none()
        );
    }

    #[test]
    fn zero_depth_has_no_3d_point() {
        let calibration = Calibration::nominal(DepthMode::NfovUnbinned, ColorResolution::R720p);
        assert!(
            calibration
                .convert_2d_to_3d([10.0, 10.0], 0.0, CameraKind::Depth, CameraKind::Depth)
                .is_none()
        );
    }
}
