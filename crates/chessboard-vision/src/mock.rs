use image::{DynamicImage, GrayImage, Luma};
use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::chessboard::ChessboardPattern;
use crate::geometry::{rodrigues, Distortion, Pinhole};
use crate::image_io::{encode_png, frame_to_image};
use crate::{
    CameraIntrinsics, CameraProperties, CameraSource, Error, Frame, MimeType, NamedImage,
    PixelFormat, Result,
};

const DARK: f64 = 30.0;
const LIGHT: f64 = 220.0;
const BACKGROUND: f64 = 100.0;
const SUPERSAMPLE: u32 = 2;

/// A chessboard seen by a pinhole camera. Also the attribute schema of the
/// `fake-chessboard` camera model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardScene {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Vec<f64>,
    /// Inner corners `[cols, rows]`.
    pub pattern_size: [usize; 2],
    pub square_size_mm: f64,
    /// Board-to-camera rotation vector.
    pub rvec: [f64; 3],
    /// Board origin in the camera frame, millimetres.
    pub tvec: [f64; 3],
}

impl Default for BoardScene {
    fn default() -> Self {
        Self {
            intrinsics: CameraIntrinsics {
                width_px: 640,
                height_px: 480,
                fx: 600.0,
                fy: 600.0,
                cx: 319.5,
                cy: 239.5,
            },
            distortion: Vec::new(),
            pattern_size: [9, 6],
            square_size_mm: 30.0,
            rvec: [0.2, -0.15, 0.05],
            tvec: [-120.0, -75.0, 500.0],
        }
    }
}

impl BoardScene {
    pub fn pattern(&self) -> Result<ChessboardPattern> {
        ChessboardPattern::new(self.pattern_size[0], self.pattern_size[1])
    }

    pub fn camera(&self) -> Result<Pinhole> {
        Ok(Pinhole::new(&self.intrinsics, Distortion::from_slice(&self.distortion)?))
    }

    pub fn with_pose(mut self, rvec: [f64; 3], tvec: [f64; 3]) -> Self {
        self.rvec = rvec;
        self.tvec = tvec;
        self
    }

    /// Shade of the board plane at `(x, y)` mm: a checkerboard of
    /// `(cols + 1) x (rows + 1)` squares around the inner corners, a one
    /// square white border, then background.
    fn shade(&self, x: f64, y: f64) -> f64 {
        let s = self.square_size_mm;
        let [cols, rows] = self.pattern_size;
        let (i, j) = ((x / s).floor() as i64 + 1, (y / s).floor() as i64 + 1);
        let (nx, ny) = (cols as i64 + 1, rows as i64 + 1);
        if (0..nx).contains(&i) && (0..ny).contains(&j) {
            if (i + j) % 2 == 0 {
                DARK
            } else {
                LIGHT
            }
        } else if (-1..=nx).contains(&i) && (-1..=ny).contains(&j) {
            LIGHT
        } else {
            BACKGROUND
        }
    }
}

/// Render `scene` as an 8-bit grayscale image, antialiased by supersampling.
pub fn render_chessboard(scene: &BoardScene) -> Result<GrayImage> {
    scene.pattern()?;
    if scene.square_size_mm <= 0.0 {
        return Err(Error::InvalidAttribute {
            name: "square_size_mm",
            reason: "must be positive".to_string(),
        });
    }
    let camera = scene.camera()?;
    let r = rodrigues(&Vector3::from(scene.rvec));
    let t = Vector3::from(scene.tvec);
    let normal: Vector3<f64> = r.column(2).into_owned();
    let plane_d = normal.dot(&t);
    let (w, h) = (scene.intrinsics.width_px, scene.intrinsics.height_px);
    if w == 0 || h == 0 {
        return Err(Error::InvalidAttribute {
            name: "intrinsics",
            reason: "image size must be non-zero".to_string(),
        });
    }

    let n = SUPERSAMPLE as f64;
    Ok(GrayImage::from_fn(w, h, |px, py| {
        let mut acc = 0.0;
        for sy in 0..SUPERSAMPLE {
            for sx in 0..SUPERSAMPLE {
                // Pixel centres sit on integer coordinates.
                let u = px as f64 - 0.5 + (sx as f64 + 0.5) / n;
                let v = py as f64 - 0.5 + (sy as f64 + 0.5) / n;
                let ray = camera.undistort_point(&Point2::new(u, v));
                let ray = Vector3::new(ray.x, ray.y, 1.0);
                let denom = normal.dot(&ray);
                let depth = plane_d / denom;
                acc += if denom.abs() < 1e-12 || depth <= 0.0 {
                    BACKGROUND
                } else {
                    let board = r.transpose() * (ray * depth - t);
                    scene.shade(board.x, board.y)
                };
            }
        }
        Luma([(acc / (n * n)).round().clamp(0.0, 255.0) as u8])
    }))
}

/// Camera that renders a synthetic chessboard, cycling through its scenes.
pub struct MockCamera {
    name: String,
    scenes: Vec<BoardScene>,
    counter: usize,
}

impl MockCamera {
    pub fn new(name: impl Into<String>, scene: BoardScene) -> Self {
        Self {
            name: name.into(),
            scenes: vec![scene],
            counter: 0,
        }
    }

    pub fn with_scenes(name: impl Into<String>, scenes: Vec<BoardScene>) -> Result<Self> {
        if scenes.is_empty() {
            return Err(Error::Camera("mock camera needs at least one scene".to_string()));
        }
        Ok(Self {
            name: name.into(),
            scenes,
            counter: 0,
        })
    }

    pub fn from_attributes(name: impl Into<String>, attributes: &Map<String, Value>) -> Result<Self> {
        let scene: BoardScene = serde_json::from_value(Value::Object(attributes.clone()))?;
        scene.pattern()?;
        Ok(Self::new(name, scene))
    }

    fn current(&self) -> &BoardScene {
        &self.scenes[self.counter % self.scenes.len()]
    }

    /// Next rendered frame as raw Gray8.
    pub fn read(&mut self) -> Result<Frame> {
        let img = render_chessboard(self.current())?;
        self.counter += 1;
        Ok(Frame {
            width: img.width(),
            height: img.height(),
            pixel_format: PixelFormat::Gray8,
            data: img.into_raw(),
            ts: Some(OffsetDateTime::now_utc()),
        })
    }
}

impl CameraSource for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn images(&mut self) -> Result<Vec<NamedImage>> {
        let frame = self.read()?;
        let data = encode_png(&frame_to_image(&frame)?)?;
        Ok(vec![NamedImage {
            source_name: self.name.clone(),
            mime_type: MimeType::Png,
            data,
            ts: frame.ts,
        }])
    }

    fn properties(&self) -> Result<CameraProperties> {
        let scene = self.current();
        Ok(CameraProperties {
            intrinsics: Some(scene.intrinsics),
            distortion: (!scene.distortion.is_empty()).then(|| scene.distortion.clone()),
        })
    }
}

/// Encoded PNG of `scene`, as a camera would deliver it.
pub fn render_chessboard_png(scene: &BoardScene) -> Result<Vec<u8>> {
    encode_png(&DynamicImage::ImageLuma8(render_chessboard(scene)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_io::decode_image;

    #[test]
    fn renders_board_in_the_middle() {
        let scene = BoardScene::default().with_pose([0.0, 0.0, 0.0], [-120.0, -75.0, 500.0]);
        let img = render_chessboard(&scene).unwrap();
        assert_eq!(img.dimensions(), (640, 480));
        // Board origin projects to the principal point minus the offset.
        let (u0, v0) = (319.5 - 144.0, 239.5 - 90.0);
        // First square (dark) lies up-left of the first inner corner.
        assert_eq!(img.get_pixel((u0 - 10.0) as u32, (v0 - 10.0) as u32)[0], DARK as u8);
        assert_eq!(img.get_pixel((u0 + 10.0) as u32, (v0 - 10.0) as u32)[0], LIGHT as u8);
        assert_eq!(img.get_pixel(2, 2)[0], BACKGROUND as u8);
    }

    #[test]
    fn camera_cycles_scenes_and_reports_properties() {
        let a = BoardScene::default();
        let b = BoardScene {
            distortion: vec![0.05],
            ..BoardScene::default()
        };
        let mut cam = MockCamera::with_scenes("cam", vec![a, b]).unwrap();
        assert!(cam.properties().unwrap().distortion.is_none());
        let images = cam.images().unwrap();
        assert_eq!(images[0].mime_type, MimeType::Png);
        let decoded = decode_image(&images[0].data).unwrap();
        assert_eq!(decoded.width(), 640);
        assert_eq!(cam.properties().unwrap().distortion, Some(vec![0.05]));
    }

    #[test]
    fn attributes_override_defaults() {
        let attrs = serde_json::json!({"pattern_size": [5, 4], "square_size_mm": 20.0});
        let cam = MockCamera::from_attributes("fake", attrs.as_object().unwrap()).unwrap();
        assert_eq!(cam.current().pattern_size, [5, 4]);
        assert_eq!(cam.current().intrinsics.width_px, 640);

        let bad = serde_json::json!({"pattern_size": [1, 4]});
        assert!(MockCamera::from_attributes("fake", bad.as_object().unwrap()).is_err());
    }
}
