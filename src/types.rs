use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-band elevation or spectral raster values
pub type RasterImage = Array2<f32>;

/// Binary label raster (true = lake)
pub type MaskImage = Array2<bool>;

/// Coordinate reference system descriptor (authority code + definition)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrsDescriptor {
    pub authority: Option<String>,
    pub code: Option<u32>,
    /// WKT or any user-input string GDAL understands
    pub definition: String,
}

impl CrsDescriptor {
    pub fn from_epsg(code: u32) -> Self {
        Self {
            authority: Some("EPSG".to_string()),
            code: Some(code),
            definition: format!("EPSG:{}", code),
        }
    }

    pub fn from_definition<S: Into<String>>(definition: S) -> Self {
        let definition = definition.into();
        let (authority, code) = match definition.trim().split_once(':') {
            Some((auth, code)) if auth.eq_ignore_ascii_case("epsg") => {
                match code.trim().parse::<u32>() {
                    Ok(code) => (Some("EPSG".to_string()), Some(code)),
                    Err(_) => (None, None),
                }
            }
            _ => (None, None),
        };
        Self { authority, code, definition }
    }

    pub fn epsg(&self) -> Option<u32> {
        match self.authority.as_deref() {
            Some(auth) if auth.eq_ignore_ascii_case("epsg") => self.code,
            _ => None,
        }
    }

    /// Two descriptors name the same system when their authority codes agree,
    /// or, lacking codes, when their definitions are textually identical.
    pub fn same_as(&self, other: &CrsDescriptor) -> bool {
        match (&self.authority, self.code, &other.authority, other.code) {
            (Some(a1), Some(c1), Some(a2), Some(c2)) => a1.eq_ignore_ascii_case(a2) && c1 == c2,
            _ => self.definition.trim() == other.definition.trim(),
        }
    }
}

impl PartialEq for CrsDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Display for CrsDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.authority, self.code) {
            (Some(auth), Some(code)) => write!(f, "{}:{}", auth, code),
            _ => {
                let short: String = self.definition.chars().take(48).collect();
                write!(f, "{}", short)
            }
        }
    }
}

/// Axis-aligned extent in projected (or geographic) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: max_x.max(min_x),
            max_y: max_y.max(min_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Intersection with positive area; boxes that only touch yield `None`.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);
        if max_x > min_x && max_y > min_y {
            Some(BoundingBox { min_x, min_y, max_x, max_y })
        } else {
            None
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn expand(&self, distance: f64) -> BoundingBox {
        BoundingBox::new(
            self.min_x - distance,
            self.min_y - distance,
            self.max_x + distance,
            self.max_y + distance,
        )
    }
}

/// Affine pixel-to-world transform, GDAL coefficient order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_rotated(&self) -> bool {
        self.rotation_x != 0.0 || self.rotation_y != 0.0
    }

    /// World coordinate of a fractional pixel position (col, row)
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position (col, row) of a world coordinate
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        Some((col, row))
    }

    /// Transform of the sub-grid whose top-left pixel is (col, row) of this grid
    pub fn shifted(&self, col: isize, row: isize) -> GeoTransform {
        let (x, y) = self.pixel_to_world(col as f64, row as f64);
        GeoTransform {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }

    pub fn approx_eq(&self, other: &GeoTransform, eps: f64) -> bool {
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= eps)
    }

    /// Extent covered by a raster of the given size
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let mut bbox = BoundingBox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }
}

/// Rectangular pixel window; offsets may fall outside the raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelWindow {
    pub col_off: isize,
    pub row_off: isize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn new(col_off: isize, row_off: isize, width: usize, height: usize) -> Self {
        Self { col_off, row_off, width, height }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Part of the window inside a raster of the given size, if any
    pub fn clamp_to(&self, width: usize, height: usize) -> Option<PixelWindow> {
        let c0 = self.col_off.max(0);
        let r0 = self.row_off.max(0);
        let c1 = (self.col_off + self.width as isize).min(width as isize);
        let r1 = (self.row_off + self.height as isize).min(height as isize);
        if c1 <= c0 || r1 <= r0 {
            return None;
        }
        Some(PixelWindow::new(c0, r0, (c1 - c0) as usize, (r1 - r0) as usize))
    }
}

/// Metadata of one physical (or composed) raster; immutable once read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterSource {
    pub id: String,
    pub crs: CrsDescriptor,
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub nodata: Option<f64>,
}

impl RasterSource {
    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }

    pub fn grid(&self) -> RasterGrid {
        RasterGrid {
            crs: self.crs.clone(),
            transform: self.transform,
            width: self.width,
            height: self.height,
        }
    }
}

/// CRS + transform + size: everything needed to compare two pixel grids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub crs: CrsDescriptor,
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

impl RasterGrid {
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }

    pub fn matches(&self, other: &RasterGrid, eps: f64) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.crs.same_as(&other.crs)
            && self.transform.approx_eq(&other.transform, eps)
    }

    /// Explain the first difference between two grids, for error reports
    pub fn describe_mismatch(&self, other: &RasterGrid, eps: f64) -> Option<String> {
        if self.shape() != other.shape() {
            return Some(format!("shape {:?} vs {:?}", self.shape(), other.shape()));
        }
        if !self.crs.same_as(&other.crs) {
            return Some(format!("crs {} vs {}", self.crs, other.crs));
        }
        if !self.transform.approx_eq(&other.transform, eps) {
            return Some(format!(
                "transform {:?} vs {:?}",
                self.transform.to_gdal(),
                other.transform.to_gdal()
            ));
        }
        None
    }
}

/// Single-band raster on a known grid, produced by alignment or clipping
#[derive(Debug, Clone)]
pub struct AlignedRaster {
    pub data: RasterImage,
    pub grid: RasterGrid,
    pub nodata: f32,
}

impl AlignedRaster {
    pub fn new(data: RasterImage, grid: RasterGrid, nodata: f32) -> LakeResult<Self> {
        if data.dim() != grid.shape() {
            return Err(LakeError::GridMismatch(format!(
                "pixel buffer {:?} does not match grid shape {:?}",
                data.dim(),
                grid.shape()
            )));
        }
        Ok(Self { data, grid, nodata })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn is_nodata(&self, value: f32) -> bool {
        value.is_nan() || value == self.nodata
    }

    /// Copy of the pixel buffer with nodata replaced by NaN
    pub fn to_nan_masked(&self) -> RasterImage {
        let nodata = self.nodata;
        self.data.mapv(|v| if v == nodata { f32::NAN } else { v })
    }

    /// Fraction of pixels holding real data
    pub fn coverage(&self) -> f64 {
        let total = self.data.len();
        if total == 0 {
            return 0.0;
        }
        let valid = self.data.iter().filter(|v| !self.is_nodata(**v)).count();
        valid as f64 / total as f64
    }
}

/// Binary label raster on a known grid
#[derive(Debug, Clone)]
pub struct MaskRaster {
    pub data: MaskImage,
    pub grid: RasterGrid,
}

impl MaskRaster {
    pub fn positive_count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    pub fn to_u8(&self) -> Array2<u8> {
        self.data.mapv(u8::from)
    }
}

/// Error types for raster preparation
#[derive(Debug, thiserror::Error)]
pub enum LakeError {
    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("No spatial overlap: {0}")]
    NoOverlap(String),

    #[error("Reprojection error: {0}")]
    Reprojection(String),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LakeError {
    /// An empty intersection is an expected outcome: skip the scene, keep the run going.
    pub fn is_skippable(&self) -> bool {
        matches!(self, LakeError::NoOverlap(_))
    }
}

/// Result type for preparation stages
pub type LakeResult<T> = Result<T, LakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_world_roundtrip_with_rotation() {
        let gt = GeoTransform {
            top_left_x: 500000.0,
            pixel_width: 10.0,
            rotation_x: 0.5,
            top_left_y: 7600000.0,
            rotation_y: -0.25,
            pixel_height: -10.0,
        };
        let (x, y) = gt.pixel_to_world(12.5, 40.0);
        let (col, row) = gt.world_to_pixel(x, y).unwrap();
        assert!((col - 12.5).abs() < 1e-9);
        assert!((row - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_touching_boxes_do_not_intersect() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(10.0, 0.0, 20.0, 10.0);
        assert!(a.intersection(&b).is_none());

        let c = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
        let inter = a.intersection(&c).unwrap();
        assert_eq!(inter, BoundingBox::new(5.0, 5.0, 10.0, 10.0));
    }

    #[test]
    fn test_crs_equality_by_code() {
        let a = CrsDescriptor::from_epsg(32622);
        let b = CrsDescriptor::from_definition("epsg:32622");
        assert_eq!(a, b);
        assert_ne!(a, CrsDescriptor::from_epsg(3413));
        assert_eq!(b.epsg(), Some(32622));
    }

    #[test]
    fn test_window_clamp() {
        let w = PixelWindow::new(-5, 90, 20, 20);
        let clamped = w.clamp_to(100, 100).unwrap();
        assert_eq!(clamped, PixelWindow::new(0, 90, 15, 10));
        assert!(PixelWindow::new(100, 0, 5, 5).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_aligned_raster_rejects_wrong_shape() {
        let grid = RasterGrid {
            crs: CrsDescriptor::from_epsg(32622),
            transform: GeoTransform::north_up(0.0, 100.0, 10.0, -10.0),
            width: 10,
            height: 10,
        };
        let result = AlignedRaster::new(Array2::zeros((9, 10)), grid, -9999.0);
        assert!(matches!(result, Err(LakeError::GridMismatch(_))));
    }
}
