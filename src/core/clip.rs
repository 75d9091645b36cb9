use crate::core::footprint::Footprint;
use crate::types::{AlignedRaster, LakeError, LakeResult, PixelWindow, RasterGrid};
use geo::{Contains, Point};
use ndarray::{s, Zip};

/// Fraction of a pixel by which a footprint edge may overshoot a pixel
/// boundary without pulling in the next row or column
const EDGE_TOLERANCE: f64 = 1e-6;

/// Crops rasters to the bounding window of a footprint and blanks pixels
/// whose centers fall outside a non-rectangular footprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct FootprintClipper;

impl FootprintClipper {
    pub fn new() -> Self {
        Self
    }

    /// Pixel window of `grid` covering the footprint's bounding box, limited
    /// to the grid extent
    pub fn window_for(&self, grid: &RasterGrid, footprint: &Footprint) -> LakeResult<PixelWindow> {
        if !footprint.crs.same_as(&grid.crs) {
            return Err(LakeError::Reprojection(format!(
                "Clip footprint is in {}, raster is in {}",
                footprint.crs, grid.crs
            )));
        }
        let bbox = match footprint.bounding_box() {
            Some(bbox) if !footprint.is_empty() => bbox,
            _ => return Err(LakeError::NoOverlap("clip footprint is empty".to_string())),
        };

        let mut c0 = f64::INFINITY;
        let mut r0 = f64::INFINITY;
        let mut c1 = f64::NEG_INFINITY;
        let mut r1 = f64::NEG_INFINITY;
        for (x, y) in [
            (bbox.min_x, bbox.min_y),
            (bbox.min_x, bbox.max_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
        ] {
            let (c, r) = grid
                .transform
                .world_to_pixel(x, y)
                .ok_or_else(|| LakeError::Metadata("Raster geotransform is not invertible".to_string()))?;
            c0 = c0.min(c);
            r0 = r0.min(r);
            c1 = c1.max(c);
            r1 = r1.max(r);
        }
        let col_off = (c0 + EDGE_TOLERANCE).floor() as isize;
        let row_off = (r0 + EDGE_TOLERANCE).floor() as isize;
        let col_end = (c1 - EDGE_TOLERANCE).ceil() as isize;
        let row_end = (r1 - EDGE_TOLERANCE).ceil() as isize;
        if col_end <= col_off || row_end <= row_off {
            return Err(LakeError::NoOverlap("clip footprint is thinner than one pixel".to_string()));
        }

        PixelWindow::new(col_off, row_off, (col_end - col_off) as usize, (row_end - row_off) as usize)
            .clamp_to(grid.width, grid.height)
            .ok_or_else(|| LakeError::NoOverlap("clip footprint lies outside the raster".to_string()))
    }

    /// Crop without resampling: the output origin is a pixel corner of the
    /// input grid and the pixel size is unchanged.
    pub fn clip(&self, raster: &AlignedRaster, footprint: &Footprint) -> LakeResult<AlignedRaster> {
        let window = self.window_for(&raster.grid, footprint)?;
        let (r0, c0) = (window.row_off as usize, window.col_off as usize);
        let mut data = raster
            .data
            .slice(s![r0..r0 + window.height, c0..c0 + window.width])
            .to_owned();
        let grid = RasterGrid {
            crs: raster.grid.crs.clone(),
            transform: raster.grid.transform.shifted(window.col_off, window.row_off),
            width: window.width,
            height: window.height,
        };

        if !footprint.is_rectangular() {
            let nodata = raster.nodata;
            let transform = grid.transform;
            let geometry = &footprint.geometry;
            Zip::indexed(&mut data).par_for_each(|(r, c), value| {
                let (x, y) = transform.pixel_to_world(c as f64 + 0.5, r as f64 + 0.5);
                if !geometry.contains(&Point::new(x, y)) {
                    *value = nodata;
                }
            });
        }

        log::debug!(
            "Clipped {}x{} raster to window {:?}",
            raster.grid.width,
            raster.grid.height,
            window
        );
        AlignedRaster::new(data, grid, raster.nodata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, CrsDescriptor, GeoTransform};
    use geo::{polygon, MultiPolygon};
    use ndarray::Array2;

    fn raster() -> AlignedRaster {
        let grid = RasterGrid {
            crs: CrsDescriptor::from_epsg(32622),
            transform: GeoTransform::north_up(0.0, 10.0, 1.0, -1.0),
            width: 10,
            height: 10,
        };
        let data = Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as f32);
        AlignedRaster::new(data, grid, -9999.0).unwrap()
    }

    #[test]
    fn test_clip_to_aligned_box() {
        let fp = Footprint::from_bbox(&BoundingBox::new(2.0, 3.0, 6.0, 8.0), CrsDescriptor::from_epsg(32622));
        let clipped = FootprintClipper::new().clip(&raster(), &fp).unwrap();
        assert_eq!(clipped.shape(), (5, 4));
        assert_eq!(clipped.grid.transform, GeoTransform::north_up(2.0, 8.0, 1.0, -1.0));
        assert_eq!(clipped.data[[0, 0]], 22.0);
        assert_eq!(clipped.data[[4, 3]], 65.0);
    }

    #[test]
    fn test_clip_never_shifts_origin_off_grid() {
        let fp = Footprint::from_bbox(&BoundingBox::new(2.4, 3.3, 5.6, 7.7), CrsDescriptor::from_epsg(32622));
        let clipped = FootprintClipper::new().clip(&raster(), &fp).unwrap();
        let gt = clipped.grid.transform;
        assert_eq!((gt.top_left_x, gt.top_left_y), (2.0, 8.0));
        assert_eq!((gt.pixel_width, gt.pixel_height), (1.0, -1.0));
        assert_eq!(clipped.shape(), (5, 4));
    }

    #[test]
    fn test_clip_masks_outside_polygon() {
        let triangle = polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)];
        let fp = Footprint {
            geometry: MultiPolygon::new(vec![triangle]),
            crs: CrsDescriptor::from_epsg(32622),
        };
        let clipped = FootprintClipper::new().clip(&raster(), &fp).unwrap();
        assert_eq!(clipped.shape(), (10, 10));
        // Bottom-left corner is inside, top-right corner outside
        assert_eq!(clipped.data[[9, 0]], 90.0);
        assert_eq!(clipped.data[[0, 9]], -9999.0);
    }

    #[test]
    fn test_clip_outside_raster_is_no_overlap() {
        let fp = Footprint::from_bbox(&BoundingBox::new(20.0, 20.0, 30.0, 30.0), CrsDescriptor::from_epsg(32622));
        let result = FootprintClipper::new().clip(&raster(), &fp);
        assert!(matches!(result, Err(LakeError::NoOverlap(_))));
    }

    #[test]
    fn test_clip_rejects_foreign_crs() {
        let fp = Footprint::from_bbox(&BoundingBox::new(2.0, 3.0, 6.0, 8.0), CrsDescriptor::from_epsg(3413));
        let result = FootprintClipper::new().clip(&raster(), &fp);
        assert!(matches!(result, Err(LakeError::Reprojection(_))));
    }
}
