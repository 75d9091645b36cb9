use crate::config::{PipelineConfig, ResamplingMethod};
use crate::core::crs::{transform_bounds, ReferenceSystemEngine};
use crate::io::raster::RasterRead;
use crate::types::{
    AlignedRaster, BoundingBox, GeoTransform, LakeError, LakeResult, PixelWindow, RasterGrid, RasterImage,
};
use ndarray::{s, Array2};
use rayon::prelude::*;

/// Rows resampled per parallel work unit
const ROW_BAND: usize = 64;

/// Edge points per side when projecting the destination extent
const BOUNDS_DENSIFY: usize = 21;

/// Extra source pixels read around the needed window (cubic kernel reach)
const WINDOW_MARGIN: isize = 2;

/// Source pixels read into memory for one alignment
struct SourceBlock {
    data: RasterImage,
    window: PixelWindow,
    nodata: Option<f32>,
}

impl SourceBlock {
    /// Value at block pixel (col, row), `None` when outside or nodata
    fn get(&self, col: isize, row: isize) -> Option<f32> {
        let (h, w) = self.data.dim();
        if col < 0 || row < 0 || col >= w as isize || row >= h as isize {
            return None;
        }
        let v = self.data[[row as usize, col as usize]];
        if v.is_nan() || self.nodata == Some(v) {
            None
        } else {
            Some(v)
        }
    }

    /// Sample at fractional source pixel coordinates; pixel `i` spans `[i, i + 1)`
    fn sample(&self, method: ResamplingMethod, col: f64, row: f64) -> Option<f32> {
        let col = col - self.window.col_off as f64;
        let row = row - self.window.row_off as f64;
        // The pixel under the point must itself be valid source coverage
        let center = self.get(col.floor() as isize, row.floor() as isize)?;
        match method {
            ResamplingMethod::Nearest => Some(center),
            ResamplingMethod::Bilinear => self.bilinear(col, row),
            ResamplingMethod::Cubic => self.cubic(col, row).or_else(|| self.bilinear(col, row)),
        }
    }

    /// Bilinear over the four surrounding centers, renormalised over valid neighbours
    fn bilinear(&self, col: f64, row: f64) -> Option<f32> {
        let u = col - 0.5;
        let v = row - 0.5;
        let x0 = u.floor();
        let y0 = v.floor();
        let dx = u - x0;
        let dy = v - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);

        let neighbours = [
            (x0, y0, (1.0 - dx) * (1.0 - dy)),
            (x0 + 1, y0, dx * (1.0 - dy)),
            (x0, y0 + 1, (1.0 - dx) * dy),
            (x0 + 1, y0 + 1, dx * dy),
        ];
        let mut sum = 0.0;
        let mut weight = 0.0;
        for (x, y, w) in neighbours {
            if w <= 0.0 {
                continue;
            }
            if let Some(value) = self.get(x, y) {
                sum += value as f64 * w;
                weight += w;
            }
        }
        if weight > 0.0 {
            Some((sum / weight) as f32)
        } else {
            None
        }
    }

    /// Keys cubic convolution (a = -0.5); `None` if any of the 16 taps is missing
    fn cubic(&self, col: f64, row: f64) -> Option<f32> {
        let u = col - 0.5;
        let v = row - 0.5;
        let x0 = u.floor();
        let y0 = v.floor();
        let wx = cubic_weights(u - x0);
        let wy = cubic_weights(v - y0);
        let (x0, y0) = (x0 as isize, y0 as isize);

        let mut sum = 0.0;
        for (j, wyj) in wy.iter().enumerate() {
            for (i, wxi) in wx.iter().enumerate() {
                let value = self.get(x0 - 1 + i as isize, y0 - 1 + j as isize)?;
                sum += value as f64 * wxi * wyj;
            }
        }
        Some(sum as f32)
    }
}

fn cubic_weights(t: f64) -> [f64; 4] {
    const A: f64 = -0.5;
    let kernel = |x: f64| {
        let x = x.abs();
        if x <= 1.0 {
            (A + 2.0) * x.powi(3) - (A + 3.0) * x.powi(2) + 1.0
        } else if x < 2.0 {
            A * x.powi(3) - 5.0 * A * x.powi(2) + 8.0 * A * x - 4.0 * A
        } else {
            0.0
        }
    };
    [kernel(1.0 + t), kernel(t), kernel(1.0 - t), kernel(2.0 - t)]
}

/// Source pixel window covering a box in source CRS coordinates, with margin
fn source_window(transform: &GeoTransform, bbox: &BoundingBox) -> LakeResult<PixelWindow> {
    let corners = [
        (bbox.min_x, bbox.min_y),
        (bbox.min_x, bbox.max_y),
        (bbox.max_x, bbox.min_y),
        (bbox.max_x, bbox.max_y),
    ];
    let mut c0 = f64::INFINITY;
    let mut r0 = f64::INFINITY;
    let mut c1 = f64::NEG_INFINITY;
    let mut r1 = f64::NEG_INFINITY;
    for (x, y) in corners {
        let (c, r) = transform
            .world_to_pixel(x, y)
            .ok_or_else(|| LakeError::Metadata("Source geotransform is not invertible".to_string()))?;
        c0 = c0.min(c);
        r0 = r0.min(r);
        c1 = c1.max(c);
        r1 = r1.max(r);
    }
    let col_off = c0.floor() as isize - WINDOW_MARGIN;
    let row_off = r0.floor() as isize - WINDOW_MARGIN;
    let col_end = c1.ceil() as isize + WINDOW_MARGIN;
    let row_end = r1.ceil() as isize + WINDOW_MARGIN;
    Ok(PixelWindow::new(
        col_off,
        row_off,
        (col_end - col_off).max(1) as usize,
        (row_end - row_off).max(1) as usize,
    ))
}

/// Warps any [`RasterRead`] onto a destination grid, pixel for pixel
pub struct GridAligner<'a> {
    engine: &'a dyn ReferenceSystemEngine,
    method: ResamplingMethod,
    nodata: f32,
}

impl<'a> GridAligner<'a> {
    pub fn new(engine: &'a dyn ReferenceSystemEngine, config: &PipelineConfig) -> Self {
        Self {
            engine,
            method: config.resampling,
            nodata: config.elevation_nodata,
        }
    }

    pub fn with_method(mut self, method: ResamplingMethod) -> Self {
        self.method = method;
        self
    }

    /// Resample `band` of `source` onto `target`. The result carries the
    /// target grid verbatim; destination pixels without source coverage get
    /// the configured nodata value.
    pub fn align(&self, source: &dyn RasterRead, band: usize, target: &RasterGrid) -> LakeResult<AlignedRaster> {
        let src = source.source();
        log::info!(
            "Aligning {} ({}, {}x{}) onto {}x{} grid in {} with {:?}",
            src.id,
            src.crs,
            src.width,
            src.height,
            target.width,
            target.height,
            target.crs,
            self.method
        );
        if target.width == 0 || target.height == 0 {
            return Err(LakeError::InvalidInput("Target grid is empty".to_string()));
        }
        if target.transform.world_to_pixel(0.0, 0.0).is_none() {
            return Err(LakeError::Metadata("Target geotransform is not invertible".to_string()));
        }

        // Fails early with a Reprojection error for unusable CRS pairs
        let to_source = self.engine.transformer(&target.crs, &src.crs)?;
        let needed = transform_bounds(&target.bounds(), to_source.as_ref(), BOUNDS_DENSIFY)?;
        drop(to_source);

        if source_window(&src.transform, &needed)?.clamp_to(src.width, src.height).is_none() {
            log::warn!("{} does not cover the target grid; result is all nodata", src.id);
            return AlignedRaster::new(Array2::from_elem(target.shape(), self.nodata), target.clone(), self.nodata);
        }

        let bands: Vec<(usize, usize)> = (0..target.height)
            .step_by(ROW_BAND)
            .map(|r0| (r0, (r0 + ROW_BAND).min(target.height)))
            .collect();

        // Point transforms are not thread-safe; each band gets its own and
        // reads only the source rows it needs
        let results: LakeResult<Vec<RasterImage>> = bands
            .into_par_iter()
            .map(|(r0, r1)| self.resample_rows(source, band, target, r0, r1))
            .collect();

        let mut data = Array2::from_elem(target.shape(), self.nodata);
        for (i, rows) in results?.into_iter().enumerate() {
            let r0 = i * ROW_BAND;
            let r1 = r0 + rows.nrows();
            data.slice_mut(s![r0..r1, ..]).assign(&rows);
        }

        let aligned = AlignedRaster::new(data, target.clone(), self.nodata)?;
        log::info!("Aligned {}: {:.1}% of target covered", src.id, aligned.coverage() * 100.0);
        Ok(aligned)
    }

    fn resample_rows(
        &self,
        raster: &dyn RasterRead,
        band: usize,
        target: &RasterGrid,
        r0: usize,
        r1: usize,
    ) -> LakeResult<RasterImage> {
        let source = raster.source();
        let to_source = self.engine.transformer(&target.crs, &source.crs)?;
        let width = target.width;
        let count = (r1 - r0) * width;
        let mut xs = Vec::with_capacity(count);
        let mut ys = Vec::with_capacity(count);
        for row in r0..r1 {
            for col in 0..width {
                let (x, y) = target.transform.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
                xs.push(x);
                ys.push(y);
            }
        }
        to_source.transform_points(&mut xs, &mut ys)?;

        let mut out = Array2::from_elem((r1 - r0, width), self.nodata);
        let mut reach: Option<BoundingBox> = None;
        for (&x, &y) in xs.iter().zip(&ys) {
            if x.is_finite() && y.is_finite() {
                let point = BoundingBox::new(x, y, x, y);
                reach = Some(reach.map_or(point, |r| r.union(&point)));
            }
        }
        let window = match reach {
            Some(bbox) => source_window(&source.transform, &bbox)?.clamp_to(source.width, source.height),
            None => None,
        };
        let Some(window) = window else {
            return Ok(out);
        };
        let block = SourceBlock {
            data: raster.read_window(band, window)?,
            window,
            nodata: source.nodata.map(|v| v as f32),
        };
        log::trace!("Rows {}..{}: source window {:?}", r0, r1, window);

        for (i, value) in out.iter_mut().enumerate() {
            let (x, y) = (xs[i], ys[i]);
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            if let Some((col, row)) = source.transform.world_to_pixel(x, y) {
                if let Some(v) = block.sample(self.method, col, row) {
                    *value = v;
                }
            }
        }
        Ok(out)
    }
}
