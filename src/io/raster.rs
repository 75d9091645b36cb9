use crate::core::crs::GdalEngine;
use crate::types::{
    AlignedRaster, CrsDescriptor, GeoTransform, LakeError, LakeResult, MaskRaster, PixelWindow, RasterGrid,
    RasterImage, RasterSource,
};
use gdal::raster::{Buffer, GdalType, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};

/// Read contract shared by single rasters and composed mosaics
pub trait RasterRead: Send + Sync {
    fn source(&self) -> &RasterSource;

    /// Read a window of one band (1-based). Parts of the window outside the
    /// raster are filled with the nodata value, or NaN when none is declared.
    fn read_window(&self, band: usize, window: PixelWindow) -> LakeResult<RasterImage>;

    fn read_band(&self, band: usize) -> LakeResult<RasterImage> {
        let source = self.source();
        self.read_window(band, PixelWindow::full(source.width, source.height))
    }

    fn fill_value(&self) -> f32 {
        self.source().nodata.map(|v| v as f32).unwrap_or(f32::NAN)
    }
}

/// Build a CRS descriptor from a GDAL spatial reference
pub fn crs_from_spatial_ref(srs: &SpatialRef) -> LakeResult<CrsDescriptor> {
    let definition = srs
        .to_wkt()
        .map_err(|e| LakeError::Metadata(format!("CRS has no WKT form: {}", e)))?;
    if definition.trim().is_empty() {
        return Err(LakeError::Metadata("CRS definition is empty".to_string()));
    }
    let authority = srs.auth_name().ok();
    let code = srs.auth_code().ok().and_then(|c| u32::try_from(c).ok());
    Ok(CrsDescriptor {
        authority: if code.is_some() { authority } else { None },
        code,
        definition,
    })
}

/// Extract CRS, transform, size and nodata from an open dataset.
///
/// Fails with `Metadata` when the dataset has no CRS or no geotransform.
pub fn resolve_dataset(dataset: &Dataset, id: &str) -> LakeResult<RasterSource> {
    let (width, height) = dataset.raster_size();
    let geo_transform = dataset
        .geo_transform()
        .map_err(|e| LakeError::Metadata(format!("{}: no geotransform ({})", id, e)))?;

    if dataset.projection().trim().is_empty() {
        return Err(LakeError::Metadata(format!("{}: no coordinate reference system", id)));
    }
    let srs = dataset
        .spatial_ref()
        .map_err(|e| LakeError::Metadata(format!("{}: unreadable CRS ({})", id, e)))?;
    let crs = crs_from_spatial_ref(&srs)?;

    let band_count = dataset.raster_count().max(0) as usize;
    let nodata = if band_count > 0 {
        dataset.rasterband(1)?.no_data_value()
    } else {
        None
    };

    let transform = GeoTransform::from_gdal(geo_transform);
    if transform.pixel_width == 0.0 || transform.pixel_height == 0.0 {
        return Err(LakeError::Metadata(format!("{}: degenerate geotransform {:?}", id, geo_transform)));
    }

    log::debug!(
        "Resolved {}: {}x{} px, {} band(s), crs {}, transform {:?}",
        id,
        width,
        height,
        band_count,
        crs,
        geo_transform
    );

    Ok(RasterSource {
        id: id.to_string(),
        crs,
        transform,
        width,
        height,
        band_count,
        nodata,
    })
}

/// Open a raster path (file, VRT or `/vsi...` path) and read its metadata
pub fn resolve_raster_source<P: AsRef<Path>>(path: P) -> LakeResult<RasterSource> {
    let path = path.as_ref();
    let dataset = Dataset::open(path)
        .map_err(|e| LakeError::Metadata(format!("Cannot open {}: {}", path.display(), e)))?;
    resolve_dataset(&dataset, &source_id_from_path(path))
}

/// File stem with any double extension (`.tar.gz`, `.SAFE`) removed
pub fn source_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mut id = name.as_str();
    for suffix in [".tar.gz", ".gz", ".zip", ".tif", ".tiff", ".vrt", ".jp2", ".SAFE"] {
        if let Some(stripped) = id.strip_suffix(suffix) {
            id = stripped;
        }
    }
    id.to_string()
}

/// File-backed raster; the dataset is reopened per read so the handle can be
/// shared across worker threads.
#[derive(Debug, Clone)]
pub struct GdalRaster {
    path: PathBuf,
    source: RasterSource,
}

impl GdalRaster {
    pub fn open<P: AsRef<Path>>(path: P) -> LakeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let source = resolve_raster_source(&path)?;
        Ok(Self { path, source })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RasterRead for GdalRaster {
    fn source(&self) -> &RasterSource {
        &self.source
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> LakeResult<RasterImage> {
        if band == 0 || band > self.source.band_count {
            return Err(LakeError::InvalidInput(format!(
                "{}: band {} out of range 1..={}",
                self.source.id, band, self.source.band_count
            )));
        }
        let mut out = Array2::from_elem((window.height, window.width), self.fill_value());
        let inside = match window.clamp_to(self.source.width, self.source.height) {
            Some(inside) => inside,
            None => return Ok(out),
        };

        let dataset = Dataset::open(&self.path)?;
        let rasterband = dataset.rasterband(band as isize)?;
        let band_data = rasterband.read_as::<f32>(
            (inside.col_off, inside.row_off),
            (inside.width, inside.height),
            (inside.width, inside.height),
            None,
        )?;
        let block = Array2::from_shape_vec((inside.height, inside.width), band_data.data)
            .map_err(|e| LakeError::Processing(format!("Failed to reshape raster block: {}", e)))?;

        let r0 = (inside.row_off - window.row_off) as usize;
        let c0 = (inside.col_off - window.col_off) as usize;
        out.slice_mut(s![r0..r0 + inside.height, c0..c0 + inside.width])
            .assign(&block);
        Ok(out)
    }
}

/// Raster held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    source: RasterSource,
    bands: Vec<RasterImage>,
}

impl MemoryRaster {
    pub fn new(source: RasterSource, bands: Vec<RasterImage>) -> LakeResult<Self> {
        if bands.len() != source.band_count {
            return Err(LakeError::InvalidInput(format!(
                "{}: {} band buffers for {} declared bands",
                source.id,
                bands.len(),
                source.band_count
            )));
        }
        if let Some(bad) = bands.iter().find(|b| b.dim() != source.shape()) {
            return Err(LakeError::GridMismatch(format!(
                "{}: band buffer {:?} does not match {:?}",
                source.id,
                bad.dim(),
                source.shape()
            )));
        }
        Ok(Self { source, bands })
    }

    /// Single-band raster on a grid
    pub fn from_grid(id: &str, grid: &RasterGrid, data: RasterImage, nodata: Option<f64>) -> LakeResult<Self> {
        let source = RasterSource {
            id: id.to_string(),
            crs: grid.crs.clone(),
            transform: grid.transform,
            width: grid.width,
            height: grid.height,
            band_count: 1,
            nodata,
        };
        Self::new(source, vec![data])
    }
}

impl RasterRead for MemoryRaster {
    fn source(&self) -> &RasterSource {
        &self.source
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> LakeResult<RasterImage> {
        let data = band
            .checked_sub(1)
            .and_then(|i| self.bands.get(i))
            .ok_or_else(|| LakeError::InvalidInput(format!("{}: no band {}", self.source.id, band)))?;
        let mut out = Array2::from_elem((window.height, window.width), self.fill_value());
        if let Some(inside) = window.clamp_to(self.source.width, self.source.height) {
            let r0 = (inside.row_off - window.row_off) as usize;
            let c0 = (inside.col_off - window.col_off) as usize;
            let (ir, ic) = (inside.row_off as usize, inside.col_off as usize);
            out.slice_mut(s![r0..r0 + inside.height, c0..c0 + inside.width])
                .assign(&data.slice(s![ir..ir + inside.height, ic..ic + inside.width]));
        }
        Ok(out)
    }
}

/// Band 1 of a raster file with its grid; without declared nodata, NaN marks missing pixels
pub fn read_aligned<P: AsRef<Path>>(path: P) -> LakeResult<AlignedRaster> {
    let raster = GdalRaster::open(path)?;
    let data = raster.read_band(1)?;
    AlignedRaster::new(data, raster.source().grid(), raster.fill_value())
}

/// Label raster: any positive value is a lake pixel
pub fn read_mask<P: AsRef<Path>>(path: P) -> LakeResult<MaskRaster> {
    let raster = GdalRaster::open(path)?;
    let data = raster.read_band(1)?.mapv(|v| v > 0.0);
    Ok(MaskRaster {
        data,
        grid: raster.source().grid(),
    })
}

/// Write a single-band raster with its grid as a deflate-compressed GeoTIFF
pub fn write_geotiff<T, P>(output_path: P, data: &Array2<T>, grid: &RasterGrid, nodata: Option<f64>) -> LakeResult<()>
where
    T: GdalType + Copy,
    P: AsRef<Path>,
{
    log::info!("Saving raster as GeoTIFF: {}", output_path.as_ref().display());

    let (height, width) = data.dim();
    if (height, width) != grid.shape() {
        return Err(LakeError::GridMismatch(format!(
            "buffer {:?} does not match grid {:?}",
            data.dim(),
            grid.shape()
        )));
    }
    if let Some(parent) = output_path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "COMPRESS", value: "DEFLATE" },
        RasterCreationOption { key: "TILED", value: "YES" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
        &options,
    )?;

    dataset.set_geo_transform(&grid.transform.to_gdal())?;
    dataset.set_spatial_ref(&GdalEngine::spatial_ref(&grid.crs)?)?;

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<T> = data.iter().copied().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;

    if let Some(nodata) = nodata {
        rasterband.set_no_data_value(Some(nodata))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(width: usize, height: usize, nodata: Option<f64>) -> RasterSource {
        RasterSource {
            id: "mem".to_string(),
            crs: CrsDescriptor::from_epsg(32622),
            transform: GeoTransform::north_up(0.0, height as f64, 1.0, -1.0),
            width,
            height,
            band_count: 1,
            nodata,
        }
    }

    #[test]
    fn test_memory_window_with_padding() {
        let data = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32);
        let raster = MemoryRaster::new(source(4, 4, Some(-1.0)), vec![data]).unwrap();
        let window = raster.read_window(1, PixelWindow::new(2, -1, 4, 3)).unwrap();
        assert_eq!(window.dim(), (3, 4));
        assert_eq!(window[[0, 0]], -1.0);
        assert_eq!(window[[1, 0]], 2.0);
        assert_eq!(window[[2, 1]], 7.0);
        assert_eq!(window[[1, 3]], -1.0);
    }

    #[test]
    fn test_memory_raster_rejects_bad_band() {
        let raster = MemoryRaster::new(source(2, 2, None), vec![Array2::zeros((2, 2))]).unwrap();
        assert!(raster.read_window(2, PixelWindow::full(2, 2)).is_err());
        assert!(raster.read_window(1, PixelWindow::full(2, 2)).is_ok());
    }

    #[test]
    fn test_source_id_strips_extensions() {
        assert_eq!(source_id_from_path(Path::new("/a/b/SETSM_s2s041_2m_lsf_seg1.tar.gz")), "SETSM_s2s041_2m_lsf_seg1");
        assert_eq!(source_id_from_path(Path::new("x/S2A_MSIL2A_20190704T151911.SAFE")), "S2A_MSIL2A_20190704T151911");
    }

    #[test]
    fn test_geotiff_write_then_read_keeps_grid() {
        let dir = tempfile::tempdir().unwrap();
        let grid = RasterGrid {
            crs: CrsDescriptor::from_epsg(32622),
            transform: GeoTransform::north_up(500000.0, 7600000.0, 10.0, -10.0),
            width: 6,
            height: 4,
        };
        let data = Array2::from_shape_fn((4, 6), |(r, c)| if r == c { -9999.0 } else { (r + c) as f32 });
        let path = dir.path().join("dem.tif");
        write_geotiff(&path, &data, &grid, Some(-9999.0)).unwrap();

        let back = read_aligned(&path).unwrap();
        assert!(back.grid.matches(&grid, 1e-9));
        assert_eq!(back.nodata, -9999.0);
        assert_eq!(back.data[[1, 2]], 3.0);
        assert!(back.is_nodata(back.data[[2, 2]]));

        let mask_path = dir.path().join("mask.tif");
        let mask = Array2::from_shape_fn((4, 6), |(r, _)| u8::from(r == 0));
        write_geotiff(&mask_path, &mask, &grid, None).unwrap();
        let mask_back = read_mask(&mask_path).unwrap();
        assert_eq!(mask_back.positive_count(), 6);
    }

    #[test]
    fn test_raster_without_crs_is_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_crs.tif");
        {
            let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
            let mut dataset = driver
                .create_with_band_type::<f32, _>(&path, 8, 8, 1)
                .unwrap();
            dataset.set_geo_transform(&[0.0, 1.0, 0.0, 8.0, 0.0, -1.0]).unwrap();
        }
        let result = resolve_raster_source(&path);
        assert!(matches!(result, Err(LakeError::Metadata(_))));
    }
}
