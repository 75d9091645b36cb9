use crate::types::{LakeError, LakeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resampling kernel used when moving elevation onto the scene grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMethod {
    /// Categorical data, or elevation used as a label
    Nearest,
    Bilinear,
    Cubic,
}

impl std::str::FromStr for ResamplingMethod {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(ResamplingMethod::Nearest),
            "bilinear" => Ok(ResamplingMethod::Bilinear),
            "cubic" => Ok(ResamplingMethod::Cubic),
            _ => Err(LakeError::InvalidInput(format!("Unknown resampling method: {}", s))),
        }
    }
}

/// Format of persisted full-scene rasters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    GeoTiff,
}

impl RasterFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RasterFormat::GeoTiff => "tif",
        }
    }
}

/// Container for individual tile files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Compressed numpy archive: `ndwi` (1, T, T) f32 and `mask` (T, T) u8
    Npz,
    /// Georeferenced single-band GeoTIFF per tile
    GeoTiff,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Npz => "npz",
            TileFormat::GeoTiff => "tif",
        }
    }
}

impl std::str::FromStr for TileFormat {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "npz" => Ok(TileFormat::Npz),
            "tif" | "tiff" | "geotiff" => Ok(TileFormat::GeoTiff),
            _ => Err(LakeError::InvalidInput(format!("Unknown tile format: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Window edge length in pixels
    pub size: usize,
    /// Step between window origins; must not exceed `size`
    pub stride: usize,
    /// Keep windows whose mask has no positive pixel
    pub keep_empty: bool,
    pub format: TileFormat,
    /// Value written to image tiles where the index is undefined
    pub index_fill_value: f32,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            size: 256,
            stride: 128,
            keep_empty: true,
            format: TileFormat::Npz,
            index_fill_value: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    /// Where downloaded strips are cached; defaults to the platform cache dir
    pub cache_dir: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 2,
            timeout_secs: 300,
            cache_dir: None,
        }
    }
}

impl FetchConfig {
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("meltprep")
                .join("strips")
        })
    }
}

/// Train / validation fractions; the remainder becomes the test split
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train: f64,
    pub validation: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.7,
            validation: 0.15,
        }
    }
}

/// Pipeline-wide parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pixels with index >= threshold are lake candidates
    pub index_threshold: f32,
    /// Candidates above this elevation are rejected
    pub elevation_ceiling: Option<f32>,
    /// Candidates at or below this elevation are rejected
    pub elevation_floor: Option<f32>,
    /// Connected lake regions smaller than this (CRS units squared) are removed
    pub min_region_area: f64,
    /// Outward buffer around the scene footprint for strip search (scene CRS units)
    pub buffer_distance: f64,
    pub max_strips: Option<usize>,
    pub resampling: ResamplingMethod,
    pub elevation_nodata: f32,
    /// Tolerance for comparing transform coefficients, in CRS units
    pub transform_tolerance: f64,
    pub raster_format: RasterFormat,
    /// Write aligned/clipped elevation, index and mask rasters per scene
    pub persist_intermediates: bool,
    /// Also write the selected strips as a GDAL VRT mosaic
    pub write_mosaic_vrt: bool,
    /// Write lake outlines as `<tag>_lakes.geojson`
    pub export_lakes: bool,
    pub green_band: String,
    pub nir_band: String,
    pub tile: TileConfig,
    pub fetch: FetchConfig,
    pub split: SplitConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            index_threshold: 0.25,
            elevation_ceiling: None,
            elevation_floor: None,
            min_region_area: 1000.0,
            buffer_distance: 1000.0,
            max_strips: Some(10),
            resampling: ResamplingMethod::Bilinear,
            elevation_nodata: -9999.0,
            transform_tolerance: 1e-6,
            raster_format: RasterFormat::GeoTiff,
            persist_intermediates: true,
            write_mosaic_vrt: false,
            export_lakes: true,
            green_band: "B03_10m".to_string(),
            nir_band: "B08_10m".to_string(),
            tile: TileConfig::default(),
            fetch: FetchConfig::default(),
            split: SplitConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON configuration file; missing keys take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> LakeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&text).map_err(|e| {
            LakeError::Serialization(format!(
                "Failed to parse config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LakeResult<()> {
        if !self.index_threshold.is_finite() {
            return Err(LakeError::InvalidInput("index_threshold must be finite".to_string()));
        }
        if let (Some(floor), Some(ceiling)) = (self.elevation_floor, self.elevation_ceiling) {
            if floor >= ceiling {
                return Err(LakeError::InvalidInput(format!(
                    "elevation_floor {} must be below elevation_ceiling {}",
                    floor, ceiling
                )));
            }
        }
        if self.min_region_area < 0.0 {
            return Err(LakeError::InvalidInput("min_region_area must not be negative".to_string()));
        }
        if self.buffer_distance < 0.0 {
            return Err(LakeError::InvalidInput("buffer_distance must not be negative".to_string()));
        }
        if self.max_strips == Some(0) {
            return Err(LakeError::InvalidInput("max_strips must be at least 1".to_string()));
        }
        if self.transform_tolerance <= 0.0 {
            return Err(LakeError::InvalidInput("transform_tolerance must be positive".to_string()));
        }
        if self.tile.size == 0 || self.tile.stride == 0 || self.tile.stride > self.tile.size {
            return Err(LakeError::InvalidInput(format!(
                "tile stride {} must be in 1..={} (tile size)",
                self.tile.stride, self.tile.size
            )));
        }
        if self.fetch.max_attempts == 0 {
            return Err(LakeError::InvalidInput("fetch.max_attempts must be at least 1".to_string()));
        }
        let split = &self.split;
        if split.train < 0.0 || split.validation < 0.0 || split.train + split.validation > 1.0 {
            return Err(LakeError::InvalidInput(format!(
                "split fractions train={} validation={} must be non-negative and sum to <= 1",
                split.train, split.validation
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stride_larger_than_tile_rejected() {
        let mut config = PipelineConfig::default();
        config.tile.stride = 300;
        assert!(matches!(config.validate(), Err(LakeError::InvalidInput(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"index_threshold": 0.3, "tile": {"size": 128, "stride": 128}}"#).unwrap();
        assert!((config.index_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.tile.size, 128);
        assert_eq!(config.tile.format, TileFormat::Npz);
        assert_eq!(config.resampling, ResamplingMethod::Bilinear);
        assert!(config.validate().is_ok());
    }
}
