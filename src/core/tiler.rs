use crate::config::{PipelineConfig, SplitConfig, TileConfig, TileFormat};
use crate::io::raster::write_geotiff;
use crate::types::{AlignedRaster, LakeError, LakeResult, MaskRaster, RasterGrid};
use ndarray::{s, Array2, Axis};
use ndarray_npy::NpzWriter;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const IMAGES_DIR: &str = "images";
pub const MASKS_DIR: &str = "masks";

/// Top-left pixel of a tile window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileOffset {
    pub row: usize,
    pub col: usize,
}

/// Window origins `0, S, 2S, ...` while the whole window fits, rows outer.
/// Windows that would cross the border are not produced.
pub fn tile_offsets(height: usize, width: usize, size: usize, stride: usize) -> LakeResult<Vec<TileOffset>> {
    if size == 0 || stride == 0 || stride > size {
        return Err(LakeError::InvalidInput(format!(
            "tile size {} / stride {}: stride must be in 1..=size",
            size, stride
        )));
    }
    if height < size || width < size {
        return Ok(Vec::new());
    }
    let rows = (0..=height - size).step_by(stride);
    let cols: Vec<usize> = (0..=width - size).step_by(stride).collect();
    Ok(rows
        .flat_map(|row| cols.iter().map(move |&col| TileOffset { row, col }))
        .collect())
}

/// Stable identifier: same source and offset, same id
pub fn tile_id(source_id: &str, offset: TileOffset) -> String {
    format!("{}_y{}_x{}", source_id, offset.row, offset.col)
}

/// One paired training sample
#[derive(Debug, Clone)]
pub struct Tile {
    pub id: String,
    pub offset: TileOffset,
    pub image: Array2<f32>,
    pub mask: Array2<u8>,
}

impl Tile {
    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|v| *v == 0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TilingSummary {
    pub source_id: String,
    pub windows: usize,
    pub empty_windows: usize,
    pub ids: Vec<String>,
}

pub struct Tiler {
    config: TileConfig,
    tolerance: f64,
}

impl Tiler {
    pub fn new(config: &TileConfig, tolerance: f64) -> LakeResult<Self> {
        tile_offsets(config.size, config.size, config.size, config.stride)?;
        Ok(Self {
            config: config.clone(),
            tolerance,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> LakeResult<Self> {
        Self::new(&config.tile, config.transform_tolerance)
    }

    /// Image and mask must share CRS, transform and shape
    pub fn check_pair(&self, image: &AlignedRaster, mask: &MaskRaster) -> LakeResult<()> {
        match image.grid.describe_mismatch(&mask.grid, self.tolerance) {
            Some(diff) => Err(LakeError::GridMismatch(format!("index vs mask: {}", diff))),
            None if mask.data.dim() != image.data.dim() => Err(LakeError::GridMismatch(format!(
                "index buffer {:?} vs mask buffer {:?}",
                image.data.dim(),
                mask.data.dim()
            ))),
            None => Ok(()),
        }
    }

    /// Cut every window, in offset order. Image values are clamped to
    /// [-1, 1] and undefined pixels take the configured fill value.
    pub fn extract(&self, source_id: &str, image: &AlignedRaster, mask: &MaskRaster) -> LakeResult<Vec<Tile>> {
        self.check_pair(image, mask)?;
        let (height, width) = image.shape();
        let size = self.config.size;
        let fill = self.config.index_fill_value;

        let offsets = tile_offsets(height, width, size, self.config.stride)?;
        let tiles: Vec<Tile> = offsets
            .par_iter()
            .map(|&offset| {
                let window = s![offset.row..offset.row + size, offset.col..offset.col + size];
                let tile_image = image.data.slice(window).mapv(|v| {
                    if v.is_nan() || v == image.nodata {
                        fill
                    } else {
                        v.clamp(-1.0, 1.0)
                    }
                });
                let tile_mask = mask.data.slice(window).mapv(u8::from);
                Tile {
                    id: tile_id(source_id, offset),
                    offset,
                    image: tile_image,
                    mask: tile_mask,
                }
            })
            .collect();
        Ok(tiles)
    }

    /// Extract, drop empty windows unless configured to keep them, and write
    /// the pairs under `out_root/images` and `out_root/masks`.
    pub fn tile_pair<P: AsRef<Path>>(
        &self,
        source_id: &str,
        image: &AlignedRaster,
        mask: &MaskRaster,
        out_root: P,
    ) -> LakeResult<TilingSummary> {
        let tiles = self.extract(source_id, image, mask)?;
        let windows = tiles.len();
        let empty_windows = tiles.iter().filter(|t| t.is_empty()).count();
        let kept: Vec<Tile> = if self.config.keep_empty {
            tiles
        } else {
            tiles.into_iter().filter(|t| !t.is_empty()).collect()
        };

        self.write_tiles(&kept, &image.grid, out_root.as_ref())?;
        log::info!(
            "Tiled {}: {} tiles written ({} windows, {} empty)",
            source_id,
            kept.len(),
            windows,
            empty_windows
        );
        Ok(TilingSummary {
            source_id: source_id.to_string(),
            windows,
            empty_windows,
            ids: kept.into_iter().map(|t| t.id).collect(),
        })
    }

    /// Each tile goes to its own offset-derived path, so parallel writes never collide
    pub fn write_tiles(&self, tiles: &[Tile], grid: &RasterGrid, out_root: &Path) -> LakeResult<()> {
        let images_dir = out_root.join(IMAGES_DIR);
        let masks_dir = out_root.join(MASKS_DIR);
        std::fs::create_dir_all(&images_dir)?;
        std::fs::create_dir_all(&masks_dir)?;
        let ext = self.config.format.extension();

        tiles.par_iter().try_for_each(|tile| {
            let image_path = images_dir.join(format!("{}.{}", tile.id, ext));
            let mask_path = masks_dir.join(format!("{}.{}", tile.id, ext));
            match self.config.format {
                TileFormat::Npz => write_npz_pair(tile, &image_path, &mask_path),
                TileFormat::GeoTiff => {
                    let tile_grid = RasterGrid {
                        crs: grid.crs.clone(),
                        transform: grid.transform.shifted(tile.offset.col as isize, tile.offset.row as isize),
                        width: self.config.size,
                        height: self.config.size,
                    };
                    write_geotiff(&image_path, &tile.image, &tile_grid, None)?;
                    write_geotiff(&mask_path, &tile.mask, &tile_grid, None)
                }
            }
        })
    }
}

/// `ndwi` (1, T, T) f32 in the image archive, `mask` (T, T) u8 in the mask archive
fn write_npz_pair(tile: &Tile, image_path: &Path, mask_path: &Path) -> LakeResult<()> {
    let to_err = |e: ndarray_npy::WriteNpzError| LakeError::Serialization(format!("{}: {}", tile.id, e));

    let mut npz = NpzWriter::new_compressed(File::create(image_path)?);
    npz.add_array("ndwi", &tile.image.view().insert_axis(Axis(0)))
        .map_err(to_err)?;
    npz.finish().map_err(to_err)?;

    let mut npz = NpzWriter::new_compressed(File::create(mask_path)?);
    npz.add_array("mask", &tile.mask).map_err(to_err)?;
    npz.finish().map_err(to_err)?;
    Ok(())
}

/// Stems present on only one side of an image/mask tile collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairReport {
    pub images: usize,
    pub masks: usize,
    pub missing_masks: Vec<String>,
    pub missing_images: Vec<String>,
}

impl PairReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_masks.is_empty() && self.missing_images.is_empty()
    }
}

fn tile_stems(dir: &Path) -> LakeResult<BTreeSet<String>> {
    let mut stems = BTreeSet::new();
    if !dir.exists() {
        return Ok(stems);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tile = path
            .extension()
            .map(|e| e == "npz" || e == "tif")
            .unwrap_or(false);
        if is_tile {
            if let Some(stem) = path.file_stem() {
                stems.insert(stem.to_string_lossy().to_string());
            }
        }
    }
    Ok(stems)
}

/// Compare the `images/` and `masks/` collections under `root` by file stem
pub fn verify_tile_pairs<P: AsRef<Path>>(root: P) -> LakeResult<PairReport> {
    let images = tile_stems(&root.as_ref().join(IMAGES_DIR))?;
    let masks = tile_stems(&root.as_ref().join(MASKS_DIR))?;
    let report = PairReport {
        images: images.len(),
        masks: masks.len(),
        missing_masks: images.difference(&masks).cloned().collect(),
        missing_images: masks.difference(&images).cloned().collect(),
    };
    if report.is_consistent() {
        log::info!("Every image tile has a matching mask ({} pairs)", report.images);
    } else {
        log::warn!(
            "{} image tiles without mask, {} mask tiles without image",
            report.missing_masks.len(),
            report.missing_images.len()
        );
    }
    Ok(report)
}

/// Tile ids per partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileSplits {
    pub train: Vec<String>,
    pub validation: Vec<String>,
    pub test: Vec<String>,
}

/// Deterministic split over the sorted, de-duplicated ids: the first
/// `floor(n * train)` go to train, the next `floor(n * validation)` to
/// validation, the rest to test.
pub fn partition_tiles(ids: &[String], split: &SplitConfig) -> TileSplits {
    let sorted: Vec<String> = ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let n = sorted.len();
    let n_train = (((n as f64) * split.train).floor() as usize).min(n);
    let n_val = (((n as f64) * split.validation).floor() as usize).min(n - n_train);
    TileSplits {
        train: sorted[..n_train].to_vec(),
        validation: sorted[n_train..n_train + n_val].to_vec(),
        test: sorted[n_train + n_val..].to_vec(),
    }
}

impl TileSplits {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> LakeResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| LakeError::Serialization(format!("Failed to encode splits: {}", e)))?;
        std::fs::write(path.as_ref(), text)?;
        log::info!(
            "Splits: {} train / {} validation / {} test -> {}",
            self.train.len(),
            self.validation.len(),
            self.test.len(),
            path.as_ref().display()
        );
        Ok(())
    }
}

/// Index/mask raster pairs in a directory, matched as `<tag>_ndwi.tif` with
/// `<tag>_lake_mask.tif`
pub fn find_raster_pairs<P: AsRef<Path>>(dir: P) -> LakeResult<Vec<(String, PathBuf, PathBuf)>> {
    let mut pairs = Vec::new();
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    names.sort();
    for path in names {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => continue,
        };
        if let Some(tag) = name.strip_suffix("_ndwi.tif") {
            let mask_path = path.with_file_name(format!("{}_lake_mask.tif", tag));
            if mask_path.exists() {
                pairs.push((tag.to_string(), path.clone(), mask_path));
            } else {
                log::warn!("No lake mask for {}, expected {}", path.display(), mask_path.display());
            }
        }
    }
    log::info!("Found {} index/mask pairs", pairs.len());
    Ok(pairs)
}
