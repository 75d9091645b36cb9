use crate::config::PipelineConfig;
use crate::core::align::GridAligner;
use crate::core::clip::FootprintClipper;
use crate::core::crs::ReferenceSystemEngine;
use crate::core::footprint::{check_overlap, Footprint};
use crate::core::index::{index_from_bands, MaskGenerator};
use crate::core::lakes::{polygonize_mask, write_lakes_geojson, LakeAttributes};
use crate::core::mosaic::{fetch_strips, write_vrt, MosaicDescriptor, MosaicRaster, StripSelector};
use crate::core::tiler::{find_raster_pairs, partition_tiles, Tiler, TilingSummary};
use crate::io::fetch::StripFetcher;
use crate::io::raster::{read_aligned, read_mask, write_geotiff, GdalRaster, RasterRead};
use crate::io::scene::{SceneBundle, SceneId};
use crate::io::strip_index::StripIndex;
use crate::types::{AlignedRaster, LakeError, LakeResult};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const TILES_DIR: &str = "tiles";

/// Named pipeline stages, reported with every scene failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ResolveReference,
    StripSelection,
    OverlapCheck,
    MosaicBuild,
    Alignment,
    Clipping,
    IndexMask,
    LakeExport,
    Output,
    Tiling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveReference => "resolve-reference",
            Stage::StripSelection => "strip-selection",
            Stage::OverlapCheck => "overlap-check",
            Stage::MosaicBuild => "mosaic-build",
            Stage::Alignment => "alignment",
            Stage::Clipping => "clipping",
            Stage::IndexMask => "index-mask",
            Stage::LakeExport => "lake-export",
            Stage::Output => "output",
            Stage::Tiling => "tiling",
        };
        write!(f, "{}", name)
    }
}

/// A scene that could not be processed, with the stage that gave up
#[derive(Debug, thiserror::Error)]
#[error("scene {scene_id} failed at {stage}: {error}")]
pub struct SceneFailure {
    pub scene_id: String,
    pub stage: Stage,
    #[source]
    pub error: LakeError,
}

trait StageResult<T> {
    fn at(self, stage: Stage) -> Result<T, (Stage, LakeError)>;
}

impl<T> StageResult<T> for LakeResult<T> {
    fn at(self, stage: Stage) -> Result<T, (Stage, LakeError)> {
        self.map_err(|e| (stage, e))
    }
}

/// What a completed scene produced
#[derive(Debug, Clone, Serialize)]
pub struct SceneReport {
    pub scene_id: String,
    pub tag: String,
    pub strips: Vec<String>,
    pub overlap_ratio: f64,
    pub dem_coverage: f64,
    pub lake_pixels: usize,
    pub lake_count: usize,
    pub tiles: TilingSummary,
    pub output_dir: PathBuf,
}

#[derive(Debug)]
pub enum SceneOutcome {
    Completed(SceneReport),
    /// No usable overlap; expected for some scenes
    Skipped { scene_id: String, reason: String },
    Failed(SceneFailure),
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<SceneOutcome>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, SceneOutcome::Completed(_))).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, SceneOutcome::Skipped { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, SceneOutcome::Failed(_))).count()
    }

    pub fn tile_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                SceneOutcome::Completed(report) => Some(report.tiles.ids.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Where scene elevation comes from
pub enum ElevationSource {
    /// Strips selected from a catalogue per scene and fetched on demand
    Strips { index: StripIndex, fetcher: StripFetcher },
    /// One existing elevation raster or VRT shared by every scene
    Raster(PathBuf),
}

/// Elevation chosen for one scene, before any pixels are read
enum SceneElevation<'a> {
    Strips {
        descriptor: MosaicDescriptor,
        fetcher: &'a StripFetcher,
    },
    Raster(GdalRaster),
}

impl SceneElevation<'_> {
    fn footprint(&self) -> Footprint {
        match self {
            SceneElevation::Strips { descriptor, .. } => descriptor.footprint.clone(),
            SceneElevation::Raster(raster) => Footprint::from_source(raster.source()),
        }
    }

    fn ids(&self) -> Vec<String> {
        match self {
            SceneElevation::Strips { descriptor, .. } => descriptor.ids().into_iter().map(String::from).collect(),
            SceneElevation::Raster(raster) => vec![raster.source().id.clone()],
        }
    }
}

/// Scene-independent state shared by every scene of a run
pub struct Pipeline {
    config: PipelineConfig,
    elevation: ElevationSource,
    engine: Box<dyn ReferenceSystemEngine>,
}

impl Pipeline {
    /// Elevation from strips selected out of `index` for each scene
    pub fn new(config: PipelineConfig, index: StripIndex, engine: Box<dyn ReferenceSystemEngine>) -> LakeResult<Self> {
        config.validate()?;
        let fetcher = StripFetcher::new(&config.fetch)?;
        Ok(Self {
            config,
            elevation: ElevationSource::Strips { index, fetcher },
            engine,
        })
    }

    /// Elevation from one prebuilt raster (GeoTIFF or VRT). It is opened once
    /// here so an unreadable path fails before any scene runs.
    pub fn from_dem<P: AsRef<Path>>(
        config: PipelineConfig,
        dem: P,
        engine: Box<dyn ReferenceSystemEngine>,
    ) -> LakeResult<Self> {
        config.validate()?;
        let dem = dem.as_ref().to_path_buf();
        let raster = GdalRaster::open(&dem)?;
        log::info!("Elevation raster {} ({})", dem.display(), raster.source().crs);
        Ok(Self {
            config,
            elevation: ElevationSource::Raster(dem),
            engine,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn elevation(&self) -> &ElevationSource {
        &self.elevation
    }

    /// Run every stage for one scene bundle. Rasters land in
    /// `out_root/<tag>/`, tiles in `out_root/tiles/`.
    pub fn process_scene(&self, scene_path: &Path, out_root: &Path) -> Result<SceneReport, SceneFailure> {
        let fallback_id = bundle_name(scene_path);
        let start = Instant::now();

        let bundle = SceneBundle::open(scene_path).map_err(|error| SceneFailure {
            scene_id: fallback_id.clone(),
            stage: Stage::ResolveReference,
            error,
        })?;
        let scene_id = bundle.id.name.clone();
        log::info!("Processing scene {}", scene_id);

        match self.run_stages(&bundle, out_root) {
            Ok(report) => {
                log::info!(
                    "Scene {} done in {:.1}s: {} tiles",
                    scene_id,
                    start.elapsed().as_secs_f64(),
                    report.tiles.ids.len()
                );
                Ok(report)
            }
            Err((stage, error)) => Err(SceneFailure { scene_id, stage, error }),
        }
    }

    fn run_stages(&self, bundle: &SceneBundle, out_root: &Path) -> Result<SceneReport, (Stage, LakeError)> {
        let config = &self.config;
        let tag = bundle.id.tag();
        let scene_dir = out_root.join(&tag);

        // Reference grid comes from the green band; NIR must share it
        let green = bundle.open_band(&config.green_band).at(Stage::ResolveReference)?;
        let nir = bundle.open_band(&config.nir_band).at(Stage::ResolveReference)?;
        let target = green.source().grid();
        if let Some(diff) = target.describe_mismatch(&nir.source().grid(), config.transform_tolerance) {
            return Err((
                Stage::ResolveReference,
                LakeError::GridMismatch(format!("{} vs {}: {}", config.green_band, config.nir_band, diff)),
            ));
        }
        let scene_footprint = Footprint::from_source(green.source());

        let elevation = self.select_elevation(&scene_footprint)?;
        let overlap = check_overlap(&scene_footprint, &elevation.footprint(), self.engine.as_ref())
            .at(Stage::OverlapCheck)?;
        if !overlap.overlaps {
            return Err((
                Stage::OverlapCheck,
                LakeError::NoOverlap(format!("elevation only reaches the buffer around {}", tag)),
            ));
        }
        log::info!("Scene/elevation overlap ratio: {:.3}", overlap.ratio);
        let strips = elevation.ids();

        let (dem_raster, strip_paths, descriptor) = match elevation {
            SceneElevation::Strips { descriptor, fetcher } => {
                let paths = fetch_strips(&descriptor, fetcher).at(Stage::MosaicBuild)?;
                let mosaic = MosaicRaster::from_paths(&format!("{}_mosaic", tag), &paths, config.elevation_nodata)
                    .at(Stage::MosaicBuild)?;
                let raster: Box<dyn RasterRead> = Box::new(mosaic);
                (raster, paths, Some(descriptor))
            }
            SceneElevation::Raster(raster) => {
                let raster: Box<dyn RasterRead> = Box::new(raster);
                (raster, Vec::new(), None)
            }
        };

        let aligned_dem = GridAligner::new(self.engine.as_ref(), config)
            .align(dem_raster.as_ref(), 1, &target)
            .at(Stage::Alignment)?;

        let clipper = FootprintClipper::new();
        let dem = clipper.clip(&aligned_dem, &overlap.intersection).at(Stage::Clipping)?;
        let green = clipper
            .clip(&band_raster(&green).at(Stage::Clipping)?, &overlap.intersection)
            .at(Stage::Clipping)?;
        let nir = clipper
            .clip(&band_raster(&nir).at(Stage::Clipping)?, &overlap.intersection)
            .at(Stage::Clipping)?;

        let ndwi = index_from_bands(&green, &nir, config.transform_tolerance).at(Stage::IndexMask)?;
        let mask = MaskGenerator::from_config(config)
            .generate(&ndwi, Some(&dem))
            .at(Stage::IndexMask)?;

        let lakes = if config.export_lakes {
            polygonize_mask(&mask, config.min_region_area)
        } else {
            Vec::new()
        };

        std::fs::create_dir_all(&scene_dir).map_err(LakeError::from).at(Stage::Output)?;
        if let Some(descriptor) = &descriptor {
            descriptor.write_url_lists(&scene_dir).at(Stage::Output)?;
            if config.write_mosaic_vrt {
                write_vrt(&strip_paths, scene_dir.join(format!("{}_dem_mosaic.vrt", tag))).at(Stage::Output)?;
            }
        }
        if config.persist_intermediates {
            let ext = config.raster_format.extension();
            let nodata = Some(config.elevation_nodata as f64);
            write_geotiff(scene_dir.join(format!("{}_dem_aligned.{}", tag, ext)), &aligned_dem.data, &aligned_dem.grid, nodata)
                .at(Stage::Output)?;
            write_geotiff(scene_dir.join(format!("{}_dem_clipped.{}", tag, ext)), &dem.data, &dem.grid, nodata)
                .at(Stage::Output)?;
            write_geotiff(scene_dir.join(format!("{}_ndwi.{}", tag, ext)), &ndwi.data, &ndwi.grid, None)
                .at(Stage::Output)?;
            write_geotiff(scene_dir.join(format!("{}_lake_mask.{}", tag, ext)), &mask.to_u8(), &mask.grid, None)
                .at(Stage::Output)?;
        }
        if config.export_lakes {
            let attributes = LakeAttributes {
                scene: bundle.id.name.clone(),
                date: bundle.id.acquisition_date,
                index_threshold: config.index_threshold,
                elevation_floor: config.elevation_floor,
                elevation_ceiling: config.elevation_ceiling,
            };
            write_lakes_geojson(scene_dir.join(format!("{}_lakes.geojson", tag)), &lakes, &mask.grid.crs, &attributes)
                .at(Stage::LakeExport)?;
        }

        let tiles = Tiler::from_config(config)
            .and_then(|tiler| tiler.tile_pair(&tag, &ndwi, &mask, out_root.join(TILES_DIR)))
            .at(Stage::Tiling)?;

        let report = SceneReport {
            scene_id: bundle.id.name.clone(),
            tag,
            strips,
            overlap_ratio: overlap.ratio,
            dem_coverage: dem.coverage(),
            lake_pixels: mask.positive_count(),
            lake_count: lakes.len(),
            tiles,
            output_dir: scene_dir.clone(),
        };
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| LakeError::Serialization(format!("Failed to encode scene report: {}", e)))
            .at(Stage::Output)?;
        std::fs::write(scene_dir.join("report.json"), text)
            .map_err(LakeError::from)
            .at(Stage::Output)?;
        Ok(report)
    }

    fn select_elevation(&self, scene_footprint: &Footprint) -> Result<SceneElevation<'_>, (Stage, LakeError)> {
        match &self.elevation {
            ElevationSource::Strips { index, fetcher } => {
                let descriptor = StripSelector::new(index, self.engine.as_ref())
                    .select(scene_footprint, self.config.buffer_distance, self.config.max_strips)
                    .at(Stage::StripSelection)?;
                Ok(SceneElevation::Strips { descriptor, fetcher })
            }
            ElevationSource::Raster(path) => Ok(SceneElevation::Raster(GdalRaster::open(path).at(Stage::MosaicBuild)?)),
        }
    }

    /// Process independent scenes in parallel. A failing scene is reported
    /// and does not stop the others; a scene without overlap is skipped.
    /// Tiles of all completed scenes are partitioned into `tiles/splits.json`.
    /// Scenes whose tag repeats an earlier scene's fail without running, since
    /// they would write the same rasters and tiles.
    pub fn run_batch(&self, scenes: &[PathBuf], out_root: &Path) -> LakeResult<BatchReport> {
        log::info!("Batch: {} scene(s) -> {}", scenes.len(), out_root.display());
        std::fs::create_dir_all(out_root)?;

        let mut claimed: HashMap<String, &Path> = HashMap::new();
        let duplicates: Vec<Option<String>> = scenes
            .iter()
            .map(|scene| {
                let tag = SceneId::parse(&bundle_name(scene)).tag();
                match claimed.get(&tag) {
                    Some(first) => Some(format!("tag {} is already used by {}", tag, first.display())),
                    None => {
                        claimed.insert(tag, scene);
                        None
                    }
                }
            })
            .collect();

        let outcomes: Vec<SceneOutcome> = scenes
            .par_iter()
            .zip(duplicates.par_iter())
            .map(|(scene, duplicate)| match duplicate {
                Some(reason) => {
                    let failure = SceneFailure {
                        scene_id: bundle_name(scene),
                        stage: Stage::ResolveReference,
                        error: LakeError::InvalidInput(reason.clone()),
                    };
                    log::error!("{}", failure);
                    SceneOutcome::Failed(failure)
                }
                None => self.scene_outcome(scene, out_root),
            })
            .collect();

        let report = BatchReport { outcomes };
        let ids = report.tile_ids();
        if !ids.is_empty() {
            partition_tiles(&ids, &self.config.split).write_json(out_root.join(TILES_DIR).join("splits.json"))?;
        }
        log::info!(
            "Batch finished: {} completed, {} skipped, {} failed",
            report.completed(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }

    fn scene_outcome(&self, scene: &Path, out_root: &Path) -> SceneOutcome {
        match self.process_scene(scene, out_root) {
            Ok(report) => SceneOutcome::Completed(report),
            Err(failure) if failure.error.is_skippable() => {
                log::warn!("Skipping scene {}: {}", failure.scene_id, failure.error);
                SceneOutcome::Skipped {
                    scene_id: failure.scene_id,
                    reason: failure.error.to_string(),
                }
            }
            Err(failure) => {
                log::error!("{}", failure);
                SceneOutcome::Failed(failure)
            }
        }
    }
}

fn bundle_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Band 1 of a scene raster on its own grid
fn band_raster(raster: &GdalRaster) -> LakeResult<AlignedRaster> {
    AlignedRaster::new(raster.read_band(1)?, raster.source().grid(), raster.fill_value())
}

/// Tile every `<tag>_ndwi.tif` / `<tag>_lake_mask.tif` pair found in `in_dir`
pub fn tile_directory<P: AsRef<Path>, Q: AsRef<Path>>(
    in_dir: P,
    out_root: Q,
    config: &PipelineConfig,
) -> LakeResult<Vec<TilingSummary>> {
    let tiler = Tiler::from_config(config)?;
    let mut summaries = Vec::new();
    for (tag, index_path, mask_path) in find_raster_pairs(in_dir)? {
        let index = read_aligned(&index_path)?;
        let mask = read_mask(&mask_path)?;
        summaries.push(tiler.tile_pair(&tag, &index, &mask, out_root.as_ref())?);
    }
    let ids: Vec<String> = summaries.iter().flat_map(|s| s.ids.iter().cloned()).collect();
    if !ids.is_empty() {
        partition_tiles(&ids, &config.split).write_json(out_root.as_ref().join("splits.json"))?;
    }
    log::info!("Done. Total tiles written: {}", ids.len());
    Ok(summaries)
}
