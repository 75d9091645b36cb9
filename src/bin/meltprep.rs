use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use meltprep::config::{PipelineConfig, ResamplingMethod, TileFormat};
use meltprep::core::crs::GdalEngine;
use meltprep::core::footprint::Footprint;
use meltprep::core::mosaic::StripSelector;
use meltprep::core::tiler::verify_tile_pairs;
use meltprep::io::raster::RasterRead;
use meltprep::io::{discover_scenes, SceneBundle, StripIndex};
use meltprep::pipeline::{tile_directory, Pipeline, SceneOutcome};
use meltprep::types::CrsDescriptor;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "meltprep", version, about = "Prepare aligned rasters and training tiles for meltwater-lake segmentation")]
struct Cli {
    /// JSON pipeline configuration; missing keys use defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long, global = true, allow_hyphen_values = true)]
    threshold: Option<f32>,

    #[arg(long, global = true)]
    elevation_ceiling: Option<f32>,

    #[arg(long, global = true, allow_hyphen_values = true)]
    elevation_floor: Option<f32>,

    /// Strip search buffer around the scene, in scene CRS units
    #[arg(long, global = true)]
    buffer: Option<f64>,

    #[arg(long, global = true)]
    max_strips: Option<usize>,

    /// nearest, bilinear or cubic
    #[arg(long, global = true)]
    resampling: Option<ResamplingMethod>,

    #[arg(long, global = true)]
    tile_size: Option<usize>,

    #[arg(long, global = true)]
    stride: Option<usize>,

    /// npz or tif
    #[arg(long, global = true)]
    tile_format: Option<TileFormat>,

    /// Skip tiles whose mask has no lake pixel
    #[arg(long, global = true)]
    drop_empty: bool,
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// GeoJSON catalogue of elevation strips
    #[arg(long)]
    strip_index: PathBuf,

    /// EPSG code of the catalogue geometries when the file does not say
    #[arg(long)]
    index_epsg: Option<u32>,
}

/// Elevation for `process` and `batch`: a strip catalogue or one prebuilt raster
#[derive(Args, Debug)]
struct ElevationArgs {
    /// GeoJSON catalogue of elevation strips
    #[arg(long, required_unless_present = "dem", conflicts_with = "dem")]
    strip_index: Option<PathBuf>,

    /// EPSG code of the catalogue geometries when the file does not say
    #[arg(long, requires = "strip_index")]
    index_epsg: Option<u32>,

    /// Existing elevation raster (GeoTIFF or VRT) used instead of strips
    #[arg(long)]
    dem: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage for one scene bundle
    Process {
        scene: PathBuf,
        #[command(flatten)]
        elevation: ElevationArgs,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Run every scene found under a directory
    Batch {
        scenes_root: PathBuf,
        #[command(flatten)]
        elevation: ElevationArgs,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Select elevation strips for a scene and write the mosaic manifest
    SelectStrips {
        scene: PathBuf,
        #[command(flatten)]
        index: IndexArgs,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Tile existing `<tag>_ndwi.tif` / `<tag>_lake_mask.tif` pairs
    Tile {
        input: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Check that every image tile has a mask and vice versa
    CheckTiles { root: PathBuf },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let o = &cli.overrides;
    if let Some(v) = o.threshold {
        config.index_threshold = v;
    }
    if o.elevation_ceiling.is_some() {
        config.elevation_ceiling = o.elevation_ceiling;
    }
    if o.elevation_floor.is_some() {
        config.elevation_floor = o.elevation_floor;
    }
    if let Some(v) = o.buffer {
        config.buffer_distance = v;
    }
    if o.max_strips.is_some() {
        config.max_strips = o.max_strips;
    }
    if let Some(v) = o.resampling {
        config.resampling = v;
    }
    if let Some(v) = o.tile_size {
        config.tile.size = v;
    }
    if let Some(v) = o.stride {
        config.tile.stride = v;
    }
    if let Some(v) = o.tile_format {
        config.tile.format = v;
    }
    if o.drop_empty {
        config.tile.keep_empty = false;
    }
    config.validate()?;
    Ok(config)
}

fn read_index(path: &Path, epsg: Option<u32>) -> Result<StripIndex> {
    let index = StripIndex::from_geojson_file(path, epsg.map(CrsDescriptor::from_epsg))
        .with_context(|| format!("loading strip index {}", path.display()))?;
    log::info!("Strip index: {} entries in {}", index.len(), index.crs);
    Ok(index)
}

fn build_pipeline(config: PipelineConfig, args: &ElevationArgs) -> Result<Pipeline> {
    let engine = Box::new(GdalEngine::new());
    let pipeline = match (&args.dem, &args.strip_index) {
        (Some(dem), _) => Pipeline::from_dem(config, dem, engine)
            .with_context(|| format!("opening elevation raster {}", dem.display()))?,
        (None, Some(path)) => Pipeline::new(config, read_index(path, args.index_epsg)?, engine)?,
        (None, None) => bail!("either --strip-index or --dem is required"),
    };
    Ok(pipeline)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Process { scene, elevation, out } => {
            let pipeline = build_pipeline(config, elevation)?;
            let report = pipeline.process_scene(scene, out)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Batch { scenes_root, elevation, out } => {
            let scenes = discover_scenes(scenes_root)?;
            if scenes.is_empty() {
                bail!("no scene bundles found under {}", scenes_root.display());
            }
            let pipeline = build_pipeline(config, elevation)?;
            let report = pipeline.run_batch(&scenes, out)?;
            for outcome in &report.outcomes {
                match outcome {
                    SceneOutcome::Completed(r) => println!(
                        "ok      {} ({} tiles, {} lakes)",
                        r.scene_id,
                        r.tiles.ids.len(),
                        r.lake_count
                    ),
                    SceneOutcome::Skipped { scene_id, reason } => println!("skipped {} ({})", scene_id, reason),
                    SceneOutcome::Failed(f) => println!("failed  {} at {}: {}", f.scene_id, f.stage, f.error),
                }
            }
            if report.failed() > 0 {
                bail!("{} of {} scenes failed", report.failed(), report.outcomes.len());
            }
        }
        Command::SelectStrips { scene, index, out } => {
            let strip_index = read_index(&index.strip_index, index.index_epsg)?;
            let engine = GdalEngine::new();
            let bundle = SceneBundle::open(scene)?;
            let reference = bundle.open_band(&config.green_band)?;
            let footprint = Footprint::from_source(reference.source());
            let descriptor = StripSelector::new(&strip_index, &engine).select(
                &footprint,
                config.buffer_distance,
                config.max_strips,
            )?;
            let dir = out.join(bundle.id.tag());
            descriptor.write_url_lists(&dir)?;
            for id in descriptor.ids() {
                println!("{}", id);
            }
            log::info!("Wrote {} strip(s) to {}", descriptor.len(), dir.display());
        }
        Command::Tile { input, out } => {
            let summaries = tile_directory(input, out, &config)?;
            let total: usize = summaries.iter().map(|s| s.ids.len()).sum();
            println!("{} tiles from {} raster pair(s)", total, summaries.len());
        }
        Command::CheckTiles { root } => {
            let report = verify_tile_pairs(root)?;
            println!("images: {}  masks: {}", report.images, report.masks);
            for id in &report.missing_masks {
                println!("missing mask:  {}", id);
            }
            for id in &report.missing_images {
                println!("missing image: {}", id);
            }
            if !report.is_consistent() {
                bail!("tile set under {} is inconsistent", root.display());
            }
        }
    }
    Ok(())
}
