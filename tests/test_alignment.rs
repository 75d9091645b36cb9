use approx::assert_relative_eq;
use meltprep::config::{PipelineConfig, ResamplingMethod};
use meltprep::core::align::GridAligner;
use meltprep::core::clip::FootprintClipper;
use meltprep::core::crs::GdalEngine;
use meltprep::core::footprint::{check_overlap, Footprint};
use meltprep::core::index::{index_from_bands, MaskGenerator};
use meltprep::core::mosaic::MosaicRaster;
use meltprep::core::tiler::{verify_tile_pairs, Tiler};
use meltprep::io::{MemoryRaster, RasterRead};
use meltprep::types::{AlignedRaster, BoundingBox, CrsDescriptor, GeoTransform, RasterGrid};
use ndarray::Array2;

const NODATA: f32 = -9999.0;

fn utm() -> CrsDescriptor {
    CrsDescriptor::from_epsg(32622)
}

/// 64 x 64 scene at 10 m with its top-left corner at (500000, 7600000)
fn scene_grid() -> RasterGrid {
    RasterGrid {
        crs: utm(),
        transform: GeoTransform::north_up(500000.0, 7600000.0, 10.0, -10.0),
        width: 64,
        height: 64,
    }
}

/// Two overlapping 20 m strips covering the scene: the west one at 100 m,
/// the east one at 300 m
fn strips() -> MosaicRaster {
    let west_grid = RasterGrid {
        crs: utm(),
        transform: GeoTransform::north_up(499800.0, 7600200.0, 20.0, -20.0),
        width: 30,
        height: 50,
    };
    let east_grid = RasterGrid {
        crs: utm(),
        transform: GeoTransform::north_up(500300.0, 7600200.0, 20.0, -20.0),
        width: 30,
        height: 50,
    };
    let west = MemoryRaster::from_grid("west", &west_grid, Array2::from_elem((50, 30), 100.0), Some(NODATA as f64))
        .expect("west strip");
    let east = MemoryRaster::from_grid("east", &east_grid, Array2::from_elem((50, 30), 300.0), Some(NODATA as f64))
        .expect("east strip");
    let members: Vec<Box<dyn RasterRead>> = vec![Box::new(west), Box::new(east)];
    MosaicRaster::new("mosaic", members, NODATA).expect("mosaic")
}

#[test]
fn test_mosaic_aligns_onto_scene_grid() {
    let engine = GdalEngine::new();
    let config = PipelineConfig {
        resampling: ResamplingMethod::Nearest,
        ..PipelineConfig::default()
    };
    let mosaic = strips();
    let dem = GridAligner::new(&engine, &config)
        .align(&mosaic, 1, &scene_grid())
        .expect("aligned dem");

    // Output grid is the target grid verbatim
    assert_eq!(dem.grid, scene_grid());
    assert_eq!(dem.coverage(), 1.0);
    assert_eq!(dem.data[[10, 5]], 100.0);
    // Strips overlap between x=500300 and x=500400; the first member wins there
    assert_eq!(dem.data[[10, 35]], 100.0);
    // Only the east strip reaches the far columns
    assert_eq!(dem.data[[10, 63]], 300.0);
}

#[test]
fn test_scene_to_tiles_in_memory() {
    let engine = GdalEngine::new();
    let mut config = PipelineConfig::default();
    config.elevation_ceiling = Some(200.0);
    config.tile.size = 32;
    config.tile.stride = 32;

    let grid = scene_grid();
    // Water in the west half (green > nir), land in the east half
    let green = Array2::from_shape_fn((64, 64), |(_, c)| if c < 32 { 0.30f32 } else { 0.10 });
    let nir = Array2::from_shape_fn((64, 64), |(_, c)| if c < 32 { 0.05f32 } else { 0.30 });
    let green = AlignedRaster::new(green, grid.clone(), f32::NAN).expect("green");
    let nir = AlignedRaster::new(nir, grid.clone(), f32::NAN).expect("nir");

    let mosaic = strips();
    let scene_fp = Footprint::from_bbox(&grid.bounds(), utm());
    let mosaic_fp = Footprint::from_bbox(&mosaic.source().bounds(), utm());
    let overlap = check_overlap(&scene_fp, &mosaic_fp, &engine).expect("overlap");
    assert!(overlap.overlaps);
    assert_relative_eq!(overlap.ratio, 1.0, epsilon = 1e-9);

    let dem = GridAligner::new(&engine, &config).align(&mosaic, 1, &grid).expect("dem");
    let clipper = FootprintClipper::new();
    let dem = clipper.clip(&dem, &overlap.intersection).expect("clip dem");
    let green = clipper.clip(&green, &overlap.intersection).expect("clip green");
    let nir = clipper.clip(&nir, &overlap.intersection).expect("clip nir");
    assert_eq!(dem.grid, green.grid);
    assert_eq!(green.grid, nir.grid);

    let ndwi = index_from_bands(&green, &nir, config.transform_tolerance).expect("index");
    assert_relative_eq!(ndwi.data[[0, 0]], 0.25 / 0.35, epsilon = 1e-6);
    assert_relative_eq!(ndwi.data[[0, 63]], -0.5, epsilon = 1e-6);

    let mask = MaskGenerator::from_config(&config).generate(&ndwi, Some(&dem)).expect("mask");
    // All water lies on the 100 m strip and passes the ceiling
    assert_eq!(mask.positive_count(), 64 * 32);
    assert!(mask.data[[5, 0]]);
    assert!(mask.data[[5, 31]]);
    assert!(!mask.data[[5, 40]]);

    let dir = tempfile::tempdir().expect("tempdir");
    let summary = Tiler::from_config(&config)
        .expect("tiler")
        .tile_pair("synthetic", &ndwi, &mask, dir.path())
        .expect("tiles");
    assert_eq!(summary.windows, 4);
    assert_eq!(summary.empty_windows, 2);
    assert_eq!(summary.ids.len(), 4);
    assert!(verify_tile_pairs(dir.path()).expect("verify").is_consistent());
}

#[test]
fn test_partial_clip_keeps_pixel_grid() {
    let engine = GdalEngine::new();
    let config = PipelineConfig::default();
    let dem = GridAligner::new(&engine, &config)
        .align(&strips(), 1, &scene_grid())
        .expect("dem");
    let fp = Footprint::from_bbox(&BoundingBox::new(500105.0, 7599705.0, 500395.0, 7599895.0), utm());
    let clipped = FootprintClipper::new().clip(&dem, &fp).expect("clip");
    let gt = clipped.grid.transform;
    assert_eq!((gt.top_left_x, gt.top_left_y), (500100.0, 7599900.0));
    assert_eq!((gt.pixel_width, gt.pixel_height), (10.0, -10.0));
    assert_eq!(clipped.shape(), (20, 30));
}
