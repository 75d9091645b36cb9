use meltprep::config::{SplitConfig, TileConfig, TileFormat};
use meltprep::core::tiler::{partition_tiles, tile_offsets, verify_tile_pairs, Tiler};
use meltprep::types::{AlignedRaster, CrsDescriptor, GeoTransform, MaskRaster, RasterGrid};
use ndarray::{s, Array2};
use std::collections::HashSet;

fn grid(width: usize, height: usize) -> RasterGrid {
    RasterGrid {
        crs: CrsDescriptor::from_epsg(32622),
        transform: GeoTransform::north_up(500000.0, 7600000.0, 10.0, -10.0),
        width,
        height,
    }
}

fn pair(width: usize, height: usize) -> (AlignedRaster, MaskRaster) {
    let data = Array2::from_shape_fn((height, width), |(r, c)| ((r * width + c) % 200) as f32 / 100.0 - 1.0);
    let mask = data.mapv(|v| v > 0.5);
    (
        AlignedRaster::new(data, grid(width, height), f32::NAN).expect("grid"),
        MaskRaster {
            data: mask,
            grid: grid(width, height),
        },
    )
}

fn tiler(size: usize, stride: usize) -> Tiler {
    let config = TileConfig {
        size,
        stride,
        keep_empty: true,
        format: TileFormat::Npz,
        index_fill_value: 0.0,
    };
    Tiler::new(&config, 1e-6).expect("valid tile config")
}

#[test]
fn test_stride_equal_to_size_covers_every_pixel_once() {
    let (image, mask) = pair(96, 64);
    let tiles = tiler(32, 32).extract("scene", &image, &mask).expect("extract");
    assert_eq!(tiles.len(), 6);

    let mut rebuilt = Array2::<f32>::from_elem((64, 96), f32::NAN);
    for tile in &tiles {
        let (r, c) = (tile.offset.row, tile.offset.col);
        let mut target = rebuilt.slice_mut(s![r..r + 32, c..c + 32]);
        assert!(target.iter().all(|v| v.is_nan()), "tile {} overlaps another", tile.id);
        target.assign(&tile.image);
    }
    assert_eq!(rebuilt, image.data);
}

#[test]
fn test_overlapping_tiles_are_deterministic() {
    let (image, mask) = pair(80, 80);
    let t = tiler(32, 16);
    let first = t.extract("scene", &image, &mask).expect("extract");
    let second = t.extract("scene", &image, &mask).expect("extract");
    assert_eq!(first.len(), 16);
    let ids: Vec<&str> = first.iter().map(|t| t.id.as_str()).collect();
    let again: Vec<&str> = second.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, again);
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.image, b.image);
        assert_eq!(a.mask, b.mask);
    }
}

#[test]
fn test_raster_smaller_than_tile_yields_nothing() {
    assert!(tile_offsets(100, 300, 256, 128).expect("offsets").is_empty());
    let (image, mask) = pair(100, 100);
    assert!(tiler(256, 128).extract("small", &image, &mask).expect("extract").is_empty());
}

#[test]
fn test_written_tile_set_is_paired_and_partitioned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (image, mask) = pair(64, 64);
    let summary = tiler(32, 32)
        .tile_pair("2019-07-04_T22WDA", &image, &mask, dir.path())
        .expect("tile pair");
    assert_eq!(summary.ids.len(), 4);
    assert_eq!(summary.ids[0], "2019-07-04_T22WDA_y0_x0");

    let report = verify_tile_pairs(dir.path()).expect("verify");
    assert!(report.is_consistent());
    assert_eq!((report.images, report.masks), (4, 4));

    let split = SplitConfig {
        train: 0.5,
        validation: 0.25,
    };
    let splits = partition_tiles(&summary.ids, &split);
    assert_eq!((splits.train.len(), splits.validation.len(), splits.test.len()), (2, 1, 1));
    let all: HashSet<&String> = splits.train.iter().chain(&splits.validation).chain(&splits.test).collect();
    assert_eq!(all.len(), 4);
}
