//! Core alignment and tiling stages

pub mod align;
pub mod clip;
pub mod crs;
pub mod footprint;
pub mod index;
pub mod lakes;
pub mod mosaic;
pub mod tiler;

// Re-export main types
pub use align::GridAligner;
pub use clip::FootprintClipper;
pub use crs::{GdalEngine, IdentityTransform, PointTransform, ReferenceSystemEngine};
pub use footprint::{check_overlap, overlap_ratio, Footprint, OverlapResult};
pub use index::{label_regions, normalized_difference, threshold_mask, ElevationConstraint, MaskGenerator};
pub use lakes::{polygonize_mask, write_lakes_geojson, LakeAttributes, LakePolygon};
pub use mosaic::{MosaicDescriptor, MosaicRaster, StripRef, StripSelector};
pub use tiler::{partition_tiles, tile_offsets, verify_tile_pairs, Tile, TileOffset, Tiler, TileSplits};
