//! meltprep: aligned raster and tile preparation for supraglacial lake segmentation
//!
//! Takes multispectral scenes and a catalogue of elevation strips, builds an
//! elevation mosaic over each scene, resamples it onto the scene grid, derives
//! a water index and a lake mask, and cuts the result into training tiles.

pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use config::{PipelineConfig, ResamplingMethod, TileConfig, TileFormat};
pub use pipeline::{BatchReport, ElevationSource, Pipeline, SceneFailure, SceneOutcome, SceneReport, Stage};
pub use types::{
    AlignedRaster, BoundingBox, CrsDescriptor, GeoTransform, LakeError, LakeResult, MaskRaster, RasterGrid,
    RasterSource,
};

pub use io::{StripFetcher, StripIndex};
