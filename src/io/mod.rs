pub mod fetch;
pub mod raster;
pub mod scene;
pub mod strip_index;

pub use fetch::StripFetcher;
pub use raster::{resolve_raster_source, write_geotiff, GdalRaster, MemoryRaster, RasterRead};
pub use scene::{discover_scenes, SceneBundle, SceneId};
pub use strip_index::{StripIndex, StripIndexEntry};
