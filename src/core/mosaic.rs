use crate::core::crs::ReferenceSystemEngine;
use crate::core::footprint::Footprint;
use crate::io::fetch::StripFetcher;
use crate::io::raster::{GdalRaster, RasterRead};
use crate::io::strip_index::{rewrite_resolution, StripIndex, StripIndexEntry};
use crate::types::{BoundingBox, GeoTransform, LakeError, LakeResult, PixelWindow, RasterImage, RasterSource};
use chrono::NaiveDate;
use gdal::Dataset;
use geo::BooleanOps;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// A selected strip and how much of the search area it covers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripRef {
    pub id: String,
    pub location: String,
    pub acquired: Option<NaiveDate>,
    /// Intersection with the buffered search area, index CRS units squared
    pub intersection_area: f64,
}

/// Ordered strip references (best first) plus their combined footprint.
/// Holds no pixels; see [`MosaicRaster`] for reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicDescriptor {
    pub strips: Vec<StripRef>,
    /// Union of the selected strip footprints, in the index CRS
    pub footprint: Footprint,
    /// Buffered target footprint the selection was made against
    pub search_area: Footprint,
}

impl MosaicDescriptor {
    pub fn len(&self) -> usize {
        self.strips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strips.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.strips.iter().map(|s| s.id.as_str()).collect()
    }

    /// Unique locations in rank order
    pub fn locations(&self) -> Vec<&str> {
        let mut seen = Vec::with_capacity(self.strips.len());
        for strip in &self.strips {
            if !seen.contains(&strip.location.as_str()) {
                seen.push(strip.location.as_str());
            }
        }
        seen
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> LakeResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| LakeError::Serialization(format!("Failed to encode mosaic manifest: {}", e)))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> LakeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| {
            LakeError::Serialization(format!("Failed to parse mosaic manifest {}: {}", path.as_ref().display(), e))
        })
    }

    /// Write `dem_urls_raw.txt`, `dem_urls_2m.txt`, `dem_urls_10m.txt` and
    /// the JSON manifest `mosaic.json` into `dir`.
    pub fn write_url_lists<P: AsRef<Path>>(&self, dir: P) -> LakeResult<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let raw = self.locations();
        let join = |urls: Vec<String>| {
            let mut text = urls.join("\n");
            text.push('\n');
            text
        };
        std::fs::write(dir.join("dem_urls_raw.txt"), join(raw.iter().map(|u| u.to_string()).collect()))?;
        std::fs::write(dir.join("dem_urls_2m.txt"), join(raw.iter().map(|u| rewrite_resolution(u, "2m")).collect()))?;
        std::fs::write(dir.join("dem_urls_10m.txt"), join(raw.iter().map(|u| rewrite_resolution(u, "10m")).collect()))?;
        self.to_json_file(dir.join("mosaic.json"))?;
        log::info!("Wrote strip lists for {} location(s) to {}", raw.len(), dir.display());
        Ok(())
    }
}

/// Picks the strips of an index that cover a target footprint
pub struct StripSelector<'a> {
    index: &'a StripIndex,
    engine: &'a dyn ReferenceSystemEngine,
}

impl<'a> StripSelector<'a> {
    pub fn new(index: &'a StripIndex, engine: &'a dyn ReferenceSystemEngine) -> Self {
        Self { index, engine }
    }

    /// Buffer the target, move the buffer into the index CRS and keep the
    /// intersecting entries, best coverage first. Ties go to the newer
    /// acquisition, then to the smaller id.
    pub fn select(
        &self,
        target: &Footprint,
        buffer_distance: f64,
        max_strips: Option<usize>,
    ) -> LakeResult<MosaicDescriptor> {
        let search_area = target.buffer(buffer_distance).reproject(self.engine, &self.index.crs)?;

        let mut candidates: Vec<(&StripIndexEntry, f64)> = Vec::new();
        for entry in &self.index.entries {
            let footprint = entry.footprint.reproject(self.engine, &self.index.crs)?;
            let area = search_area.intersection(&footprint)?.area();
            if area > 0.0 {
                candidates.push((entry, area));
            }
        }

        log::info!(
            "Found {} overlapping strips of {} in index",
            candidates.len(),
            self.index.len()
        );
        if candidates.is_empty() {
            return Err(LakeError::NoOverlap(format!(
                "no strip in the index intersects the search area (buffer {})",
                buffer_distance
            )));
        }

        candidates.sort_by(|(a, area_a), (b, area_b)| {
            area_b
                .partial_cmp(area_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.acquired.cmp(&a.acquired))
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(max) = max_strips {
            candidates.truncate(max.max(1));
        }

        let mut combined = Footprint::empty(self.index.crs.clone());
        for (entry, _) in &candidates {
            combined.geometry = combined.geometry.union(&entry.footprint.geometry);
        }

        let strips: Vec<StripRef> = candidates
            .iter()
            .map(|(entry, area)| StripRef {
                id: entry.id.clone(),
                location: entry.location.clone(),
                acquired: entry.acquired,
                intersection_area: *area,
            })
            .collect();
        for strip in &strips {
            log::debug!("  {} area={:.1} acquired={:?}", strip.id, strip.intersection_area, strip.acquired);
        }
        log::info!("Selected top {} strips (max-strips={:?})", strips.len(), max_strips);

        Ok(MosaicDescriptor {
            strips,
            footprint: combined,
            search_area,
        })
    }
}

/// Composite raster over several members sharing one CRS.
///
/// The composite grid spans the union of member extents at the finest member
/// resolution. Each output pixel takes the first valid member value at its
/// center, members being tried in rank order.
pub struct MosaicRaster {
    source: RasterSource,
    members: Vec<Box<dyn RasterRead>>,
}

impl MosaicRaster {
    pub fn new(id: &str, members: Vec<Box<dyn RasterRead>>, nodata: f32) -> LakeResult<Self> {
        let first = members
            .first()
            .ok_or_else(|| LakeError::InvalidInput(format!("Mosaic {} has no members", id)))?
            .source()
            .clone();

        let mut bounds = first.bounds();
        let mut pixel_size = first.transform.pixel_width.abs().min(first.transform.pixel_height.abs());
        let mut band_count = first.band_count;
        for member in &members {
            let src = member.source();
            if !src.crs.same_as(&first.crs) {
                return Err(LakeError::Metadata(format!(
                    "Mosaic {}: member {} is in {}, expected {}",
                    id, src.id, src.crs, first.crs
                )));
            }
            if src.transform.is_rotated() {
                return Err(LakeError::InvalidInput(format!(
                    "Mosaic {}: rotated member {} is not supported",
                    id, src.id
                )));
            }
            bounds = bounds.union(&src.bounds());
            pixel_size = pixel_size
                .min(src.transform.pixel_width.abs())
                .min(src.transform.pixel_height.abs());
            band_count = band_count.min(src.band_count);
        }

        let width = (bounds.width() / pixel_size).ceil().max(1.0) as usize;
        let height = (bounds.height() / pixel_size).ceil().max(1.0) as usize;
        let source = RasterSource {
            id: id.to_string(),
            crs: first.crs.clone(),
            transform: GeoTransform::north_up(bounds.min_x, bounds.max_y, pixel_size, -pixel_size),
            width,
            height,
            band_count,
            nodata: Some(nodata as f64),
        };
        log::info!(
            "Mosaic {}: {} member(s), {}x{} px at {} units",
            id,
            members.len(),
            width,
            height,
            pixel_size
        );
        Ok(Self { source, members })
    }

    /// Compose raster files (in rank order) into one mosaic
    pub fn from_paths(id: &str, paths: &[PathBuf], nodata: f32) -> LakeResult<Self> {
        let members = paths
            .iter()
            .map(|p| GdalRaster::open(p).map(|r| Box::new(r) as Box<dyn RasterRead>))
            .collect::<LakeResult<Vec<_>>>()?;
        Self::new(id, members, nodata)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Resolve every strip of a descriptor to a local raster path, in rank order
pub fn fetch_strips(descriptor: &MosaicDescriptor, fetcher: &StripFetcher) -> LakeResult<Vec<PathBuf>> {
    descriptor
        .strips
        .iter()
        .map(|strip| fetcher.fetch(&strip.id, &strip.location))
        .collect()
}

/// Member pixel window covering a world-space box
fn covering_window(transform: &GeoTransform, bbox: &BoundingBox) -> Option<PixelWindow> {
    let corners = [
        (bbox.min_x, bbox.min_y),
        (bbox.min_x, bbox.max_y),
        (bbox.max_x, bbox.min_y),
        (bbox.max_x, bbox.max_y),
    ];
    let mut c0 = f64::INFINITY;
    let mut r0 = f64::INFINITY;
    let mut c1 = f64::NEG_INFINITY;
    let mut r1 = f64::NEG_INFINITY;
    for (x, y) in corners {
        let (c, r) = transform.world_to_pixel(x, y)?;
        c0 = c0.min(c);
        r0 = r0.min(r);
        c1 = c1.max(c);
        r1 = r1.max(r);
    }
    let col_off = c0.floor() as isize;
    let row_off = r0.floor() as isize;
    let width = (c1.ceil() as isize - col_off).max(1) as usize;
    let height = (r1.ceil() as isize - row_off).max(1) as usize;
    Some(PixelWindow::new(col_off, row_off, width, height))
}

impl RasterRead for MosaicRaster {
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
        let (height, width) = (window.height, window.width);
        let mut out = Array2::from_elem((height, width), self.fill_value());
        let mut filled = Array2::from_elem((height, width), false);
        let gt = self.source.transform;
        let window_bounds = gt.shifted(window.col_off, window.row_off).bounds(width, height);

        for member in &self.members {
            let ms = member.source();
            if ms.bounds().intersection(&window_bounds).is_none() {
                continue;
            }
            let member_window = match covering_window(&ms.transform, &window_bounds)
                .and_then(|w| w.clamp_to(ms.width, ms.height))
            {
                Some(w) => w,
                None => continue,
            };
            let block = member.read_window(band, member_window)?;
            let member_nodata = ms.nodata.map(|v| v as f32);

            for r in 0..height {
                for c in 0..width {
                    if filled[[r, c]] {
                        continue;
                    }
                    let (x, y) = gt.pixel_to_world(
                        window.col_off as f64 + c as f64 + 0.5,
                        window.row_off as f64 + r as f64 + 0.5,
                    );
                    let (mc, mr) = match ms.transform.world_to_pixel(x, y) {
                        Some((mc, mr)) => (mc.floor() as isize, mr.floor() as isize),
                        None => continue,
                    };
                    let bc = mc - member_window.col_off;
                    let br = mr - member_window.row_off;
                    if bc < 0 || br < 0 || bc >= member_window.width as isize || br >= member_window.height as isize {
                        continue;
                    }
                    let value = block[[br as usize, bc as usize]];
                    if value.is_nan() || member_nodata == Some(value) {
                        continue;
                    }
                    out[[r, c]] = value;
                    filled[[r, c]] = true;
                }
            }
            if filled.iter().all(|f| *f) {
                break;
            }
        }
        Ok(out)
    }
}

/// Persist fetched strips (rank order) as a GDAL VRT. Sources are listed
/// in reverse rank so the best strip is drawn last and wins overlaps.
pub fn write_vrt<P: AsRef<Path>>(raster_paths: &[PathBuf], output_path: P) -> LakeResult<()> {
    if raster_paths.is_empty() {
        return Err(LakeError::InvalidInput("No rasters to build a VRT from".to_string()));
    }
    let datasets = raster_paths
        .iter()
        .rev()
        .map(|p| Dataset::open(p).map_err(LakeError::from))
        .collect::<LakeResult<Vec<Dataset>>>()?;
    let vrt = gdal::programs::raster::build_vrt(Some(output_path.as_ref()), datasets.as_slice(), None)?;
    drop(vrt);
    log::info!("VRT written: {}", output_path.as_ref().display());
    Ok(())
}
