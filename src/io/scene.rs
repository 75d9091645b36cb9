use crate::io::raster::{GdalRaster, RasterRead};
use crate::types::{LakeError, LakeResult, RasterImage, RasterSource};
use chrono::NaiveDate;
use regex::Regex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zip::ZipArchive;

/// Band raster extensions found in scene bundles
const BAND_EXTENSIONS: [&str; 3] = [".jp2", ".tif", ".tiff"];

/// Identity parsed from a scene bundle name, e.g.
/// `S2A_MSIL2A_20190704T151911_N0212_R068_T22WDA_20190704T194104.SAFE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneId {
    pub name: String,
    pub acquisition_date: Option<NaiveDate>,
    pub tile: Option<String>,
    /// Product level, e.g. `MSIL2A`
    pub level: Option<String>,
    /// Processing baseline, e.g. `N0212`
    pub baseline: Option<String>,
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(\d{8})T").expect("valid date regex"))
}

fn tile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(T\d{2}[A-Z]{3})_").expect("valid tile regex"))
}

fn level_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(MSIL[0-9][A-Z])_").expect("valid level regex"))
}

fn baseline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(N\d{4})_").expect("valid baseline regex"))
}

impl SceneId {
    pub fn parse(bundle_name: &str) -> Self {
        let name = bundle_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(bundle_name)
            .to_string();
        let acquisition_date = date_regex()
            .captures(&name)
            .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y%m%d").ok());
        let capture = |re: &Regex| re.captures(&name).map(|c| c[1].to_string());
        let tile = capture(tile_regex());
        let level = capture(level_regex());
        let baseline = capture(baseline_regex());
        Self {
            name,
            acquisition_date,
            tile,
            level,
            baseline,
        }
    }

    /// Stable tag used to name every output of the scene, e.g.
    /// `2019-07-04_T22WDA_MSIL2A_N0212`. Level and baseline are appended when
    /// present so L1C/L2A products and reprocessings of one acquisition get
    /// distinct tags. Falls back to the bundle name without its extension.
    pub fn tag(&self) -> String {
        match self.acquisition_date {
            Some(date) => {
                let mut tag = format!("{}_{}", date.format("%Y-%m-%d"), self.tile.as_deref().unwrap_or("TXXXX"));
                for part in [&self.level, &self.baseline].into_iter().flatten() {
                    tag.push('_');
                    tag.push_str(part);
                }
                tag
            }
            None => self
                .name
                .trim_end_matches(".zip")
                .trim_end_matches(".SAFE")
                .to_string(),
        }
    }
}

/// A scene bundle and the band rasters inside it
#[derive(Debug, Clone)]
pub struct SceneBundle {
    pub path: PathBuf,
    pub id: SceneId,
}

impl SceneBundle {
    pub fn open<P: AsRef<Path>>(path: P) -> LakeResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(LakeError::Metadata(format!("Scene bundle not found: {}", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { id: SceneId::parse(&name), path })
    }

    pub fn is_zipped(&self) -> bool {
        self.path.is_file()
            && self
                .path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("zip"))
                .unwrap_or(false)
    }

    /// GDAL-openable path of the band whose file name contains `band_name`
    pub fn find_band_path(&self, band_name: &str) -> LakeResult<PathBuf> {
        let found = if self.is_zipped() {
            self.find_in_zip(band_name)?
                .map(|entry| PathBuf::from(format!("/vsizip/{}/{}", self.path.display(), entry)))
        } else {
            find_in_dir(&self.path, band_name)?
        };
        found.ok_or_else(|| {
            LakeError::Metadata(format!("{} not found in {}", band_name, self.path.display()))
        })
    }

    fn find_in_zip(&self, band_name: &str) -> LakeResult<Option<String>> {
        let file = File::open(&self.path)?;
        let archive = ZipArchive::new(file)
            .map_err(|e| LakeError::Metadata(format!("Unreadable scene archive {}: {}", self.path.display(), e)))?;
        let mut names: Vec<&str> = archive
            .file_names()
            .filter(|n| is_band_file(n, band_name))
            .collect();
        names.sort_unstable();
        Ok(names.first().map(|n| n.to_string()))
    }

    pub fn open_band(&self, band_name: &str) -> LakeResult<GdalRaster> {
        GdalRaster::open(self.find_band_path(band_name)?)
    }

    /// Metadata of the band that defines the scene's reference grid
    pub fn reference_source(&self, band_name: &str) -> LakeResult<RasterSource> {
        Ok(self.open_band(band_name)?.source().clone())
    }

    pub fn read_band(&self, band_name: &str) -> LakeResult<(RasterImage, RasterSource)> {
        let raster = self.open_band(band_name)?;
        let data = raster.read_band(1)?;
        Ok((data, raster.source().clone()))
    }
}

fn is_band_file(name: &str, band_name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.contains(band_name)
        && BAND_EXTENSIONS
            .iter()
            .any(|ext| file_name.to_lowercase().ends_with(ext))
}

/// Depth-first search; entries are visited in sorted order so the first
/// match is stable across runs.
fn find_in_dir(dir: &Path, band_name: &str) -> LakeResult<Option<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for entry in &entries {
        if entry.is_file() && is_band_file(&entry.to_string_lossy(), band_name) {
            return Ok(Some(entry.clone()));
        }
    }
    for entry in &entries {
        if entry.is_dir() {
            if let Some(found) = find_in_dir(entry, band_name)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// Scene bundles (`*.SAFE` directories or `*.SAFE.zip`/`*.zip` files) under a root, sorted
pub fn discover_scenes<P: AsRef<Path>>(root: P) -> LakeResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_scenes(root.as_ref(), &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_scenes(dir: &Path, found: &mut Vec<PathBuf>) -> LakeResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if path.is_dir() {
            if name.ends_with(".SAFE") {
                found.push(path);
            } else {
                collect_scenes(&path, found)?;
            }
        } else if name.ends_with(".SAFE.zip") || (name.starts_with("S2") && name.ends_with(".zip")) {
            found.push(path);
        }
    }
    Ok(())
}
