use crate::config::FetchConfig;
use crate::io::strip_index::rewrite_resolution;
use crate::types::{LakeError, LakeResult};
use flate2::read::GzDecoder;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::ZipArchive;

/// Resolves strip locations to GDAL-openable paths, downloading into a cache
/// when the location is remote.
pub struct StripFetcher {
    config: FetchConfig,
    cache_dir: PathBuf,
}

impl StripFetcher {
    pub fn new(config: &FetchConfig) -> LakeResult<Self> {
        let cache_dir = config.resolved_cache_dir();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            config: config.clone(),
            cache_dir,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// GDAL-openable path of the elevation raster behind `location`
    pub fn fetch(&self, strip_id: &str, location: &str) -> LakeResult<PathBuf> {
        let local = if is_remote(location) {
            self.fetch_remote(strip_id, location)?
        } else {
            let path = PathBuf::from(location);
            if !path.exists() {
                return Err(LakeError::Fetch(format!(
                    "Strip {}: local file {} does not exist",
                    strip_id,
                    path.display()
                )));
            }
            path
        };
        self.open_payload(strip_id, &local)
    }

    fn fetch_remote(&self, strip_id: &str, url: &str) -> LakeResult<PathBuf> {
        match self.download_cached(url) {
            Ok(path) => Ok(path),
            Err(primary) if url.contains("/10m/") || url.contains("_10m_") => {
                let fallback = rewrite_resolution(url, "2m");
                log::warn!("Strip {}: 10m variant failed ({}), trying 2m: {}", strip_id, primary, fallback);
                self.download_cached(&fallback)
            }
            Err(e) => Err(e),
        }
    }

    fn download_cached(&self, url: &str) -> LakeResult<PathBuf> {
        let file_name = url
            .split('?')
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LakeError::Fetch(format!("Cannot derive file name from {}", url)))?;
        let output_path = self.cache_dir.join(file_name);

        if let Ok(meta) = std::fs::metadata(&output_path) {
            if meta.len() > 0 {
                log::info!("Strip file {} already cached, skipping download", file_name);
                return Ok(output_path);
            }
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .user_agent("meltprep/0.1.0 (elevation strip fetch)")
            .build()
            .map_err(|e| LakeError::Fetch(format!("Failed to create HTTP client: {}", e)))?;

        let max_retries = self.config.max_attempts;
        let mut last_error = None;
        for attempt in 1..=max_retries {
            log::debug!("Download attempt {} of {} for {}", attempt, max_retries, url);
            match self.try_download_once(&client, url, &output_path) {
                Ok(()) => {
                    log::info!("Downloaded {} to {}", url, output_path.display());
                    return Ok(output_path);
                }
                Err(e) => {
                    log::warn!("Download attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < max_retries {
                        std::thread::sleep(Duration::from_secs(self.config.retry_delay_secs));
                    }
                }
            }
        }

        Err(LakeError::Fetch(format!(
            "{} failed after {} attempts: {}",
            url,
            max_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Single download attempt; the body lands in a temp file that is only
    /// renamed into the cache once complete.
    fn try_download_once(&self, client: &reqwest::blocking::Client, url: &str, output_path: &Path) -> LakeResult<()> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| LakeError::Fetch(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LakeError::Fetch(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                url
            )));
        }

        let content = response
            .bytes()
            .map_err(|e| LakeError::Fetch(format!("Failed to read response body: {}", e)))?;

        // Strip rasters are never this small; this is an HTML error page
        if content.len() < 1024 {
            return Err(LakeError::Fetch(format!(
                "Downloaded file too small ({} bytes), likely an error page",
                content.len()
            )));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(&content)?;
        tmp.persist(output_path)
            .map_err(|e| LakeError::Fetch(format!("Failed to move download into cache: {}", e)))?;
        Ok(())
    }

    /// Turn a downloaded or local file into a raster path: plain rasters pass
    /// through, `.gz` and `.zip` are unpacked next to the archive, tarballs are
    /// read in place through `/vsitar/`.
    fn open_payload(&self, strip_id: &str, path: &Path) -> LakeResult<PathBuf> {
        let name = path.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar") {
            let vsi_root = format!("/vsitar/{}", path.display());
            let member = list_archive_members(&vsi_root)?
                .into_iter()
                .filter(|m| is_dem_member(m))
                .min()
                .ok_or_else(|| LakeError::Fetch(format!("Strip {}: no DEM raster inside {}", strip_id, path.display())))?;
            Ok(PathBuf::from(format!("{}/{}", vsi_root, member)))
        } else if name.ends_with(".gz") {
            let target = path.with_extension("");
            if !target.exists() {
                extract_gzip(path, &target)?;
            }
            Ok(target)
        } else if name.ends_with(".zip") {
            extract_zip_member(strip_id, path)
        } else {
            Ok(path.to_path_buf())
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn is_dem_member(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with("_dem.tif") || lower.ends_with("_dem.tiff")
}

fn extract_gzip(archive: &Path, target: &Path) -> LakeResult<()> {
    log::debug!("Decompressing {} -> {}", archive.display(), target.display());
    let decoder = GzDecoder::new(File::open(archive)?);
    persist_stream(decoder, target)
        .map_err(|e| LakeError::Fetch(format!("Failed to decompress {}: {}", archive.display(), e)))
}

/// Stream `reader` into a temp file beside `target` and rename it into place,
/// so a reader of `target` never sees a partial file.
fn persist_stream(mut reader: impl Read, target: &Path) -> LakeResult<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::copy(&mut reader, &mut tmp)?;
    tmp.flush()?;
    tmp.persist(target)
        .map_err(|e| LakeError::Fetch(format!("Failed to move {} into place: {}", target.display(), e)))?;
    Ok(())
}

/// Extract the DEM member (or the only GeoTIFF) of a zip archive next to it
fn extract_zip_member(strip_id: &str, archive_path: &Path) -> LakeResult<PathBuf> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)
        .map_err(|e| LakeError::Fetch(format!("Unreadable zip {}: {}", archive_path.display(), e)))?;
    let mut names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    names.sort();
    let member = names
        .iter()
        .find(|n| is_dem_member(n))
        .or_else(|| names.iter().find(|n| n.to_lowercase().ends_with(".tif")))
        .cloned()
        .ok_or_else(|| LakeError::Fetch(format!("Strip {}: no GeoTIFF inside {}", strip_id, archive_path.display())))?;

    let file_name = member.rsplit('/').next().unwrap_or(&member).to_string();
    let target = archive_path
        .parent()
        .map(|p| p.join(&file_name))
        .unwrap_or_else(|| PathBuf::from(&file_name));
    if target.exists() {
        return Ok(target);
    }
    let entry = archive
        .by_name(&member)
        .map_err(|e| LakeError::Fetch(format!("Failed to access {}: {}", member, e)))?;
    persist_stream(entry, &target)?;
    Ok(target)
}

/// Recursive listing of a GDAL virtual directory (e.g. `/vsitar/...`)
fn list_archive_members(vsi_path: &str) -> LakeResult<Vec<String>> {
    let c_path = CString::new(vsi_path)
        .map_err(|e| LakeError::Fetch(format!("Invalid archive path {}: {}", vsi_path, e)))?;
    let mut names = Vec::new();
    unsafe {
        let list = gdal_sys::VSIReadDirRecursive(c_path.as_ptr());
        if list.is_null() {
            return Err(LakeError::Fetch(format!("Cannot list archive {}", vsi_path)));
        }
        let count = gdal_sys::CSLCount(list as _);
        for i in 0..count {
            let item = gdal_sys::CSLGetField(list as _, i);
            if !item.is_null() {
                names.push(CStr::from_ptr(item).to_string_lossy().into_owned());
            }
        }
        gdal_sys::CSLDestroy(list);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn fetcher(dir: &Path) -> StripFetcher {
        let config = FetchConfig {
            cache_dir: Some(dir.to_path_buf()),
            ..FetchConfig::default()
        };
        StripFetcher::new(&config).unwrap()
    }

    #[test]
    fn test_local_plain_file_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strip_dem.tif");
        std::fs::write(&path, b"not really a tif").unwrap();
        let resolved = fetcher(dir.path()).fetch("s1", path.to_str().unwrap()).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn test_missing_local_file_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = fetcher(dir.path()).fetch("s1", "/definitely/not/here_dem.tif");
        assert!(matches!(result, Err(LakeError::Fetch(_))));
    }

    #[test]
    fn test_gzip_payload_is_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("strip_dem.tif.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        encoder.finish().unwrap();

        let resolved = fetcher(dir.path()).fetch("s1", gz_path.to_str().unwrap()).unwrap();
        assert_eq!(resolved, dir.path().join("strip_dem.tif"));
        assert_eq!(std::fs::read(&resolved).unwrap(), b"payload");
    }

    #[test]
    fn test_truncated_gzip_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("strip_dem.tif.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&vec![7u8; 64 * 1024]).unwrap();
        let bytes = encoder.finish().unwrap();
        std::fs::write(&gz_path, &bytes[..bytes.len() / 2]).unwrap();

        let result = fetcher(dir.path()).fetch("s1", gz_path.to_str().unwrap());
        assert!(matches!(result, Err(LakeError::Fetch(_))));
        assert!(!dir.path().join("strip_dem.tif").exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_concurrent_extraction_of_one_archive() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("strip_dem.tif.gz");
        let payload = vec![3u8; 256 * 1024];
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();

        let fetcher = fetcher(dir.path());
        let location = gz_path.to_str().unwrap();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|| fetcher.fetch("s1", location))).collect();
            for handle in handles {
                let resolved = handle.join().unwrap().unwrap();
                assert_eq!(std::fs::read(&resolved).unwrap(), payload);
            }
        });
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["strip_dem.tif", "strip_dem.tif.gz"]);
    }

    #[test]
    fn test_failed_10m_download_retries_then_falls_back_to_2m() {
        use std::net::TcpListener;
        use std::sync::{Arc, Mutex};

        // Accepts connections, records the request path and hangs up
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&requests);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 2048];
                let n = stream.read(&mut buf).unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).into_owned();
                let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
                seen.lock().unwrap().push(path);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            max_attempts: 2,
            retry_delay_secs: 0,
            timeout_secs: 5,
            cache_dir: Some(dir.path().to_path_buf()),
        };
        let fetcher = StripFetcher::new(&config).unwrap();
        let url = format!("http://127.0.0.1:{}/strips/10m/s1_10m_dem.tif", port);

        match fetcher.fetch("s1", &url) {
            Err(LakeError::Fetch(msg)) => {
                assert!(msg.contains("/strips/2m/s1_2m_dem.tif"), "{}", msg);
                assert!(msg.contains("after 2 attempts"), "{}", msg);
            }
            other => panic!("expected a fetch error, got {:?}", other),
        }

        let mut paths = requests.lock().unwrap().clone();
        assert!(paths.len() >= 4, "{:?}", paths);
        assert_eq!(paths.iter().filter(|p| p.contains("10m")).count(), 2);
        paths.dedup();
        assert_eq!(paths, vec!["/strips/10m/s1_10m_dem.tif", "/strips/2m/s1_2m_dem.tif"]);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_zip_payload_prefers_dem_member() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("strip.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            let options = zip::write::FileOptions::default();
            writer.start_file("strip/strip_matchtag.tif", options).unwrap();
            writer.write_all(b"mt").unwrap();
            writer.start_file("strip/strip_dem.tif", options).unwrap();
            writer.write_all(b"dem").unwrap();
            writer.finish().unwrap();
        }
        let resolved = fetcher(dir.path()).fetch("s1", zip_path.to_str().unwrap()).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "strip_dem.tif");
        assert_eq!(std::fs::read(&resolved).unwrap(), b"dem");
    }

    #[test]
    fn test_remote_detection() {
        assert!(is_remote("https://data.pgc.umn.edu/x.tar.gz"));
        assert!(!is_remote("/data/strips/x.tif"));
    }
}
