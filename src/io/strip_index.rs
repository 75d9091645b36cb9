use crate::core::footprint::Footprint;
use crate::types::{CrsDescriptor, LakeError, LakeResult};
use chrono::NaiveDate;
use geo::{Geometry, MultiPolygon};
use geojson::{FeatureCollection, GeoJson, JsonObject, JsonValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

const ID_FIELDS: [&str; 6] = ["tile", "strip", "name", "dem_id", "strip_id", "ProductID"];
const LOCATION_FIELDS: [&str; 8] = ["fileurl", "url", "downloadurl", "dem_url", "FILEURL", "FileURL", "file_url", "href"];
const DATE_FIELDS: [&str; 8] = ["acqdate", "acq_date", "acquisition_da", "acquisition", "date", "ACQDATE", "Date", "DATE"];

/// One strip: identifier, native-CRS footprint and where to get its pixels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripIndexEntry {
    pub id: String,
    pub footprint: Footprint,
    /// URL or local path
    pub location: String,
    pub acquired: Option<NaiveDate>,
}

/// Read-only strip index in its native CRS
#[derive(Debug, Clone)]
pub struct StripIndex {
    pub crs: CrsDescriptor,
    pub entries: Vec<StripIndexEntry>,
}

/// Property names chosen for id, location and acquisition date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFields {
    pub id: String,
    pub location: String,
    pub date: Option<String>,
}

impl StripIndex {
    pub fn from_geojson_file<P: AsRef<Path>>(path: P, crs_override: Option<CrsDescriptor>) -> LakeResult<Self> {
        log::info!("Loading strip index from: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_geojson_str(&text, crs_override)
    }

    /// Parse a FeatureCollection. The CRS comes from `crs_override`, else the
    /// legacy `crs` member, else WGS84 as RFC 7946 mandates.
    pub fn from_geojson_str(text: &str, crs_override: Option<CrsDescriptor>) -> LakeResult<Self> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e| LakeError::Metadata(format!("Invalid strip index: {}", e)))?;
        let collection = match geojson {
            GeoJson::FeatureCollection(fc) => fc,
            _ => {
                return Err(LakeError::Metadata(
                    "Strip index must be a FeatureCollection".to_string(),
                ))
            }
        };

        let crs = match crs_override {
            Some(crs) => crs,
            None => collection_crs(&collection).unwrap_or_else(|| CrsDescriptor::from_epsg(4326)),
        };

        let properties: Vec<JsonObject> = collection
            .features
            .iter()
            .map(|f| f.properties.clone().unwrap_or_default())
            .collect();
        let fields = detect_fields(&properties)?;
        log::debug!("Strip index fields: {:?}", fields);

        let mut entries = Vec::with_capacity(collection.features.len());
        for (i, feature) in collection.features.into_iter().enumerate() {
            let props = &properties[i];
            let id = props
                .get(&fields.id)
                .and_then(value_as_string)
                .unwrap_or_else(|| format!("strip_{}", i));
            let location = match props.get(&fields.location).and_then(value_as_string) {
                Some(location) if !location.is_empty() => location,
                _ => {
                    log::warn!("Strip {} has no location, skipping", id);
                    continue;
                }
            };
            let geometry = match feature.geometry {
                Some(geometry) => geometry,
                None => {
                    log::warn!("Strip {} has no geometry, skipping", id);
                    continue;
                }
            };
            let geometry: Geometry<f64> = geometry
                .try_into()
                .map_err(|e| LakeError::Metadata(format!("Strip {}: bad geometry: {}", id, e)))?;
            let polygons = match geometry {
                Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                Geometry::MultiPolygon(mp) => mp,
                Geometry::Rect(r) => MultiPolygon::new(vec![r.to_polygon()]),
                other => {
                    log::warn!("Strip {} has non-areal geometry {:?}, skipping", id, other);
                    continue;
                }
            };
            let acquired = fields
                .date
                .as_ref()
                .and_then(|f| props.get(f))
                .and_then(value_as_string)
                .and_then(|s| parse_date(&s));

            entries.push(StripIndexEntry {
                id,
                footprint: Footprint {
                    geometry: polygons,
                    crs: crs.clone(),
                },
                location,
                acquired,
            });
        }

        log::info!("Strip index holds {} usable entries in {}", entries.len(), crs);
        Ok(Self { crs, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// EPSG code from a legacy `{"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3413"}}` member
fn collection_crs(collection: &FeatureCollection) -> Option<CrsDescriptor> {
    let name = collection
        .foreign_members
        .as_ref()?
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()?;
    if name.contains("CRS84") {
        return Some(CrsDescriptor::from_epsg(4326));
    }
    let upper = name.to_uppercase();
    let tail = &upper[upper.find("EPSG")?..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().map(CrsDescriptor::from_epsg)
}

fn value_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let head: String = value.chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&head, "%Y/%m/%d"))
        .or_else(|_| NaiveDate::parse_from_str(&value.chars().take(8).collect::<String>(), "%Y%m%d"))
        .ok()
}

/// Pick id, location and date properties the way strip indexes are usually named
pub fn detect_fields(properties: &[JsonObject]) -> LakeResult<IndexFields> {
    let keys: BTreeSet<&str> = properties
        .iter()
        .flat_map(|p| p.keys().map(|k| k.as_str()))
        .collect();

    let location = LOCATION_FIELDS
        .iter()
        .find(|c| keys.contains(*c))
        .map(|c| c.to_string())
        .or_else(|| {
            keys.iter()
                .find(|k| {
                    properties.iter().any(|p| {
                        p.get(**k)
                            .and_then(|v| v.as_str())
                            .map(|s| s.starts_with("http"))
                            .unwrap_or(false)
                    })
                })
                .map(|k| k.to_string())
        })
        .ok_or_else(|| LakeError::Metadata("No location column found in strip index".to_string()))?;

    let id = ID_FIELDS
        .iter()
        .find(|c| keys.contains(*c))
        .map(|c| c.to_string())
        .or_else(|| keys.iter().find(|k| **k != location).map(|k| k.to_string()))
        .unwrap_or_else(|| location.clone());

    let date = DATE_FIELDS
        .iter()
        .find(|c| keys.contains(*c))
        .map(|c| c.to_string())
        .or_else(|| {
            keys.iter()
                .find(|k| {
                    let lower = k.to_lowercase();
                    lower.contains("date") || lower.contains("acq")
                })
                .map(|k| k.to_string())
        });

    Ok(IndexFields { id, location, date })
}

/// Switch a strip URL between its 2m and 10m variants
pub fn rewrite_resolution(url: &str, target: &str) -> String {
    let other = match target {
        "2m" => "10m",
        "10m" => "2m",
        _ => return url.to_string(),
    };
    url.replace(&format!("/{}/", other), &format!("/{}/", target))
        .replace(&format!("_{}_", other), &format!("_{}_", target))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3413"}},
        "features": [
            {"type": "Feature",
             "properties": {"dem_id": "SETSM_A_2m", "fileurl": "https://example.org/strips/2m/a_2m_dem.tif", "acqdate1": "2019-07-01"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[100,0],[100,100],[0,100],[0,0]]]}},
            {"type": "Feature",
             "properties": {"dem_id": "SETSM_B_2m", "fileurl": "https://example.org/strips/2m/b_2m_dem.tif", "acqdate1": "2020-07-01"},
             "geometry": {"type": "Polygon", "coordinates": [[[50,50],[150,50],[150,150],[50,150],[50,50]]]}},
            {"type": "Feature",
             "properties": {"dem_id": "NO_GEOM", "fileurl": "https://example.org/x.tif"},
             "geometry": null}
        ]
    }"#;

    #[test]
    fn test_load_index_with_crs_member() {
        let index = StripIndex::from_geojson_str(INDEX, None).unwrap();
        assert_eq!(index.crs, CrsDescriptor::from_epsg(3413));
        assert_eq!(index.len(), 2);
        let b = &index.entries[1];
        assert_eq!(b.id, "SETSM_B_2m");
        assert_eq!(b.acquired, NaiveDate::from_ymd_opt(2020, 7, 1));
        assert!((b.footprint.area() - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_crs_override_wins() {
        let index = StripIndex::from_geojson_str(INDEX, Some(CrsDescriptor::from_epsg(32622))).unwrap();
        assert_eq!(index.crs.epsg(), Some(32622));
        assert!(index.entries.iter().all(|e| e.footprint.crs.epsg() == Some(32622)));
    }

    #[test]
    fn test_detect_fields_fallbacks() {
        let mut props = JsonObject::new();
        props.insert("a_name".to_string(), JsonValue::from("strip-1"));
        props.insert("link".to_string(), JsonValue::from("https://host/strip-1.tif"));
        let fields = detect_fields(&[props]).unwrap();
        assert_eq!(fields.location, "link");
        assert_eq!(fields.id, "a_name");
        assert_eq!(fields.date, None);
    }

    #[test]
    fn test_missing_location_column_is_error() {
        let mut props = JsonObject::new();
        props.insert("name".to_string(), JsonValue::from("x"));
        assert!(matches!(detect_fields(&[props]), Err(LakeError::Metadata(_))));
    }

    #[test]
    fn test_rewrite_resolution() {
        let url = "https://host/arcticdem/strips/s2s041/10m/n69w050/SETSM_x_10m_lsf_seg1.tar.gz";
        let two = rewrite_resolution(url, "2m");
        assert_eq!(two, "https://host/arcticdem/strips/s2s041/2m/n69w050/SETSM_x_2m_lsf_seg1.tar.gz");
        assert_eq!(rewrite_resolution(&two, "10m"), url);
        assert_eq!(rewrite_resolution(url, "5m"), url);
    }
}
