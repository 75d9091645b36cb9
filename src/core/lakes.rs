use crate::core::index::label_regions;
use crate::types::{CrsDescriptor, GeoTransform, LakeError, LakeResult, MaskRaster};
use chrono::NaiveDate;
use geo::orient::{Direction, Orient};
use geo::{Contains, Coord, LineString, MultiPolygon, Point, Polygon};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};
use std::collections::HashSet;
use std::path::Path;

/// Unit steps in pixel space (x = column, y = row, y grows downwards)
const STEPS: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

/// One connected lake region as a polygon in the mask's CRS
#[derive(Debug, Clone)]
pub struct LakePolygon {
    pub id: usize,
    pub geometry: MultiPolygon<f64>,
    /// CRS units squared
    pub area: f64,
    pub pixels: usize,
}

/// Scene-level attributes copied onto every exported lake
#[derive(Debug, Clone, Default)]
pub struct LakeAttributes {
    pub scene: String,
    pub date: Option<NaiveDate>,
    pub index_threshold: f32,
    pub elevation_floor: Option<f32>,
    pub elevation_ceiling: Option<f32>,
}

/// A directed unit edge of a region boundary, interior on its right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Edge {
    x: i64,
    y: i64,
    dir: usize,
}

impl Edge {
    fn end(&self) -> (i64, i64) {
        let (dx, dy) = STEPS[self.dir];
        (self.x + dx, self.y + dy)
    }

    /// Center of the pixel on the left of the edge
    fn left_pixel_center(&self) -> (f64, f64) {
        let (x, y) = (self.x as f64, self.y as f64);
        match self.dir {
            0 => (x + 0.5, y - 0.5),
            1 => (x + 0.5, y + 0.5),
            2 => (x - 0.5, y + 0.5),
            _ => (x - 0.5, y - 0.5),
        }
    }
}

/// Boundary edges of every labelled region, grouped by label
fn region_edges(labels: &ndarray::Array2<u32>, regions: usize) -> Vec<HashSet<Edge>> {
    let (height, width) = labels.dim();
    let mut edges = vec![HashSet::new(); regions];
    let label_at = |r: i64, c: i64| -> u32 {
        if r < 0 || c < 0 || r >= height as i64 || c >= width as i64 {
            0
        } else {
            labels[[r as usize, c as usize]]
        }
    };
    for ((r, c), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let (r, c) = (r as i64, c as i64);
        let set = &mut edges[label as usize - 1];
        if label_at(r - 1, c) != label {
            set.insert(Edge { x: c, y: r, dir: 0 });
        }
        if label_at(r, c + 1) != label {
            set.insert(Edge { x: c + 1, y: r, dir: 1 });
        }
        if label_at(r + 1, c) != label {
            set.insert(Edge { x: c + 1, y: r + 1, dir: 2 });
        }
        if label_at(r, c - 1) != label {
            set.insert(Edge { x: c, y: r + 1, dir: 3 });
        }
    }
    edges
}

/// Follow boundary edges into closed rings. Turning right first keeps
/// pixels that only touch at a corner in separate rings (4-connectivity).
fn trace_rings(mut remaining: HashSet<Edge>) -> Vec<Vec<Edge>> {
    let mut rings = Vec::new();
    loop {
        let Some(start) = remaining.iter().min_by_key(|e| (e.y, e.x, e.dir)).copied() else {
            break;
        };
        remaining.remove(&start);
        let mut ring = vec![start];
        let mut current = start;
        loop {
            let (x, y) = current.end();
            let mut next = None;
            for dir in [(current.dir + 1) % 4, current.dir, (current.dir + 3) % 4] {
                if (x, y) == (start.x, start.y) && dir == start.dir {
                    break;
                }
                let candidate = Edge { x, y, dir };
                if remaining.remove(&candidate) {
                    next = Some(candidate);
                    break;
                }
            }
            match next {
                Some(edge) => {
                    ring.push(edge);
                    current = edge;
                }
                None => break,
            }
        }
        rings.push(ring);
    }
    rings
}

/// Corner vertices of a traced ring, in pixel coordinates
fn ring_corners(ring: &[Edge]) -> Vec<(f64, f64)> {
    let n = ring.len();
    (0..n)
        .filter(|&i| ring[(i + n - 1) % n].dir != ring[i].dir)
        .map(|i| (ring[i].x as f64, ring[i].y as f64))
        .collect()
}

/// Twice the signed area in pixel space; positive for outer rings
fn signed_area2(corners: &[(f64, f64)]) -> f64 {
    let n = corners.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = corners[i];
            let (x1, y1) = corners[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum()
}

fn to_line_string(corners: &[(f64, f64)], transform: &GeoTransform) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = corners
        .iter()
        .map(|&(x, y)| {
            let (wx, wy) = transform.pixel_to_world(x, y);
            Coord { x: wx, y: wy }
        })
        .collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    LineString::from(coords)
}

fn pixel_ring(corners: &[(f64, f64)]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = corners.iter().map(|&(x, y)| Coord { x, y }).collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    LineString::from(coords)
}

/// Polygon for one region from its traced rings
fn region_polygon(rings: Vec<Vec<Edge>>, transform: &GeoTransform) -> MultiPolygon<f64> {
    let mut outers: Vec<(Vec<(f64, f64)>, Vec<LineString<f64>>)> = Vec::new();
    let mut holes: Vec<(Vec<(f64, f64)>, (f64, f64))> = Vec::new();
    for ring in rings {
        let corners = ring_corners(&ring);
        if signed_area2(&corners) > 0.0 {
            outers.push((corners, Vec::new()));
        } else {
            holes.push((corners, ring[0].left_pixel_center()));
        }
    }

    for (corners, inside) in holes {
        let owner = if outers.len() == 1 {
            Some(0)
        } else {
            let point = Point::new(inside.0, inside.1);
            outers
                .iter()
                .position(|(outer, _)| Polygon::new(pixel_ring(outer), vec![]).contains(&point))
        };
        match owner {
            Some(i) => outers[i].1.push(to_line_string(&corners, transform)),
            None => log::warn!("Dropping lake hole with no enclosing ring"),
        }
    }

    let polygons = outers
        .into_iter()
        .map(|(corners, interiors)| {
            Polygon::new(to_line_string(&corners, transform), interiors).orient(Direction::Default)
        })
        .collect();
    MultiPolygon::new(polygons)
}

/// Vectorize the 4-connected regions of `mask`, keeping those whose area is
/// at least `min_area` (CRS units squared).
pub fn polygonize_mask(mask: &MaskRaster, min_area: f64) -> Vec<LakePolygon> {
    let (labels, sizes) = label_regions(&mask.data);
    let edges = region_edges(&labels, sizes.len());
    let transform = &mask.grid.transform;
    let pixel_area = (transform.pixel_width * transform.pixel_height - transform.rotation_x * transform.rotation_y).abs();

    let mut lakes = Vec::new();
    for (i, region) in edges.into_iter().enumerate() {
        let area = sizes[i] as f64 * pixel_area;
        if area < min_area {
            continue;
        }
        let geometry = region_polygon(trace_rings(region), transform);
        lakes.push(LakePolygon {
            id: lakes.len() + 1,
            geometry,
            area,
            pixels: sizes[i],
        });
    }
    log::info!("Vectorized {} of {} lake region(s)", lakes.len(), sizes.len());
    lakes
}

fn crs_member(crs: &CrsDescriptor) -> Option<JsonValue> {
    let code = crs.epsg()?;
    Some(serde_json::json!({
        "type": "name",
        "properties": {"name": format!("urn:ogc:def:crs:EPSG::{}", code)}
    }))
}

/// Write lakes as a GeoJSON FeatureCollection in the mask's CRS, named with
/// the legacy `crs` member so GIS tools pick up projected coordinates.
pub fn write_lakes_geojson<P: AsRef<Path>>(
    path: P,
    lakes: &[LakePolygon],
    crs: &CrsDescriptor,
    attributes: &LakeAttributes,
) -> LakeResult<()> {
    let features = lakes
        .iter()
        .map(|lake| {
            let mut properties = JsonObject::new();
            properties.insert("lake_id".to_string(), JsonValue::from(lake.id));
            properties.insert("scene".to_string(), JsonValue::from(attributes.scene.clone()));
            properties.insert(
                "date".to_string(),
                attributes
                    .date
                    .map(|d| JsonValue::from(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(JsonValue::Null),
            );
            properties.insert("index_threshold".to_string(), JsonValue::from(attributes.index_threshold));
            properties.insert("elevation_floor".to_string(), JsonValue::from(attributes.elevation_floor));
            properties.insert("elevation_ceiling".to_string(), JsonValue::from(attributes.elevation_ceiling));
            properties.insert("area".to_string(), JsonValue::from(lake.area));
            properties.insert("pixels".to_string(), JsonValue::from(lake.pixels));
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(geojson::Value::from(&lake.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let foreign_members = crs_member(crs).map(|member| {
        let mut members = JsonObject::new();
        members.insert("crs".to_string(), member);
        members
    });
    if foreign_members.is_none() {
        log::warn!("Lake CRS {} has no EPSG code; GeoJSON written without a crs member", crs);
    }
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members,
    };

    let path = path.as_ref();
    std::fs::write(path, collection.to_string())
        .map_err(|e| LakeError::Processing(format!("Failed to write {}: {}", path.display(), e)))?;
    log::info!("Wrote {} lake polygon(s) to {}", lakes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RasterGrid;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    fn mask(data: Array2<bool>) -> MaskRaster {
        let (height, width) = data.dim();
        MaskRaster {
            data,
            grid: RasterGrid {
                crs: CrsDescriptor::from_epsg(32622),
                transform: GeoTransform::north_up(500000.0, 7600000.0, 10.0, -10.0),
                width,
                height,
            },
        }
    }

    #[test]
    fn test_square_region_is_one_rectangle() {
        let mut data = Array2::from_elem((5, 5), false);
        for r in 1..3 {
            for c in 1..4 {
                data[[r, c]] = true;
            }
        }
        let lakes = polygonize_mask(&mask(data), 0.0);
        assert_eq!(lakes.len(), 1);
        let lake = &lakes[0];
        assert_eq!(lake.pixels, 6);
        assert_relative_eq!(lake.area, 600.0);
        assert_eq!(lake.geometry.0.len(), 1);
        let exterior = lake.geometry.0[0].exterior();
        // four corners plus the closing point
        assert_eq!(exterior.0.len(), 5);
        assert!(exterior.0.contains(&Coord { x: 500010.0, y: 7599990.0 }));
        assert!(exterior.0.contains(&Coord { x: 500040.0, y: 7599970.0 }));
    }

    #[test]
    fn test_ring_of_water_keeps_its_hole() {
        let data = array![
            [true, true, true],
            [true, false, true],
            [true, true, true],
        ];
        let lakes = polygonize_mask(&mask(data), 0.0);
        assert_eq!(lakes.len(), 1);
        let polygon = &lakes[0].geometry.0[0];
        assert_eq!(polygon.interiors().len(), 1);
        assert_relative_eq!(lakes[0].area, 800.0);
        assert!(!polygon.contains(&Point::new(500015.0, 7599985.0)));
        assert!(polygon.contains(&Point::new(500005.0, 7599995.0)));
    }

    #[test]
    fn test_diagonal_pixels_are_separate_lakes() {
        let data = array![
            [true, false],
            [false, true],
        ];
        let lakes = polygonize_mask(&mask(data), 0.0);
        assert_eq!(lakes.len(), 2);
        for lake in &lakes {
            assert_eq!(lake.pixels, 1);
            assert_relative_eq!(lake.area, 100.0);
        }
    }

    #[test]
    fn test_small_lakes_are_filtered_by_area() {
        let data = array![
            [true, false, false, false],
            [false, false, true, true],
            [false, false, true, true],
        ];
        let lakes = polygonize_mask(&mask(data), 150.0);
        assert_eq!(lakes.len(), 1);
        assert_eq!(lakes[0].id, 1);
        assert_eq!(lakes[0].pixels, 4);
    }

    #[test]
    fn test_geojson_carries_crs_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lakes.geojson");
        let m = mask(array![[true, true], [false, false]]);
        let lakes = polygonize_mask(&m, 0.0);
        let attributes = LakeAttributes {
            scene: "S2A_MSIL2A_20190704T151911_N0212_R068_T22WDA_20190704T194104.SAFE".to_string(),
            date: NaiveDate::from_ymd_opt(2019, 7, 4),
            index_threshold: 0.25,
            elevation_floor: Some(0.0),
            elevation_ceiling: None,
        };
        write_lakes_geojson(&path, &lakes, &m.grid.crs, &attributes).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(value["crs"]["properties"]["name"], "urn:ogc:def:crs:EPSG::32622");
        let feature = &value["features"][0];
        assert_eq!(feature["geometry"]["type"], "MultiPolygon");
        assert_eq!(feature["properties"]["date"], "2019-07-04");
        assert_eq!(feature["properties"]["area"], 200.0);
        assert!(feature["properties"]["elevation_ceiling"].is_null());
    }
}
