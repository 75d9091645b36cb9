use crate::core::crs::{PointTransform, ReferenceSystemEngine};
use crate::types::{BoundingBox, CrsDescriptor, LakeError, LakeResult, RasterSource};
use geo::{Area, BooleanOps, BoundingRect, Coord, Densify, LineString, MultiPolygon, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// Number of points inserted per edge when reprojecting footprints
const DENSIFY_POINTS: f64 = 21.0;

/// Spatial extent of a raster or vector source in a specific CRS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Footprint {
    pub geometry: MultiPolygon<f64>,
    pub crs: CrsDescriptor,
}

impl Footprint {
    pub fn from_polygon(polygon: Polygon<f64>, crs: CrsDescriptor) -> Self {
        Self {
            geometry: MultiPolygon::new(vec![polygon]),
            crs,
        }
    }

    pub fn from_bbox(bbox: &BoundingBox, crs: CrsDescriptor) -> Self {
        let rect = Rect::new(
            Coord { x: bbox.min_x, y: bbox.min_y },
            Coord { x: bbox.max_x, y: bbox.max_y },
        );
        Self::from_polygon(rect.to_polygon(), crs)
    }

    /// Quadrilateral spanned by the four raster corners (exact for rotated grids)
    pub fn from_source(source: &RasterSource) -> Self {
        let (w, h) = (source.width as f64, source.height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h), (0.0, 0.0)];
        let ring: Vec<Coord<f64>> = corners
            .iter()
            .map(|(c, r)| {
                let (x, y) = source.transform.pixel_to_world(*c, *r);
                Coord { x, y }
            })
            .collect();
        Self::from_polygon(Polygon::new(LineString::new(ring), vec![]), source.crs.clone())
    }

    pub fn empty(crs: CrsDescriptor) -> Self {
        Self {
            geometry: MultiPolygon::new(vec![]),
            crs,
        }
    }

    pub fn area(&self) -> f64 {
        self.geometry.unsigned_area()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty() || self.area() <= 0.0
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.geometry
            .bounding_rect()
            .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    /// True when the footprint is exactly its own bounding rectangle
    pub fn is_rectangular(&self) -> bool {
        match self.bounding_box() {
            Some(bbox) => (bbox.area() - self.area()).abs() <= bbox.area() * 1e-12,
            None => false,
        }
    }

    /// Grow outward by `distance`. The result is the envelope expanded on all
    /// sides (mitred corners), a superset of a round buffer.
    pub fn buffer(&self, distance: f64) -> Footprint {
        match self.bounding_box() {
            Some(bbox) => Footprint::from_bbox(&bbox.expand(distance), self.crs.clone()),
            None => self.clone(),
        }
    }

    /// Reproject vertices into `dst`, densifying edges first so curved
    /// images of straight edges are followed.
    pub fn reproject(&self, engine: &dyn ReferenceSystemEngine, dst: &CrsDescriptor) -> LakeResult<Footprint> {
        if self.crs.same_as(dst) {
            return Ok(Footprint {
                geometry: self.geometry.clone(),
                crs: dst.clone(),
            });
        }
        let transform = engine.transformer(&self.crs, dst)?;
        let bbox = match self.bounding_box() {
            Some(bbox) => bbox,
            None => return Ok(Footprint::empty(dst.clone())),
        };
        let max_segment = (bbox.width().max(bbox.height()) / DENSIFY_POINTS).max(f64::EPSILON);
        let dense = self.geometry.densify(max_segment);

        let mut polygons = Vec::with_capacity(dense.0.len());
        for polygon in dense.0.iter() {
            let exterior = transform_ring(polygon.exterior(), transform.as_ref())?;
            let interiors = polygon
                .interiors()
                .iter()
                .map(|ring| transform_ring(ring, transform.as_ref()))
                .collect::<LakeResult<Vec<_>>>()?;
            polygons.push(Polygon::new(exterior, interiors));
        }
        Ok(Footprint {
            geometry: MultiPolygon::new(polygons),
            crs: dst.clone(),
        })
    }

    /// Intersection of two footprints already in the same CRS
    pub fn intersection(&self, other: &Footprint) -> LakeResult<Footprint> {
        if !self.crs.same_as(&other.crs) {
            return Err(LakeError::Reprojection(format!(
                "Cannot intersect footprints in {} and {}",
                self.crs, other.crs
            )));
        }
        if self.geometry.0.is_empty() || other.geometry.0.is_empty() {
            return Ok(Footprint::empty(self.crs.clone()));
        }
        Ok(Footprint {
            geometry: self.geometry.intersection(&other.geometry),
            crs: self.crs.clone(),
        })
    }
}

fn transform_ring(ring: &LineString<f64>, transform: &dyn PointTransform) -> LakeResult<LineString<f64>> {
    let mut xs: Vec<f64> = ring.coords().map(|c| c.x).collect();
    let mut ys: Vec<f64> = ring.coords().map(|c| c.y).collect();
    transform.transform_points(&mut xs, &mut ys)?;
    let coords: Vec<Coord<f64>> = xs
        .into_iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| Coord { x, y })
        .collect();
    if coords.len() < 4 {
        return Err(LakeError::Reprojection(
            "Footprint ring degenerated during reprojection".to_string(),
        ));
    }
    Ok(LineString::new(coords))
}

/// Outcome of the overlap gate; an empty intersection is a normal result
#[derive(Debug, Clone)]
pub struct OverlapResult {
    pub overlaps: bool,
    /// Intersection in the target's CRS; empty when disjoint or only touching
    pub intersection: Footprint,
    /// Intersection area / smaller footprint area
    pub ratio: f64,
}

/// Intersect a candidate footprint with the target, in the target's CRS.
pub fn check_overlap(
    target: &Footprint,
    candidate: &Footprint,
    engine: &dyn ReferenceSystemEngine,
) -> LakeResult<OverlapResult> {
    let candidate = candidate.reproject(engine, &target.crs)?;
    let intersection = target.intersection(&candidate)?;
    let inter_area = intersection.area();
    let overlaps = inter_area > 0.0;
    let ratio = overlap_ratio(target.area(), candidate.area(), inter_area);

    log::debug!(
        "Overlap check in {}: area={:.3}, ratio={:.3}",
        target.crs,
        inter_area,
        ratio
    );

    Ok(OverlapResult {
        overlaps,
        intersection: if overlaps { intersection } else { Footprint::empty(target.crs.clone()) },
        ratio,
    })
}

/// Intersection area divided by the smaller of the two areas
pub fn overlap_ratio(area_a: f64, area_b: f64, intersection_area: f64) -> f64 {
    let smaller = area_a.min(area_b);
    if intersection_area <= 0.0 || smaller <= 0.0 {
        return 0.0;
    }
    intersection_area / smaller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crs::tests::ShiftEngine;
    use crate::core::crs::GdalEngine;
    use crate::types::GeoTransform;

    fn utm() -> CrsDescriptor {
        CrsDescriptor::from_epsg(32622)
    }

    fn square(min: f64, max: f64) -> Footprint {
        Footprint::from_bbox(&BoundingBox::new(min, min, max, max), utm())
    }

    #[test]
    fn test_disjoint_footprints() {
        let result = check_overlap(&square(0.0, 1000.0), &square(2000.0, 3000.0), &GdalEngine::new()).unwrap();
        assert!(!result.overlaps);
        assert!(result.intersection.is_empty());
        assert_eq!(result.ratio, 0.0);
    }

    #[test]
    fn test_touching_footprints_are_not_overlapping() {
        let a = square(0.0, 1000.0);
        let b = Footprint::from_bbox(&BoundingBox::new(1000.0, 0.0, 2000.0, 1000.0), utm());
        let result = check_overlap(&a, &b, &GdalEngine::new()).unwrap();
        assert!(!result.overlaps);
    }

    #[test]
    fn test_overlap_is_commutative() {
        let a = square(0.0, 1000.0);
        let b = Footprint::from_bbox(&BoundingBox::new(500.0, 250.0, 1500.0, 750.0), utm());
        let engine = GdalEngine::new();
        let ab = check_overlap(&a, &b, &engine).unwrap();
        let ba = check_overlap(&b, &a, &engine).unwrap();
        assert_eq!(ab.overlaps, ba.overlaps);
        assert!((ab.intersection.area() - ba.intersection.area()).abs() < 1e-6);
        assert!((ab.intersection.area() - 250_000.0).abs() < 1e-6);
        assert!((ab.ratio - 0.5).abs() < 1e-9);
        assert_eq!(ab.intersection.bounding_box(), ba.intersection.bounding_box());
    }

    #[test]
    fn test_overlap_across_crs_uses_target_crs() {
        let polar = CrsDescriptor::from_epsg(3413);
        let engine = ShiftEngine { from: polar.clone(), to: utm(), dx: 1000.0, dy: 0.0 };
        let target = square(0.0, 1000.0);
        // After the shift this lands on [500, 1500] x [0, 1000]
        let candidate = Footprint::from_bbox(&BoundingBox::new(-500.0, 0.0, 500.0, 1000.0), polar);
        let result = check_overlap(&target, &candidate, &engine).unwrap();
        assert!(result.overlaps);
        assert!(result.intersection.crs.same_as(&utm()));
        let bbox = result.intersection.bounding_box().unwrap();
        assert!((bbox.min_x - 500.0).abs() < 1e-9);
        assert!((bbox.max_x - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_footprint_from_source_and_buffer() {
        let source = RasterSource {
            id: "scene".to_string(),
            crs: utm(),
            transform: GeoTransform::north_up(500000.0, 7600000.0, 10.0, -10.0),
            width: 100,
            height: 50,
            band_count: 1,
            nodata: None,
        };
        let fp = Footprint::from_source(&source);
        assert!((fp.area() - 500_000.0).abs() < 1e-6);
        assert!(fp.is_rectangular());
        let buffered = fp.buffer(100.0).bounding_box().unwrap();
        assert_eq!(buffered, BoundingBox::new(499900.0, 7599400.0, 501100.0, 7600100.0));
    }
}
