use crate::types::{BoundingBox, CrsDescriptor, LakeError, LakeResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};

/// Transforms batches of points between two fixed reference systems.
///
/// Points that cannot be transformed are set to NaN rather than failing the batch.
pub trait PointTransform {
    fn transform_points(&self, xs: &mut [f64], ys: &mut [f64]) -> LakeResult<()>;

    fn transform_point(&self, x: f64, y: f64) -> LakeResult<(f64, f64)> {
        let mut xs = [x];
        let mut ys = [y];
        self.transform_points(&mut xs, &mut ys)?;
        Ok((xs[0], ys[0]))
    }
}

/// Factory for point transforms. Implementations must be shareable across
/// worker threads; the transforms they hand out need not be.
pub trait ReferenceSystemEngine: Send + Sync {
    fn transformer(&self, src: &CrsDescriptor, dst: &CrsDescriptor) -> LakeResult<Box<dyn PointTransform>>;
}

/// No-op transform for identical reference systems
pub struct IdentityTransform;

impl PointTransform for IdentityTransform {
    fn transform_points(&self, _xs: &mut [f64], _ys: &mut [f64]) -> LakeResult<()> {
        Ok(())
    }
}

/// PROJ-backed engine via GDAL's OGR spatial references.
///
/// Axis order is forced to traditional GIS order (x = easting/longitude).
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalEngine;

impl GdalEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn spatial_ref(crs: &CrsDescriptor) -> LakeResult<SpatialRef> {
        let srs = match crs.epsg() {
            Some(code) => SpatialRef::from_epsg(code),
            None => SpatialRef::from_definition(&crs.definition),
        }
        .map_err(|e| LakeError::Reprojection(format!("Cannot interpret CRS {}: {}", crs, e)))?;
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    }
}

impl ReferenceSystemEngine for GdalEngine {
    fn transformer(&self, src: &CrsDescriptor, dst: &CrsDescriptor) -> LakeResult<Box<dyn PointTransform>> {
        if src.same_as(dst) {
            return Ok(Box::new(IdentityTransform));
        }
        let src_srs = Self::spatial_ref(src)?;
        let dst_srs = Self::spatial_ref(dst)?;
        let inner = CoordTransform::new(&src_srs, &dst_srs).map_err(|e| {
            LakeError::Reprojection(format!("No transformation from {} to {}: {}", src, dst, e))
        })?;
        log::debug!("Created coordinate transform {} -> {}", src, dst);
        Ok(Box::new(GdalPointTransform { inner }))
    }
}

struct GdalPointTransform {
    inner: CoordTransform,
}

impl PointTransform for GdalPointTransform {
    fn transform_points(&self, xs: &mut [f64], ys: &mut [f64]) -> LakeResult<()> {
        if xs.len() != ys.len() {
            return Err(LakeError::InvalidInput(format!(
                "Coordinate arrays differ in length: {} vs {}",
                xs.len(),
                ys.len()
            )));
        }
        let orig_x = xs.to_vec();
        let orig_y = ys.to_vec();
        let mut zs: [f64; 0] = [];
        if self.inner.transform_coords(xs, ys, &mut zs).is_ok() {
            return Ok(());
        }

        // OCTTransform fails the whole batch if a single point is outside the
        // projection domain; redo point by point and mark failures.
        let mut failed = 0usize;
        for i in 0..orig_x.len() {
            let mut px = [orig_x[i]];
            let mut py = [orig_y[i]];
            match self.inner.transform_coords(&mut px, &mut py, &mut zs) {
                Ok(()) => {
                    xs[i] = px[0];
                    ys[i] = py[0];
                }
                Err(_) => {
                    xs[i] = f64::NAN;
                    ys[i] = f64::NAN;
                    failed += 1;
                }
            }
        }
        if failed == orig_x.len() && failed > 0 {
            return Err(LakeError::Reprojection(format!("All {} points failed to transform", failed)));
        }
        log::debug!("{} of {} points outside transform domain", failed, orig_x.len());
        Ok(())
    }
}

/// Reproject a bounding box by densifying its edges, like GDAL's
/// `OCTTransformBounds`. Non-transformable edge points are ignored.
pub fn transform_bounds(
    bbox: &BoundingBox,
    transform: &dyn PointTransform,
    densify_pts: usize,
) -> LakeResult<BoundingBox> {
    let steps = densify_pts + 1;
    let mut xs = Vec::with_capacity(4 * steps);
    let mut ys = Vec::with_capacity(4 * steps);
    for i in 0..steps {
        let t = i as f64 / steps as f64;
        let x = bbox.min_x + t * bbox.width();
        let y = bbox.min_y + t * bbox.height();
        xs.extend_from_slice(&[x, bbox.max_x - t * bbox.width(), bbox.min_x, bbox.max_x]);
        ys.extend_from_slice(&[bbox.min_y, bbox.max_y, bbox.max_y - t * bbox.height(), y]);
    }
    transform.transform_points(&mut xs, &mut ys)?;

    let mut out = BoundingBox {
        min_x: f64::INFINITY,
        min_y: f64::INFINITY,
        max_x: f64::NEG_INFINITY,
        max_y: f64::NEG_INFINITY,
    };
    for (x, y) in xs.iter().zip(ys.iter()) {
        if x.is_finite() && y.is_finite() {
            out.min_x = out.min_x.min(*x);
            out.min_y = out.min_y.min(*y);
            out.max_x = out.max_x.max(*x);
            out.max_y = out.max_y.max(*y);
        }
    }
    if !out.min_x.is_finite() || !out.max_x.is_finite() {
        return Err(LakeError::Reprojection(format!("Bounds {:?} could not be transformed", bbox)));
    }
    Ok(out)
}
