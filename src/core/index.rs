use crate::config::PipelineConfig;
use crate::types::{AlignedRaster, GeoTransform, LakeError, LakeResult, MaskImage, MaskRaster};
use ndarray::{Array2, Zip};
use num_traits::Float;
use std::collections::VecDeque;

/// `(a - b) / (a + b)` per pixel. A zero denominator or a non-finite input
/// yields NaN, which thresholding treats as "not a lake".
pub fn normalized_difference<F: Float + Send + Sync>(a: &Array2<F>, b: &Array2<F>) -> LakeResult<Array2<F>> {
    if a.dim() != b.dim() {
        return Err(LakeError::GridMismatch(format!(
            "index bands differ in shape: {:?} vs {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(Zip::from(a).and(b).par_map_collect(|&a, &b| {
        let denominator = a + b;
        if !a.is_finite() || !b.is_finite() || denominator == F::zero() {
            return F::nan();
        }
        let value = (a - b) / denominator;
        if value.is_finite() {
            value
        } else {
            F::nan()
        }
    }))
}

/// NDWI-style index from two bands on the same grid; nodata in either band
/// propagates as NaN.
pub fn index_from_bands(a: &AlignedRaster, b: &AlignedRaster, tolerance: f64) -> LakeResult<AlignedRaster> {
    if let Some(diff) = a.grid.describe_mismatch(&b.grid, tolerance) {
        return Err(LakeError::GridMismatch(format!("index bands: {}", diff)));
    }
    let index = normalized_difference(&a.to_nan_masked(), &b.to_nan_masked())?;
    AlignedRaster::new(index, a.grid.clone(), f32::NAN)
}

/// Optional elevation limits for lake candidates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ElevationConstraint {
    /// Reject pixels above this elevation
    pub ceiling: Option<f32>,
    /// Reject pixels at or below this elevation
    pub floor: Option<f32>,
}

impl ElevationConstraint {
    pub fn is_active(&self) -> bool {
        self.ceiling.is_some() || self.floor.is_some()
    }

    /// Pixels with unknown elevation never pass an active constraint
    pub fn allows(&self, elevation: f32) -> bool {
        if !elevation.is_finite() {
            return false;
        }
        self.ceiling.map_or(true, |c| elevation <= c) && self.floor.map_or(true, |f| elevation > f)
    }
}

/// Positive where `index >= threshold` and the elevation constraint (if any) holds
pub fn threshold_mask(
    index: &Array2<f32>,
    threshold: f32,
    elevation: Option<(&Array2<f32>, ElevationConstraint)>,
) -> LakeResult<MaskImage> {
    match elevation {
        Some((dem, constraint)) if constraint.is_active() => {
            if dem.dim() != index.dim() {
                return Err(LakeError::GridMismatch(format!(
                    "elevation {:?} does not match index {:?}",
                    dem.dim(),
                    index.dim()
                )));
            }
            Ok(Zip::from(index)
                .and(dem)
                .par_map_collect(|&v, &z| v.is_finite() && v >= threshold && constraint.allows(z)))
        }
        _ => Ok(index.mapv(|v| v.is_finite() && v >= threshold)),
    }
}

/// Smallest region (in pixels) that covers `min_area` CRS units squared
pub fn min_region_pixels(min_area: f64, transform: &GeoTransform) -> usize {
    let pixel_area = (transform.pixel_width * transform.pixel_height - transform.rotation_x * transform.rotation_y).abs();
    if min_area <= 0.0 || pixel_area <= 0.0 {
        return 0;
    }
    (min_area / pixel_area).ceil() as usize
}

/// Label 4-connected positive regions. Background is 0, regions are
/// numbered from 1 in row-major order of their first pixel; `sizes[k - 1]`
/// is the pixel count of region `k`.
pub fn label_regions(mask: &MaskImage) -> (Array2<u32>, Vec<usize>) {
    let (height, width) = mask.dim();
    let mut labels = Array2::<u32>::zeros((height, width));
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();

    for start_r in 0..height {
        for start_c in 0..width {
            if !mask[[start_r, start_c]] || labels[[start_r, start_c]] != 0 {
                continue;
            }
            let label = sizes.len() as u32 + 1;
            let mut size = 0;
            labels[[start_r, start_c]] = label;
            queue.push_back((start_r, start_c));
            while let Some((r, c)) = queue.pop_front() {
                size += 1;
                let neighbours = [
                    (r.wrapping_sub(1), c),
                    (r + 1, c),
                    (r, c.wrapping_sub(1)),
                    (r, c + 1),
                ];
                for (nr, nc) in neighbours {
                    if nr < height && nc < width && mask[[nr, nc]] && labels[[nr, nc]] == 0 {
                        labels[[nr, nc]] = label;
                        queue.push_back((nr, nc));
                    }
                }
            }
            sizes.push(size);
        }
    }
    (labels, sizes)
}

/// Drop 4-connected positive regions with fewer than `min_pixels` pixels.
/// Returns the number of regions removed.
pub fn remove_small_regions(mask: &mut MaskImage, min_pixels: usize) -> usize {
    if min_pixels <= 1 {
        return 0;
    }
    let (labels, sizes) = label_regions(mask);
    let small: Vec<bool> = sizes.iter().map(|&n| n < min_pixels).collect();
    Zip::from(&mut *mask).and(&labels).for_each(|m, &label| {
        if label != 0 && small[label as usize - 1] {
            *m = false;
        }
    });
    small.iter().filter(|s| **s).count()
}

/// Index thresholding plus cleanup, parameterised from the pipeline config
#[derive(Debug, Clone)]
pub struct MaskGenerator {
    pub threshold: f32,
    pub constraint: ElevationConstraint,
    pub min_region_area: f64,
    pub tolerance: f64,
}

impl MaskGenerator {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.index_threshold,
            constraint: ElevationConstraint {
                ceiling: config.elevation_ceiling,
                floor: config.elevation_floor,
            },
            min_region_area: config.min_region_area,
            tolerance: config.transform_tolerance,
        }
    }

    pub fn generate(&self, index: &AlignedRaster, elevation: Option<&AlignedRaster>) -> LakeResult<MaskRaster> {
        let dem = match elevation {
            Some(dem) if self.constraint.is_active() => {
                if let Some(diff) = index.grid.describe_mismatch(&dem.grid, self.tolerance) {
                    return Err(LakeError::GridMismatch(format!("elevation vs index: {}", diff)));
                }
                Some(dem.to_nan_masked())
            }
            _ => None,
        };
        let mut mask = threshold_mask(
            &index.data,
            self.threshold,
            dem.as_ref().map(|d| (d, self.constraint)),
        )?;

        let before = mask.iter().filter(|v| **v).count();
        let min_pixels = min_region_pixels(self.min_region_area, &index.grid.transform);
        let removed = remove_small_regions(&mut mask, min_pixels);
        let after = mask.iter().filter(|v| **v).count();
        log::info!(
            "Mask: {} positive pixels ({} before removing {} regions under {} px)",
            after,
            before,
            removed,
            min_pixels
        );

        Ok(MaskRaster {
            data: mask,
            grid: index.grid.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrsDescriptor, RasterGrid};
    use ndarray::array;

    #[test]
    fn test_zero_denominator_is_nan_not_infinite() {
        let a = array![[0.0f32, 3.0], [1.0, -2.0]];
        let b = array![[0.0f32, 1.0], [1.0, 2.0]];
        let idx = normalized_difference(&a, &b).unwrap();
        assert!(idx[[0, 0]].is_nan());
        assert!((idx[[0, 1]] - 0.5).abs() < 1e-7);
        assert_eq!(idx[[1, 0]], 0.0);
        assert!(idx[[1, 1]].is_nan());
        assert!(idx.iter().all(|v| !v.is_infinite()));
    }

    #[test]
    fn test_index_is_bit_identical_on_recompute() {
        let a = Array2::from_shape_fn((32, 32), |(r, c)| (r * 7 + c * 3) as f32 * 0.013);
        let b = Array2::from_shape_fn((32, 32), |(r, c)| (r + c * 5) as f32 * 0.021);
        let first = normalized_difference(&a, &b).unwrap();
        let second = normalized_difference(&a, &b).unwrap();
        let bits = |x: &Array2<f32>| x.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&first), bits(&second));
    }

    #[test]
    fn test_generic_over_f64() {
        let a = array![[2.0f64]];
        let b = array![[1.0f64]];
        let idx = normalized_difference(&a, &b).unwrap();
        assert!((idx[[0, 0]] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(matches!(normalized_difference(&a, &b), Err(LakeError::GridMismatch(_))));
    }

    #[test]
    fn test_threshold_excludes_nan_and_applies_ceiling() {
        let idx = array![[0.3f32, f32::NAN], [0.1, 0.5]];
        let plain = threshold_mask(&idx, 0.25, None).unwrap();
        assert_eq!(plain, array![[true, false], [false, true]]);

        let dem = array![[100.0f32, 100.0], [100.0, 900.0]];
        let constraint = ElevationConstraint { ceiling: Some(500.0), floor: None };
        let limited = threshold_mask(&idx, 0.25, Some((&dem, constraint))).unwrap();
        assert_eq!(limited, array![[true, false], [false, false]]);

        let floor = ElevationConstraint { ceiling: None, floor: Some(100.0) };
        let floored = threshold_mask(&idx, 0.25, Some((&dem, floor))).unwrap();
        assert_eq!(floored, array![[false, false], [false, true]]);
    }

    #[test]
    fn test_unconstrained_elevation_is_ignored() {
        let idx = array![[0.3f32]];
        let dem = array![[f32::NAN]];
        let mask = threshold_mask(&idx, 0.25, Some((&dem, ElevationConstraint::default()))).unwrap();
        assert!(mask[[0, 0]]);
    }

    #[test]
    fn test_remove_small_regions_four_connected() {
        let mut mask = array![
            [true, true, false, false, false],
            [true, true, false, false, true],
            [false, false, true, false, false],
            [false, false, false, false, false],
        ];
        // The diagonal pixel at (2, 2) is its own region under 4-connectivity
        let removed = remove_small_regions(&mut mask, 2);
        assert_eq!(removed, 2);
        assert_eq!(mask.iter().filter(|v| **v).count(), 4);
        assert!(!mask[[2, 2]]);
        assert!(!mask[[1, 4]]);
    }

    #[test]
    fn test_label_regions_numbers_in_scan_order() {
        let mask = array![
            [false, true, false],
            [true, false, true],
            [true, false, true],
        ];
        let (labels, sizes) = label_regions(&mask);
        assert_eq!(sizes, vec![1, 2, 2]);
        assert_eq!(labels[[0, 1]], 1);
        assert_eq!(labels[[2, 0]], 2);
        assert_eq!(labels[[1, 2]], 3);
        assert_eq!(labels[[1, 1]], 0);
    }

    #[test]
    fn test_min_region_pixels_from_area() {
        let gt = GeoTransform::north_up(0.0, 0.0, 10.0, -10.0);
        assert_eq!(min_region_pixels(1000.0, &gt), 10);
        assert_eq!(min_region_pixels(1050.0, &gt), 11);
        assert_eq!(min_region_pixels(0.0, &gt), 0);
    }

    #[test]
    fn test_generator_rejects_misaligned_elevation() {
        let grid = RasterGrid {
            crs: CrsDescriptor::from_epsg(32622),
            transform: GeoTransform::north_up(0.0, 20.0, 10.0, -10.0),
            width: 2,
            height: 2,
        };
        let shifted = RasterGrid {
            transform: GeoTransform::north_up(5.0, 20.0, 10.0, -10.0),
            ..grid.clone()
        };
        let index = AlignedRaster::new(Array2::from_elem((2, 2), 0.5), grid, f32::NAN).unwrap();
        let dem = AlignedRaster::new(Array2::zeros((2, 2)), shifted, -9999.0).unwrap();
        let generator = MaskGenerator {
            threshold: 0.25,
            constraint: ElevationConstraint { ceiling: Some(800.0), floor: None },
            min_region_area: 0.0,
            tolerance: 1e-6,
        };
        assert!(matches!(generator.generate(&index, Some(&dem)), Err(LakeError::GridMismatch(_))));
    }
}
