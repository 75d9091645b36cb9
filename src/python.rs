use crate::config::PipelineConfig;
use crate::core::crs::GdalEngine;
use crate::core::index::normalized_difference;
use crate::core::tiler::{tile_offsets, verify_tile_pairs};
use crate::io::strip_index::StripIndex;
use crate::pipeline::Pipeline;
use crate::types::LakeError;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;
use std::path::Path;

fn to_py_err(e: LakeError) -> PyErr {
    match e {
        LakeError::InvalidInput(_) | LakeError::GridMismatch(_) => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyPipeline>()?;
    m.add_function(wrap_pyfunction!(py_normalized_difference, m)?)?;
    m.add_function(wrap_pyfunction!(py_tile_offsets, m)?)?;
    m.add_function(wrap_pyfunction!(py_verify_tiles, m)?)?;
    Ok(())
}

/// `(a - b) / (a + b)` with NaN where the denominator is zero
#[pyfunction]
#[pyo3(name = "normalized_difference")]
fn py_normalized_difference<'py>(
    py: Python<'py>,
    a: PyReadonlyArray2<f32>,
    b: PyReadonlyArray2<f32>,
) -> PyResult<&'py PyArray2<f32>> {
    let a = a.as_array().to_owned();
    let b = b.as_array().to_owned();
    let index = py.allow_threads(|| normalized_difference(&a, &b)).map_err(to_py_err)?;
    Ok(index.into_pyarray(py))
}

#[pyfunction]
#[pyo3(name = "tile_offsets")]
fn py_tile_offsets(height: usize, width: usize, size: usize, stride: usize) -> PyResult<Vec<(usize, usize)>> {
    let offsets = tile_offsets(height, width, size, stride).map_err(to_py_err)?;
    Ok(offsets.into_iter().map(|o| (o.row, o.col)).collect())
}

/// Returns `(images, masks, missing_masks, missing_images)`
#[pyfunction]
#[pyo3(name = "verify_tiles")]
fn py_verify_tiles(root: String) -> PyResult<(usize, usize, Vec<String>, Vec<String>)> {
    let report = verify_tile_pairs(&root).map_err(to_py_err)?;
    Ok((report.images, report.masks, report.missing_masks, report.missing_images))
}

/// Python wrapper for Pipeline
#[pyclass(name = "Pipeline")]
struct PyPipeline {
    inner: Pipeline,
}

#[pymethods]
impl PyPipeline {
    /// Elevation comes from `dem` when given, otherwise from `strip_index`
    #[new]
    #[pyo3(signature = (strip_index=None, config_path=None, dem=None))]
    fn new(strip_index: Option<String>, config_path: Option<String>, dem: Option<String>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => PipelineConfig::from_json_file(path).map_err(to_py_err)?,
            None => PipelineConfig::default(),
        };
        let engine = Box::new(GdalEngine::new());
        let inner = match (dem, strip_index) {
            (Some(dem), _) => Pipeline::from_dem(config, dem, engine).map_err(to_py_err)?,
            (None, Some(path)) => {
                let index = StripIndex::from_geojson_file(&path, None).map_err(to_py_err)?;
                Pipeline::new(config, index, engine).map_err(to_py_err)?
            }
            (None, None) => {
                return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(
                    "either strip_index or dem is required",
                ))
            }
        };
        Ok(PyPipeline { inner })
    }

    /// Process one scene and return its report as JSON
    fn process_scene(&self, py: Python<'_>, scene: String, out_dir: String) -> PyResult<String> {
        let report = py
            .allow_threads(|| self.inner.process_scene(Path::new(&scene), Path::new(&out_dir)))
            .map_err(|failure| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", failure)))?;
        serde_json::to_string(&report)
            .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)))
    }

    fn __repr__(&self) -> String {
        format!(
            "Pipeline(threshold={}, tile_size={}, stride={})",
            self.inner.config().index_threshold,
            self.inner.config().tile.size,
            self.inner.config().tile.stride
        )
    }
}
