//! Python bindings for the per-pixel core

use chrono::{DateTime, Utc};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray3};
use pyo3::prelude::*;

use crate::algebra::kernels;
use crate::algebra::{Image, LocalEvaluator, RasterAlgebra};
use crate::core::{CoefficientVector, LogisticWaterClassifier, ModelKind, WaterModel};
use crate::export::{NamingScheme, SceneName};
use crate::types::{FusionError, Grid, Raster};

fn to_py_err(e: FusionError) -> PyErr {
    match e {
        FusionError::Configuration(_) | FusionError::InvalidFormat(_) => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    }
}

/// Water probability for a (bands, rows, cols) stack; NaN marks nodata
///
/// `model` is "optical", "sar" or "custom"; custom models need `coefficients`
/// (one weight per band plus bias) and accept an optional score smoothing radius.
#[pyfunction]
#[pyo3(signature = (bands, model, coefficients = None, smoothing = None))]
fn water_probability<'py>(
    py: Python<'py>,
    bands: PyReadonlyArray3<'py, f32>,
    model: &str,
    coefficients: Option<Vec<f64>>,
    smoothing: Option<f64>,
) -> PyResult<&'py PyArray2<f32>> {
    let stack = bands.as_array();
    let (count, rows, cols) = stack.dim();

    let model = match (model.to_lowercase().as_str(), coefficients) {
        ("optical", None) => WaterModel::optical(),
        ("sar", None) => WaterModel::sar(),
        ("custom", Some(weights)) => {
            let names: Vec<String> = (0..count).map(|k| format!("b{}", k)).collect();
            let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            CoefficientVector::new(weights).and_then(|c| WaterModel::new(ModelKind::Custom, &names, c, smoothing))
        }
        (other, _) => Err(FusionError::Configuration(format!(
            "model '{}' needs coefficients only when custom (optical, sar, custom)",
            other
        ))),
    }
    .map_err(to_py_err)?;
    if model.bands().len() != count {
        return Err(to_py_err(FusionError::Configuration(format!(
            "model expects {} bands {:?}, got {}",
            model.bands().len(),
            model.bands(),
            count
        ))));
    }

    let grid = Grid::new(0.0, rows as f64, 1.0, rows, cols, "PIXEL");
    let mut raster = Raster::new("array", grid, DateTime::<Utc>::default());
    for (k, name) in model.bands().iter().enumerate() {
        let plane = stack.index_axis(ndarray::Axis(0), k).to_owned();
        raster = raster.with_band(name, plane).map_err(to_py_err)?;
    }

    let classifier = LogisticWaterClassifier::new(model);
    let out = LocalEvaluator::new()
        .evaluate(&classifier.predict(&Image::source(raster)))
        .map_err(to_py_err)?;
    let proba = out
        .band("proba")
        .ok_or_else(|| to_py_err(FusionError::Processing("prediction lost its proba band".to_string())))?;
    let values = ndarray::Zip::from(&proba.values)
        .and(&proba.valid)
        .map_collect(|&v, &ok| if ok { v } else { f32::NAN });
    Ok(values.into_pyarray(py))
}

/// `max(percentile(values), floor)`; the floor wins for empty input
#[pyfunction]
#[pyo3(signature = (values, percentile = 50.0, floor = 5.0))]
fn fill_threshold(mut values: Vec<f64>, percentile: f64, floor: f64) -> f64 {
    values.retain(|v| v.is_finite());
    match kernels::percentile(&mut values, percentile) {
        Some(p) => p.max(floor),
        None => floor,
    }
}

/// Otsu threshold of the samples, or None for a degenerate histogram
#[pyfunction]
fn otsu_threshold(values: Vec<f64>) -> Option<f64> {
    kernels::otsu_threshold(&values, 255)
}

/// (sensor, date token, description, asset name) for a scene identifier
#[pyfunction]
#[pyo3(signature = (identifier, pipeline = "optical"))]
fn export_name(identifier: &str, pipeline: &str) -> PyResult<(String, String, String, String)> {
    let scheme = match pipeline {
        "sar" => NamingScheme::SarPipeline,
        "optical" => NamingScheme::OpticalPipeline,
        other => {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "Invalid pipeline: {}",
                other
            )))
        }
    };
    let name = SceneName::parse(identifier, scheme).map_err(to_py_err)?;
    Ok((
        name.sensor.tag().to_string(),
        name.date_token.clone(),
        name.description(),
        name.asset_name.clone(),
    ))
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(water_probability, m)?)?;
    m.add_function(wrap_pyfunction!(fill_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(otsu_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(export_name, m)?)?;
    Ok(())
}
