//! Logistic water-probability models
//!
//! Scores a fixed, ordered band list with a linear model and maps the score
//! through a two-class sigmoid. Optical and SAR models carry disjoint
//! coefficients and must never be interchanged.

use crate::algebra::{Image, Scene};
use crate::types::{FusionError, FusionResult};

const OPTICAL_COEFFICIENTS: [f64; 8] = [
    -18.967214469349052,
    38.400708323537344,
    25.49189114765653,
    -22.58952137305692,
    -5.108155013068395,
    -25.101566051936846,
    4.50423157543959,
    1.0219745060336451,
];

const SAR_COEFFICIENTS: [f64; 8] = [
    -0.05876135869889348,
    -0.03920879220095715,
    0.14396553677593862,
    0.49006037880688985,
    -0.4439070142915821,
    0.42711910382835183,
    -0.0038731568155142815,
    -10.99308715043533,
];

const OPTICAL_BANDS: [&str; 7] = ["blue", "green", "red", "nir", "swir1", "swir2", "mndwi"];

const SAR_BANDS: [&str; 7] = ["VV", "VH", "VV_mean", "VH_mean", "VV_stdDev", "VH_stdDev", "VVVH"];

/// Radius (pixels) of the focal mean applied to the SAR linear score
const SAR_SCORE_SMOOTHING: f64 = 1.0;

/// Band weights followed by one bias term
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientVector {
    weights: Vec<f64>,
}

impl CoefficientVector {
    pub fn new(weights: Vec<f64>) -> FusionResult<Self> {
        if weights.is_empty() {
            return Err(FusionError::Configuration("coefficient vector is empty".to_string()));
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite()) {
            return Err(FusionError::Configuration(format!("non-finite coefficient {}", bad)));
        }
        Ok(Self { weights })
    }

    pub fn band_weights(&self) -> &[f64] {
        &self.weights[..self.weights.len() - 1]
    }

    pub fn bias(&self) -> f64 {
        self.weights[self.weights.len() - 1]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Linear score of one pixel's band values
    pub fn score(&self, values: &[f64]) -> f64 {
        self.band_weights()
            .iter()
            .zip(values)
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.bias()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Optical,
    Sar,
    /// Caller-supplied bands and coefficients
    Custom,
}

/// Immutable model configuration: ordered bands plus coefficients
#[derive(Debug, Clone)]
pub struct WaterModel {
    kind: ModelKind,
    bands: Vec<String>,
    coefficients: CoefficientVector,
    score_smoothing: Option<f64>,
}

impl WaterModel {
    /// Build a model, failing fast when `coefficients.len() != bands.len() + 1`
    pub fn new(
        kind: ModelKind,
        bands: &[&str],
        coefficients: CoefficientVector,
        score_smoothing: Option<f64>,
    ) -> FusionResult<Self> {
        if coefficients.len() != bands.len() + 1 {
            return Err(FusionError::Configuration(format!(
                "{:?} model has {} bands but {} coefficients (expected {})",
                kind,
                bands.len(),
                coefficients.len(),
                bands.len() + 1
            )));
        }
        Ok(Self {
            kind,
            bands: bands.iter().map(|b| b.to_string()).collect(),
            coefficients,
            score_smoothing,
        })
    }

    /// Landsat 8 surface-reflectance model
    pub fn optical() -> FusionResult<Self> {
        Self::new(
            ModelKind::Optical,
            &OPTICAL_BANDS,
            CoefficientVector::new(OPTICAL_COEFFICIENTS.to_vec())?,
            None,
        )
    }

    /// Sentinel-1 backscatter model; smooths the score before the sigmoid
    pub fn sar() -> FusionResult<Self> {
        Self::new(
            ModelKind::Sar,
            &SAR_BANDS,
            CoefficientVector::new(SAR_COEFFICIENTS.to_vec())?,
            Some(SAR_SCORE_SMOOTHING),
        )
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn coefficients(&self) -> &CoefficientVector {
        &self.coefficients
    }

    pub fn score_smoothing(&self) -> Option<f64> {
        self.score_smoothing
    }
}

/// Closed-form logistic sigmoid
pub fn sigmoid(y: f64) -> f64 {
    1.0 / (1.0 + (-y).exp())
}

/// Positive class of the two-way softmax over `[-y, y]`
///
/// Algebraically equal to `sigmoid(y)`.
pub fn two_class_sigmoid(score: &Image) -> Image {
    let classes = Image::cat(&[score.neg(), score.clone()]);
    let proba = classes
        .neg()
        .exp()
        .add(&Image::constant(1.0))
        .reciprocal();
    proba
        .divide(&proba.reduce_bands(crate::algebra::Reducer::Sum))
        .select_index(1)
}

pub struct LogisticWaterClassifier {
    model: WaterModel,
}

impl LogisticWaterClassifier {
    pub fn new(model: WaterModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &WaterModel {
        &self.model
    }

    /// Check that every band the model needs is present
    pub fn check_bands(&self, available: &[String]) -> FusionResult<()> {
        let missing: Vec<&str> = self
            .model
            .bands
            .iter()
            .filter(|b| !available.contains(b))
            .map(|b| b.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FusionError::Configuration(format!(
                "{:?} model is missing bands {:?} (available: {:?})",
                self.model.kind, missing, available
            )))
        }
    }

    /// Dot product of `[b0, .., bk, 1]` with the coefficients
    pub fn linear_score(&self, input: &Image) -> Image {
        let bands: Vec<&str> = self.model.bands.iter().map(|b| b.as_str()).collect();
        input
            .select(&bands)
            .add_bands(&Image::constant(1.0).rename("bias"), false)
            .multiply(&Image::constants(self.model.coefficients.as_slice()))
            .reduce_bands(crate::algebra::Reducer::Sum)
    }

    /// Single-band `proba` image in [0, 1]
    ///
    /// Validity follows the first model band only, not the union of all bands.
    pub fn predict(&self, input: &Image) -> Image {
        let mut score = self.linear_score(input);
        if let Some(radius) = self.model.score_smoothing {
            score = score.focal_mean(radius);
        }
        let first_band = input.select(&[self.model.bands[0].as_str()]);
        two_class_sigmoid(&score)
            .update_mask(&first_band.mask())
            .rename("proba")
    }

    /// Predict one scene, clipped to the rectangle bounding its footprint
    pub fn predict_scene(&self, scene: &Scene) -> Image {
        log::debug!("{:?} prediction for scene {}", self.model.kind, scene.id);
        self.predict(&scene.image).clip(&scene.footprint.bounding_rectangle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{LocalEvaluator, RasterAlgebra};
    use crate::types::{Grid, Plane, Raster};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};

    fn optical_raster(values: [f32; 7], nodata_first: bool) -> Raster {
        let grid = Grid::new(0.0, 2.0, 1.0, 1, 2, "EPSG:4326");
        let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        let mut raster = Raster::new("LC08_test", grid, time);
        for (k, name) in OPTICAL_BANDS.iter().enumerate() {
            let mut plane = Plane::from_elem((1, 2), values[k]);
            if nodata_first && k == 0 {
                plane[[0, 1]] = f32::NAN;
            }
            raster = raster.with_band(name, plane).unwrap();
        }
        raster
    }

    #[test]
    fn test_coefficient_length_checked() {
        let short = CoefficientVector::new(vec![1.0, 2.0]).unwrap();
        let err = WaterModel::new(ModelKind::Optical, &OPTICAL_BANDS, short, None).unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
        assert!(CoefficientVector::new(vec![]).is_err());
        assert!(CoefficientVector::new(vec![f64::NAN]).is_err());
    }

    #[test]
    fn test_custom_model_labelled_as_custom() {
        let weights = CoefficientVector::new(vec![1.0, -1.0, 0.5]).unwrap();
        let model = WaterModel::new(ModelKind::Custom, &["b0", "b1"], weights, None).unwrap();
        assert_eq!(model.kind(), ModelKind::Custom);

        let err = LogisticWaterClassifier::new(model)
            .check_bands(&["b0".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("Custom model is missing bands"));

        let short = CoefficientVector::new(vec![1.0]).unwrap();
        let err = WaterModel::new(ModelKind::Custom, &["b0", "b1"], short, None).unwrap_err();
        assert!(err.to_string().starts_with("Configuration error: Custom model"));
    }

    #[test]
    fn test_builtin_models_are_consistent() {
        let optical = WaterModel::optical().unwrap();
        let sar = WaterModel::sar().unwrap();
        assert_eq!(optical.coefficients().len(), optical.bands().len() + 1);
        assert_eq!(sar.coefficients().len(), sar.bands().len() + 1);
        assert_eq!(optical.score_smoothing(), None);
        assert_eq!(sar.score_smoothing(), Some(1.0));
        assert_ne!(optical.coefficients(), sar.coefficients());
    }

    #[test]
    fn test_prediction_matches_closed_form() {
        let values = [0.05, 0.08, 0.06, 0.04, 0.02, 0.01, 0.6];
        let classifier = LogisticWaterClassifier::new(WaterModel::optical().unwrap());
        let out = LocalEvaluator::new()
            .evaluate(&classifier.predict(&Image::source(optical_raster(values, false))))
            .unwrap();
        let expected = sigmoid(classifier.model().coefficients().score(&values.map(|v| v as f64)));
        let band = out.band("proba").unwrap();
        assert_eq!(out.band_names(), vec!["proba".to_string()]);
        assert_abs_diff_eq!(band.values[[0, 0]] as f64, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_first_band_nodata_propagates() {
        let classifier = LogisticWaterClassifier::new(WaterModel::optical().unwrap());
        let out = LocalEvaluator::new()
            .evaluate(&classifier.predict(&Image::source(optical_raster([0.1; 7], true))))
            .unwrap();
        let band = out.band("proba").unwrap();
        assert!(band.valid[[0, 0]]);
        assert!(!band.valid[[0, 1]]);
    }

    #[test]
    fn test_missing_band_reported() {
        let classifier = LogisticWaterClassifier::new(WaterModel::sar().unwrap());
        let err = classifier.check_bands(&["VV".to_string(), "VH".to_string()]).unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
    }

    #[test]
    fn test_monotonic_in_positive_weights() {
        let coefficients = WaterModel::optical().unwrap().coefficients().clone();
        let base = [0.05, 0.08, 0.06, 0.04, 0.02, 0.01, 0.2];
        for (k, &w) in coefficients.band_weights().iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            let mut previous = sigmoid(coefficients.score(&base));
            for step in 1..20 {
                let mut values = base;
                values[k] += step as f64 * 0.01;
                let p = sigmoid(coefficients.score(&values));
                assert!(p >= previous, "band {} not monotonic", k);
                previous = p;
            }
        }
    }
}
