use crate::algebra::{EdgeOtsuSpec, Image};
use crate::config::{COARSE_SCALE_M, REGION_MAX_PIXELS};
use crate::types::Geometry;

/// Edge-restricted Otsu parameters
#[derive(Debug, Clone)]
pub struct EdgeOtsuParams {
    /// Seed for the initial water/non-water partition
    pub initial_threshold: f32,
    /// Histogram sampling scale in meters
    pub scale: f64,
    /// Threshold used when the edge histogram is degenerate
    pub thresh_no_data: f32,
    /// Buffer around the seed boundary feeding the histogram (meters)
    pub edge_buffer: f64,
    /// Water lies above the threshold
    pub invert: bool,
    pub max_pixels: u64,
}

impl Default for EdgeOtsuParams {
    fn default() -> Self {
        Self {
            initial_threshold: 0.5,
            scale: COARSE_SCALE_M,
            thresh_no_data: 0.5,
            edge_buffer: 300.0,
            invert: true,
            max_pixels: REGION_MAX_PIXELS,
        }
    }
}

/// Probability to binary water mask via an Otsu threshold near class edges
pub struct AdaptiveEdgeThreshold {
    params: EdgeOtsuParams,
}

impl AdaptiveEdgeThreshold {
    pub fn new() -> Self {
        Self {
            params: EdgeOtsuParams::default(),
        }
    }

    pub fn with_params(params: EdgeOtsuParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EdgeOtsuParams {
        &self.params
    }

    /// Single-band `water` mask (0/1) for a single-band probability image
    ///
    /// The histogram region is the coarse bounding rectangle of `region`.
    /// Output validity equals input validity; a region without valid pixels
    /// yields a fully invalid mask.
    pub fn apply(&self, probability: &Image, region: &Geometry) -> Image {
        log::debug!("Edge Otsu parameters: {:?}", self.params);
        probability
            .edge_otsu(EdgeOtsuSpec {
                initial_threshold: self.params.initial_threshold,
                scale: self.params.scale,
                thresh_no_data: self.params.thresh_no_data,
                edge_buffer: self.params.edge_buffer,
                region: region.bounding_rectangle(),
                invert: self.params.invert,
                max_pixels: self.params.max_pixels,
            })
            .rename("water")
    }
}

impl Default for AdaptiveEdgeThreshold {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{LocalEvaluator, RasterAlgebra};
    use crate::types::{FusionError, Grid, Plane, Raster};
    use chrono::{TimeZone, Utc};

    fn probability(values: Plane) -> (Image, Geometry) {
        let (rows, cols) = values.dim();
        let grid = Grid::new(0.0, rows as f64 * 30.0, 30.0, rows, cols, "EPSG:32615");
        let region = Geometry::Rectangle(grid.bounds());
        let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        let raster = Raster::new("p", grid, time).with_band("proba", values).unwrap();
        (Image::source(raster), region)
    }

    fn fine_params() -> EdgeOtsuParams {
        EdgeOtsuParams {
            scale: 30.0,
            edge_buffer: 90.0,
            ..EdgeOtsuParams::default()
        }
    }

    #[test]
    fn test_bimodal_split() {
        // left half water (0.9), right half land (0.1), with mild noise
        let values = Plane::from_shape_fn((20, 20), |(i, j)| {
            let noise = ((i * 7 + j * 13) % 5) as f32 * 0.01;
            if j < 10 {
                0.9 - noise
            } else {
                0.1 + noise
            }
        });
        let (img, region) = probability(values);
        let out = LocalEvaluator::new()
            .evaluate(&AdaptiveEdgeThreshold::with_params(fine_params()).apply(&img, &region))
            .unwrap();
        let water = out.band("water").unwrap();
        assert_eq!(water.values[[3, 2]], 1.0);
        assert_eq!(water.values[[3, 17]], 0.0);
        assert!(water.values.iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_no_valid_pixels_gives_invalid_mask() {
        let (img, region) = probability(Plane::from_elem((4, 4), f32::NAN));
        let out = LocalEvaluator::new()
            .evaluate(&AdaptiveEdgeThreshold::new().apply(&img, &region))
            .unwrap();
        assert_eq!(out.band("water").unwrap().valid_count(), 0);
    }

    #[test]
    fn test_degenerate_histogram_does_not_fail() {
        let (img, region) = probability(Plane::from_elem((6, 6), 0.2));
        let out = LocalEvaluator::new()
            .evaluate(&AdaptiveEdgeThreshold::with_params(fine_params()).apply(&img, &region))
            .unwrap();
        let water = out.band("water").unwrap();
        assert_eq!(water.valid_count(), 36);
        assert!(water.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_multi_band_input_rejected() {
        let (img, region) = probability(Plane::zeros((2, 2)));
        let two = Image::cat(&[img.clone(), img]);
        let err = LocalEvaluator::new()
            .evaluate(&AdaptiveEdgeThreshold::new().apply(&two, &region))
            .unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
    }
}
