//! Radiometric slope correction of Sentinel-1 backscatter
//!
//! Volumetric scattering model: sigma0 is normalised to gamma0 over the
//! ellipsoid incidence angle, then divided by a slope correction factor
//! built from the terrain slope in the range direction. Layover and shadow
//! pixels are masked together with a buffer around them.

use crate::algebra::{Image, SlopeCorrectionSpec};

/// Slope-correction parameters
#[derive(Debug, Clone)]
pub struct SlopeCorrectionParams {
    /// Band carrying the incidence angle in degrees
    pub angle_band: String,
    /// Layover/shadow buffer (meters)
    pub buffer: f64,
    /// Search cap of the layover/shadow distance (pixels)
    pub distance_neighborhood: usize,
}

impl Default for SlopeCorrectionParams {
    fn default() -> Self {
        Self {
            angle_band: "angle".to_string(),
            buffer: 50.0,
            distance_neighborhood: 30,
        }
    }
}

/// Terrain flattening of every backscatter band against an elevation model
pub struct SlopeCorrection {
    params: SlopeCorrectionParams,
}

impl SlopeCorrection {
    pub fn new() -> Self {
        Self {
            params: SlopeCorrectionParams::default(),
        }
    }

    pub fn with_params(params: SlopeCorrectionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SlopeCorrectionParams {
        &self.params
    }

    /// Corrected backscatter bands (dB) followed by the angle band
    ///
    /// Without an elevation model the terrain is taken as flat, which still
    /// normalises for the incidence angle. Elevation nodata reads as 0.
    pub fn apply(&self, image: &Image, elevation: Option<&Image>) -> Image {
        let flat = Image::constant(0.0);
        let elevation = elevation.unwrap_or(&flat);
        image.slope_correction(
            elevation,
            SlopeCorrectionSpec {
                angle_band: self.params.angle_band.clone(),
                buffer: self.params.buffer,
                distance_neighborhood: self.params.distance_neighborhood,
            },
        )
    }
}

impl Default for SlopeCorrection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{LocalEvaluator, RasterAlgebra};
    use crate::types::{FusionError, Grid, Plane, Raster};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};

    const ROWS: usize = 6;
    const COLS: usize = 12;

    fn grid() -> Grid {
        Grid::new(400_000.0, 3_000_000.0, 30.0, ROWS, COLS, "EPSG:32615")
    }

    /// Incidence angle grows eastward, i.e. the sensor looks east
    fn angle_deg(j: usize) -> f32 {
        35.0 + 0.01 * j as f32
    }

    fn backscatter() -> Image {
        let time = Utc.with_ymd_and_hms(2020, 6, 10, 12, 0, 0).unwrap();
        let raster = Raster::new("S1A_test", grid(), time)
            .with_band("VV", Plane::from_elem((ROWS, COLS), -21.0))
            .unwrap()
            .with_band("VH", Plane::from_elem((ROWS, COLS), -27.0))
            .unwrap()
            .with_band("angle", Plane::from_shape_fn((ROWS, COLS), |(_, j)| angle_deg(j)))
            .unwrap();
        Image::source(raster)
    }

    fn dem(f: impl Fn(usize) -> f32) -> Image {
        let time = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let raster = Raster::new("dem", grid(), time)
            .with_band("elevation", Plane::from_shape_fn((ROWS, COLS), |(_, j)| f(j)))
            .unwrap();
        Image::source(raster)
    }

    fn flat_expected(v: f32, j: usize) -> f32 {
        v - 10.0 * angle_deg(j).to_radians().cos().log10()
    }

    #[test]
    fn test_flat_terrain_without_elevation() {
        let out = LocalEvaluator::new()
            .evaluate(&SlopeCorrection::new().apply(&backscatter(), None))
            .unwrap();
        assert_eq!(out.band_names(), vec!["VV", "VH", "angle"]);
        let vv = out.band("VV").unwrap();
        let vh = out.band("VH").unwrap();
        assert_eq!(vv.valid_count(), ROWS * COLS);
        assert_abs_diff_eq!(vv.values[[2, 0]], flat_expected(-21.0, 0), epsilon = 1e-3);
        assert_abs_diff_eq!(vh.values[[3, 7]], flat_expected(-27.0, 7), epsilon = 1e-3);
        assert_abs_diff_eq!(out.band("angle").unwrap().values[[0, 5]], angle_deg(5), epsilon = 1e-6);
    }

    #[test]
    fn test_elevation_nodata_reads_as_sea_level() {
        let out = LocalEvaluator::new()
            .evaluate(&SlopeCorrection::new().apply(&backscatter(), Some(&dem(|_| f32::NAN))))
            .unwrap();
        let vv = out.band("VV").unwrap();
        assert_eq!(vv.valid_count(), ROWS * COLS);
        assert_abs_diff_eq!(vv.values[[1, 4]], flat_expected(-21.0, 4), epsilon = 1e-3);
    }

    #[test]
    fn test_slope_facing_sensor_is_flattened() {
        // rises toward the east, so its downslope side faces the sensor
        let rise = 10f32.to_radians().tan() * 30.0;
        let out = LocalEvaluator::new()
            .evaluate(&SlopeCorrection::new().apply(&backscatter(), Some(&dem(|j| j as f32 * rise))))
            .unwrap();
        let vv = out.band("VV").unwrap();
        assert_eq!(vv.valid_count(), ROWS * COLS);
        let j = 6;
        let theta = angle_deg(j).to_radians();
        let alpha = 10f32.to_radians();
        let half_pi = std::f32::consts::FRAC_PI_2;
        let scf = (half_pi - theta + alpha).tan() / (half_pi - theta).tan();
        let expected = flat_expected(-21.0, j) - 10.0 * scf.log10();
        assert_abs_diff_eq!(vv.values[[3, j]], expected, epsilon = 1e-2);
        assert!(vv.values[[3, j]] < flat_expected(-21.0, j));
    }

    #[test]
    fn test_layover_masked_with_buffer() {
        // flat to the west, a 50 degree ramp from column 6 onward
        let rise = 50f32.to_radians().tan() * 30.0;
        let elevation = dem(|j| if j < 6 { 0.0 } else { (j - 5) as f32 * rise });
        let out = LocalEvaluator::new()
            .evaluate(&SlopeCorrection::new().apply(&backscatter(), Some(&elevation)))
            .unwrap();
        let vv = out.band("VV").unwrap();
        for i in 0..ROWS {
            // layover on the ramp
            assert_eq!(vv.value_at(i, 8), None);
            assert_eq!(vv.value_at(i, 6), None);
            // 30 m from the ramp, inside the 50 m buffer
            assert_eq!(vv.value_at(i, 5), None);
            // 60 m away and flat
            assert_abs_diff_eq!(vv.value_at(i, 4).unwrap(), flat_expected(-21.0, 4), epsilon = 1e-3);
        }
        assert_eq!(out.band("angle").unwrap().valid_count(), ROWS * COLS);
    }

    #[test]
    fn test_zero_buffer_masks_only_layover() {
        let rise = 50f32.to_radians().tan() * 30.0;
        let elevation = dem(|j| if j < 6 { 0.0 } else { (j - 5) as f32 * rise });
        let correction = SlopeCorrection::with_params(SlopeCorrectionParams {
            buffer: 0.0,
            ..SlopeCorrectionParams::default()
        });
        let out = LocalEvaluator::new()
            .evaluate(&correction.apply(&backscatter(), Some(&elevation)))
            .unwrap();
        let vv = out.band("VV").unwrap();
        assert!(vv.value_at(2, 5).is_some());
        assert_eq!(vv.value_at(2, 6), None);
    }

    #[test]
    fn test_missing_angle_band() {
        let time = Utc.with_ymd_and_hms(2020, 6, 10, 12, 0, 0).unwrap();
        let raster = Raster::new("S1A_test", grid(), time)
            .with_band("VV", Plane::from_elem((ROWS, COLS), -21.0))
            .unwrap();
        let err = LocalEvaluator::new()
            .evaluate(&SlopeCorrection::new().apply(&Image::source(raster), None))
            .unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
    }
}
