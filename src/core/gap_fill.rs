//! Cross-sensor temporal gap filling
//!
//! Cloud holes in an optical water mask are filled from the most recent SAR
//! probability in a short window before the optical acquisition. The SAR
//! probability threshold is learned locally: the chosen percentile of SAR
//! probability over optical water pixels that sit close to the optical
//! water edge, floored so it never drops below a fixed minimum.

use chrono::Duration;

use crate::algebra::{Image, ImageCollection, Number, Reducer, Scene};
use crate::config::{FINE_SCALE_M, REGION_MAX_PIXELS};
use crate::core::edge_threshold::AdaptiveEdgeThreshold;
use crate::types::{FusionError, FusionResult, Raster};

pub const P_THRESH_KEY: &str = "p_thresh";
pub const USABLE_KEY: &str = "usable";

#[derive(Debug, Clone)]
pub struct GapFillParams {
    pub canny_low: f32,
    pub canny_high: f32,
    pub canny_sigma: f32,
    /// Window start relative to the optical acquisition (inclusive)
    pub window_before: Duration,
    /// Window end relative to the optical acquisition (exclusive)
    pub window_after: Duration,
    /// Keeps a literal 0 out of the SAR composite
    pub epsilon: f64,
    /// Squared-pixel distance below which a pixel counts as near the edge
    pub edge_distance: f64,
    pub distance_neighborhood: usize,
    pub fill_percentile: f64,
    /// Lower bound of the fill threshold (probability percent)
    pub p_thresh_floor: f64,
    pub percentile_scale: f64,
    pub max_pixels: u64,
}

impl Default for GapFillParams {
    fn default() -> Self {
        Self {
            canny_low: 0.1,
            canny_high: 0.5,
            canny_sigma: 1.0,
            window_before: Duration::days(15),
            window_after: Duration::days(1),
            epsilon: 1e-3,
            edge_distance: 30.0,
            distance_neighborhood: 256,
            fill_percentile: 50.0,
            p_thresh_floor: 5.0,
            percentile_scale: FINE_SCALE_M,
            max_pixels: REGION_MAX_PIXELS,
        }
    }
}

/// Fill threshold and SAR candidate count recorded on each filled scene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillDecision {
    pub p_thresh: f64,
    pub usable: usize,
}

impl FillDecision {
    /// Read the decision back from a materialized raster's properties
    pub fn from_raster(raster: &Raster) -> FusionResult<Self> {
        let read = |key: &str| {
            raster.property(key).and_then(|v| v.as_number()).ok_or_else(|| {
                FusionError::InvalidFormat(format!("raster {} has no numeric '{}' property", raster.id(), key))
            })
        };
        Ok(Self {
            p_thresh: read(P_THRESH_KEY)?,
            usable: read(USABLE_KEY)? as usize,
        })
    }
}

/// Lazy result of filling one optical scene
#[derive(Debug, Clone)]
pub struct GapFillPlan {
    /// Optical bands plus the filled `water` band, with the decision attached
    pub image: Image,
    pub p_thresh: Number,
    /// SAR candidates inside the time window
    pub usable: usize,
}

pub struct TemporalGapFiller {
    params: GapFillParams,
    threshold: AdaptiveEdgeThreshold,
}

impl TemporalGapFiller {
    pub fn new() -> Self {
        Self::with_params(GapFillParams::default(), AdaptiveEdgeThreshold::new())
    }

    pub fn with_params(params: GapFillParams, threshold: AdaptiveEdgeThreshold) -> Self {
        Self { params, threshold }
    }

    pub fn params(&self) -> &GapFillParams {
        &self.params
    }

    /// SAR scenes overlapping `scene` in `[t - before, t + after)`, newest first
    pub fn candidates(&self, scene: &Scene, sar: &ImageCollection) -> ImageCollection {
        sar.filter_bounds(&scene.footprint)
            .filter_date(scene.time - self.params.window_before, scene.time + self.params.window_after)
            .sort_by_time(false)
            .select(&["proba"])
    }

    /// Build the fill graph for one optical scene carrying a `proba` band
    ///
    /// Pixels valid in the initial optical mask are never overwritten.
    pub fn fill(&self, scene: &Scene, sar: &ImageCollection) -> GapFillPlan {
        let p = &self.params;
        let init_water = self.threshold.apply(&scene.image.select(&["proba"]), &scene.footprint);
        let edges = init_water.canny(p.canny_low, p.canny_high, p.canny_sigma);

        let candidates = self.candidates(scene, sar);
        let usable = candidates.len();
        log::info!("Scene {}: {} SAR candidates in fill window", scene.id, usable);

        let stabilized = candidates
            .reduce_first_non_null()
            .add_bands(&Image::constant(p.epsilon), false)
            .reduce_bands(Reducer::Max)
            .rename("proba_first");

        let near_edge = edges
            .fast_distance_transform(p.distance_neighborhood)
            .lt(&Image::constant(p.edge_distance))
            .and(&init_water);

        let percentile = Number::percentile(
            &stabilized.update_mask(&near_edge),
            p.fill_percentile,
            &scene.footprint,
            p.percentile_scale,
            p.max_pixels,
        );
        let p_thresh = Number::max_of(&[percentile, Number::constant(p.p_thresh_floor)]);

        let water = init_water.unmask(&stabilized.gt(&Image::constant_of(p_thresh.clone())));
        let image = scene
            .image
            .add_bands(&water.rename("water").cast_u8(), false)
            .set(P_THRESH_KEY, p_thresh.clone())
            .set(USABLE_KEY, Number::count(usable));

        GapFillPlan { image, p_thresh, usable }
    }
}

impl Default for TemporalGapFiller {
    fn default() -> Self {
        Self::new()
    }
}
