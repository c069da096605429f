use chrono::{Datelike, Months};

use super::PipelineRequest;
use crate::algebra::{Image, Scene};
use crate::core::edge_threshold::{AdaptiveEdgeThreshold, EdgeOtsuParams};
use crate::core::features::{max_extent, sar_features};
use crate::core::slope_correction::{SlopeCorrection, SlopeCorrectionParams};
use crate::core::{LogisticWaterClassifier, WaterModel};
use crate::export::{ExportParams, ExportRegion, ExportReport, ExportScheduler, NamingScheme, RetryPolicy, Sensor, Sleeper};
use crate::io::{AssetStore, SceneSource};
use crate::types::{FusionError, FusionResult};

#[derive(Debug, Clone)]
pub struct SarPipelineParams {
    pub slope_correction: SlopeCorrectionParams,
    pub threshold: EdgeOtsuParams,
    /// Months of imagery fetched before the requested start
    pub lookback_months: u32,
    pub retry: RetryPolicy,
}

impl Default for SarPipelineParams {
    fn default() -> Self {
        Self {
            slope_correction: SlopeCorrectionParams::default(),
            threshold: EdgeOtsuParams::default(),
            lookback_months: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Sentinel-1 scenes to `{proba, water}` assets in the target collection
pub struct SarPipeline<'a, S: SceneSource + ?Sized, A: AssetStore> {
    source: &'a S,
    store: &'a A,
    sleeper: &'a dyn Sleeper,
    params: SarPipelineParams,
    slope_correction: SlopeCorrection,
    classifier: LogisticWaterClassifier,
    threshold: AdaptiveEdgeThreshold,
}

impl<'a, S: SceneSource + ?Sized, A: AssetStore> SarPipeline<'a, S, A> {
    pub fn new(source: &'a S, store: &'a A, sleeper: &'a dyn Sleeper) -> FusionResult<Self> {
        Self::with_params(source, store, sleeper, SarPipelineParams::default())
    }

    pub fn with_params(
        source: &'a S,
        store: &'a A,
        sleeper: &'a dyn Sleeper,
        params: SarPipelineParams,
    ) -> FusionResult<Self> {
        Ok(Self {
            source,
            store,
            sleeper,
            slope_correction: SlopeCorrection::with_params(params.slope_correction.clone()),
            classifier: LogisticWaterClassifier::new(WaterModel::sar()?),
            threshold: AdaptiveEdgeThreshold::with_params(params.threshold.clone()),
            params,
        })
    }

    /// Prediction graph for one scene: `proba` and `water`, clipped to the footprint bounds
    ///
    /// Backscatter is terrain-corrected against `elevation` (flat when `None`)
    /// before the texture and ratio features are derived.
    pub fn predict_scene(&self, scene: &Scene, elevation: Option<&Image>) -> FusionResult<Scene> {
        let corrected = self.slope_correction.apply(&scene.image, elevation);
        let features = sar_features(&corrected);
        let mut proba = self.classifier.predict(&features);
        match self.source.monthly_recurrence(scene.time.month())? {
            Some(recurrence) => proba = proba.multiply(&max_extent(&recurrence)),
            None => log::debug!("No recurrence layer for month {}, skipping extent constraint", scene.time.month()),
        }
        let water = self.threshold.apply(&proba, &scene.footprint);
        let image = scene
            .image
            .select_none()
            .add_bands(&Image::cat(&[proba, water]), false)
            .clip(&scene.footprint.bounding_rectangle());
        Ok(scene.with_image(image))
    }

    pub fn run(&self, request: &PipelineRequest) -> FusionResult<ExportReport> {
        match self.store.create_collection(&request.target_collection) {
            Ok(()) => {}
            Err(FusionError::AssetExists(_)) => {
                log::info!("Collection {} exists, skipping creation", request.target_collection)
            }
            Err(e) => {
                log::error!("Could not create collection {}: {}", request.target_collection, e);
                return Err(e);
            }
        }

        log::info!("Time range: {} - {}", request.start, request.end);
        let start = request
            .start
            .checked_sub_months(Months::new(self.params.lookback_months))
            .ok_or_else(|| FusionError::Configuration(format!("cannot look back from {}", request.start)))?;
        let scenes = self.source.scenes(Sensor::Sentinel1, &request.region, start, request.end)?;
        log::info!("Number of Sentinel-1 images: {}", scenes.len());

        let elevation = self.source.elevation()?;
        if elevation.is_none() {
            log::info!("No elevation model available, slope correction assumes flat terrain");
        }
        let predictions = scenes
            .scenes()
            .iter()
            .map(|s| self.predict_scene(s, elevation.as_ref()))
            .collect::<FusionResult<Vec<_>>>()?;

        let params = ExportParams::new(&request.target_collection, ExportRegion::Footprint, NamingScheme::SarPipeline);
        ExportScheduler::new(self.store, self.sleeper, params)
            .with_policy(self.params.retry.clone())
            .export_all(&predictions)
    }
}
