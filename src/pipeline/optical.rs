use super::PipelineRequest;
use crate::algebra::{ImageCollection, Scene};
use crate::config::{CLOUD_COVER_KEY, MAX_CLOUD_COVER, SAR_ID_PREFIX};
use crate::core::edge_threshold::{AdaptiveEdgeThreshold, EdgeOtsuParams};
use crate::core::features::add_mndwi;
use crate::core::gap_fill::{GapFillParams, TemporalGapFiller};
use crate::core::{LogisticWaterClassifier, WaterModel};
use crate::export::{ExportParams, ExportRegion, ExportReport, ExportScheduler, NamingScheme, RetryPolicy, Sensor, Sleeper};
use crate::io::{AssetStore, SceneSource};
use crate::types::FusionResult;

#[derive(Debug, Clone)]
pub struct OpticalPipelineParams {
    pub threshold: EdgeOtsuParams,
    pub gap_fill: GapFillParams,
    /// Scenes at or above this cloud cover (%) are skipped
    pub max_cloud_cover: f64,
    pub retry: RetryPolicy,
}

impl Default for OpticalPipelineParams {
    fn default() -> Self {
        Self {
            threshold: EdgeOtsuParams::default(),
            gap_fill: GapFillParams::default(),
            max_cloud_cover: MAX_CLOUD_COVER,
            retry: RetryPolicy::default(),
        }
    }
}

/// Landsat 8 scenes to gap-filled `{proba, water}` assets
///
/// The target collection must already hold the SAR pipeline's exports.
pub struct OpticalPipeline<'a, S: SceneSource + ?Sized, A: AssetStore> {
    source: &'a S,
    store: &'a A,
    sleeper: &'a dyn Sleeper,
    params: OpticalPipelineParams,
    classifier: LogisticWaterClassifier,
    gap_filler: TemporalGapFiller,
}

impl<'a, S: SceneSource + ?Sized, A: AssetStore> OpticalPipeline<'a, S, A> {
    pub fn new(source: &'a S, store: &'a A, sleeper: &'a dyn Sleeper) -> FusionResult<Self> {
        Self::with_params(source, store, sleeper, OpticalPipelineParams::default())
    }

    pub fn with_params(
        source: &'a S,
        store: &'a A,
        sleeper: &'a dyn Sleeper,
        params: OpticalPipelineParams,
    ) -> FusionResult<Self> {
        let gap_filler = TemporalGapFiller::with_params(
            params.gap_fill.clone(),
            AdaptiveEdgeThreshold::with_params(params.threshold.clone()),
        );
        Ok(Self {
            source,
            store,
            sleeper,
            classifier: LogisticWaterClassifier::new(WaterModel::optical()?),
            gap_filler,
            params,
        })
    }

    /// Fused graph for one scene: `proba` plus filled `water`, with the fill decision attached
    pub fn fuse_scene(&self, scene: &Scene, sar_predictions: &ImageCollection) -> Scene {
        let with_index = scene.with_image(add_mndwi(&scene.image));
        let prediction = scene.with_image(self.classifier.predict_scene(&with_index));
        let plan = self.gap_filler.fill(&prediction, sar_predictions);
        scene.with_image(plan.image)
    }

    pub fn run(&self, request: &PipelineRequest) -> FusionResult<ExportReport> {
        log::info!("Time range: {} - {}", request.start, request.end);

        let sar_predictions = self
            .store
            .load_collection(&request.target_collection)?
            .filter_id_prefix(SAR_ID_PREFIX);
        log::info!("SAR predictions available in {}: {}", request.target_collection, sar_predictions.len());

        let scenes = self
            .source
            .scenes(Sensor::Landsat8, &request.region, request.start, request.end)?
            .filter_property_lt(CLOUD_COVER_KEY, self.params.max_cloud_cover);
        log::info!("Number of Landsat 8 images: {}", scenes.len());

        let fused: Vec<Scene> = scenes
            .scenes()
            .iter()
            .map(|s| self.fuse_scene(s, &sar_predictions))
            .collect();

        let params = ExportParams::new(
            &request.target_collection,
            ExportRegion::CoarseBounds,
            NamingScheme::OpticalPipeline,
        );
        ExportScheduler::new(self.store, self.sleeper, params)
            .with_policy(self.params.retry.clone())
            .export_all(&fused)
    }
}
