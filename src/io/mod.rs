//! Scene ingestion and asset storage

pub mod asset_store;
pub mod catalog;

pub use asset_store::LocalAssetStore;
pub use catalog::LocalCatalog;

use chrono::{DateTime, Utc};

use crate::algebra::{Image, ImageCollection};
use crate::export::{ExportBackend, Sensor};
use crate::types::{FusionResult, Geometry};

/// Source of raw per-sensor scenes
pub trait SceneSource {
    /// Scenes of `sensor` intersecting `region` with `start <= time < end`, oldest first
    fn scenes(
        &self,
        sensor: Sensor,
        region: &Geometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FusionResult<ImageCollection>;

    /// Monthly water recurrence layer (1..=12), when available
    fn monthly_recurrence(&self, _month: u32) -> FusionResult<Option<Image>> {
        Ok(None)
    }

    /// Elevation model used for terrain correction, when available
    fn elevation(&self) -> FusionResult<Option<Image>> {
        Ok(None)
    }
}

/// Asset collections that exports land in and can be read back from
pub trait AssetStore: ExportBackend {
    /// Fails with `AssetExists` when the collection is already there
    fn create_collection(&self, path: &str) -> FusionResult<()>;

    fn load_collection(&self, path: &str) -> FusionResult<ImageCollection>;
}
