//! Entry-point pipelines: SAR prediction export and optical fusion export

pub mod optical;
pub mod sar;

pub use optical::{OpticalPipeline, OpticalPipelineParams};
pub use sar::{SarPipeline, SarPipelineParams};

use chrono::{DateTime, NaiveDate, Utc};

use crate::types::{FusionError, FusionResult, Geometry};

/// Region, half-open date range and destination of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub region: Geometry,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub target_collection: String,
}

impl PipelineRequest {
    pub fn new(bbox: &[f64], start: NaiveDate, end: NaiveDate, target_collection: &str) -> FusionResult<Self> {
        let region = Geometry::from_bbox(bbox)?;
        if start >= end {
            return Err(FusionError::Configuration(format!(
                "start date {} must be before end date {}",
                start, end
            )));
        }
        if target_collection.trim_matches('/').is_empty() {
            return Err(FusionError::Configuration("target collection is empty".to_string()));
        }
        Ok(Self {
            region,
            start: start.and_time(chrono::NaiveTime::MIN).and_utc(),
            end: end.and_time(chrono::NaiveTime::MIN).and_utc(),
            target_collection: target_collection.to_string(),
        })
    }
}
