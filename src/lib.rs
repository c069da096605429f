//! aquafuse: multi-sensor surface-water fusion
//!
//! Scores optical (Landsat 8) and SAR (Sentinel-1) scenes into per-pixel
//! water probability with fixed logistic models, thresholds probability into
//! water masks with an edge-restricted Otsu method, and fills cloud gaps in
//! the optical masks from recent SAR predictions. All raster work is built as
//! a lazy expression graph and run by a [`algebra::RasterAlgebra`] evaluator.

pub mod algebra;
pub mod cli;
pub mod config;
pub mod core;
pub mod export;
pub mod io;
pub mod pipeline;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use algebra::{Image, ImageCollection, LocalEvaluator, Number, RasterAlgebra, Scene};
pub use crate::core::{AdaptiveEdgeThreshold, FillDecision, LogisticWaterClassifier, TemporalGapFiller, WaterModel};
pub use export::{ExportScheduler, RetryPolicy, SceneName};
pub use types::{Band, FusionError, FusionResult, Geometry, Grid, PropertyValue, Raster};
