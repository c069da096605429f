//! Core water fusion modules

pub mod classifier;
pub mod edge_threshold;
pub mod features;
pub mod gap_fill;
pub mod slope_correction;

// Re-export main types
pub use classifier::{CoefficientVector, LogisticWaterClassifier, ModelKind, WaterModel};
pub use edge_threshold::{AdaptiveEdgeThreshold, EdgeOtsuParams};
pub use gap_fill::{FillDecision, GapFillParams, GapFillPlan, TemporalGapFiller};
pub use slope_correction::{SlopeCorrection, SlopeCorrectionParams};
