//! Raster algebra: lazy expression graph, collections and the local evaluator

pub mod collection;
pub mod expr;
pub mod kernels;
pub mod local;

pub use collection::{ImageCollection, Scene};
pub use expr::{BandSelector, EdgeOtsuSpec, FocalStat, Image, Number, Reducer, SlopeCorrectionSpec};
pub use local::LocalEvaluator;

use crate::types::{FusionResult, Raster};

/// Executes expression graphs
///
/// Implementations may run in-process (see [`LocalEvaluator`]) or forward the
/// graph to a remote engine; the core never evaluates on its own.
pub trait RasterAlgebra {
    /// Materialize an image graph into a raster
    fn evaluate(&self, image: &Image) -> FusionResult<Raster>;

    /// Resolve a deferred scalar; `None` means the reducer produced null
    fn evaluate_number(&self, number: &Number) -> FusionResult<Option<f64>>;
}
