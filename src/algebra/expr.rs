//! Immutable raster expression graph
//!
//! Builders only describe work. Nothing is computed until a
//! [`RasterAlgebra`](super::RasterAlgebra) evaluator is handed the root node,
//! so shared sub-expressions stay shared and the evaluator decides how and
//! where to run them.

use std::sync::Arc;

use crate::types::{Geometry, Raster};

/// Lazy image handle
#[derive(Debug, Clone)]
pub struct Image(Arc<ImageExpr>);

/// Lazy scalar handle; may evaluate to null
#[derive(Debug, Clone)]
pub struct Number(Arc<NumberExpr>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandSelector {
    Index(usize),
    Name(String),
    /// Every band whose name starts with the prefix, in band order
    Prefix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Gt,
    Lt,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Reciprocal,
}

/// Reducer applied across bands or across collection members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Max,
    FirstNonNull,
}

impl Reducer {
    pub fn band_name(&self) -> &'static str {
        match self {
            Reducer::Sum => "sum",
            Reducer::Max => "max",
            Reducer::FirstNonNull => "first",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocalStat {
    Mean,
    StdDev,
}

/// Inputs of the edge-restricted Otsu primitive
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeOtsuSpec {
    /// Seed separating the initial binary partition
    pub initial_threshold: f32,
    /// Sampling scale of the histogram (meters)
    pub scale: f64,
    /// Threshold used when the histogram is degenerate
    pub thresh_no_data: f32,
    /// Distance around the partition boundary that feeds the histogram (meters)
    pub edge_buffer: f64,
    /// Histogram sampling region
    pub region: Geometry,
    /// Water is above the threshold when set, below it otherwise
    pub invert: bool,
    pub max_pixels: u64,
}

/// Inputs of the volumetric slope-correction primitive
#[derive(Debug, Clone, PartialEq)]
pub struct SlopeCorrectionSpec {
    /// Band holding the ellipsoid incidence angle (degrees)
    pub angle_band: String,
    /// Distance around layover/shadow pixels that is masked as well (meters)
    pub buffer: f64,
    /// Cap of the distance search around layover/shadow pixels (pixels)
    pub distance_neighborhood: usize,
}

#[derive(Debug)]
pub enum ImageExpr {
    Source(Arc<Raster>),
    Constant { value: Number, name: String },
    Select { input: Image, selectors: Vec<BandSelector> },
    Rename { input: Image, names: Vec<String> },
    Suffix { input: Image, suffix: String },
    AddBands { input: Image, other: Image, overwrite: bool },
    Cat(Vec<Image>),
    Binary { op: BinaryOp, lhs: Image, rhs: Image },
    Unary { op: UnaryOp, input: Image },
    ReduceBands { reducer: Reducer, input: Image },
    UpdateMask { input: Image, mask: Image },
    Mask(Image),
    Unmask { input: Image, fallback: Image },
    Clip { input: Image, geometry: Geometry },
    Focal { input: Image, stat: FocalStat, radius: f64 },
    EdgeOtsu { input: Image, spec: EdgeOtsuSpec },
    SlopeCorrection { input: Image, elevation: Image, spec: SlopeCorrectionSpec },
    Canny { input: Image, low: f32, high: f32, sigma: f32 },
    DistanceTransform { input: Image, neighborhood: usize },
    CastU8(Image),
    SetProperty { input: Image, key: String, value: Number },
    Composite { images: Vec<Image>, reducer: Reducer },
}

#[derive(Debug)]
pub enum NumberExpr {
    Constant(f64),
    Null,
    /// Percentile of the first band over a region
    Percentile {
        image: Image,
        percentile: f64,
        region: Geometry,
        scale: f64,
        max_pixels: u64,
    },
    /// Maximum of the non-null members; null when all are null
    Max(Vec<Number>),
}

impl Image {
    fn wrap(expr: ImageExpr) -> Self {
        Image(Arc::new(expr))
    }

    pub fn expr(&self) -> &ImageExpr {
        &self.0
    }

    /// Stable identity of this node for memoisation
    pub fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn source(raster: Raster) -> Self {
        Self::wrap(ImageExpr::Source(Arc::new(raster)))
    }

    pub fn from_shared(raster: Arc<Raster>) -> Self {
        Self::wrap(ImageExpr::Source(raster))
    }

    pub fn constant(value: f64) -> Self {
        Self::constant_of(Number::constant(value))
    }

    /// Single-band constant image whose value is a deferred scalar
    pub fn constant_of(value: Number) -> Self {
        Self::wrap(ImageExpr::Constant {
            value,
            name: "constant".to_string(),
        })
    }

    /// Multi-band constant image, one band per value
    pub fn constants(values: &[f64]) -> Self {
        Self::cat(&values.iter().map(|&v| Image::constant(v)).collect::<Vec<_>>())
    }

    pub fn cat(images: &[Image]) -> Self {
        Self::wrap(ImageExpr::Cat(images.to_vec()))
    }

    /// Per-pixel reduction over an ordered list of images
    pub fn composite(images: &[Image], reducer: Reducer) -> Self {
        Self::wrap(ImageExpr::Composite {
            images: images.to_vec(),
            reducer,
        })
    }

    pub fn select(&self, names: &[&str]) -> Self {
        let selectors = names.iter().map(|n| BandSelector::Name(n.to_string())).collect();
        self.select_by(selectors)
    }

    pub fn select_index(&self, index: usize) -> Self {
        self.select_by(vec![BandSelector::Index(index)])
    }

    pub fn select_prefix(&self, prefix: &str) -> Self {
        self.select_by(vec![BandSelector::Prefix(prefix.to_string())])
    }

    pub fn select_by(&self, selectors: Vec<BandSelector>) -> Self {
        Self::wrap(ImageExpr::Select {
            input: self.clone(),
            selectors,
        })
    }

    /// Image with no bands that keeps this image's metadata
    pub fn select_none(&self) -> Self {
        self.select_by(Vec::new())
    }

    pub fn rename(&self, name: &str) -> Self {
        self.rename_all(&[name])
    }

    pub fn rename_all(&self, names: &[&str]) -> Self {
        Self::wrap(ImageExpr::Rename {
            input: self.clone(),
            names: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    pub fn suffix(&self, suffix: &str) -> Self {
        Self::wrap(ImageExpr::Suffix {
            input: self.clone(),
            suffix: suffix.to_string(),
        })
    }

    pub fn add_bands(&self, other: &Image, overwrite: bool) -> Self {
        Self::wrap(ImageExpr::AddBands {
            input: self.clone(),
            other: other.clone(),
            overwrite,
        })
    }

    fn binary(&self, op: BinaryOp, rhs: &Image) -> Self {
        Self::wrap(ImageExpr::Binary {
            op,
            lhs: self.clone(),
            rhs: rhs.clone(),
        })
    }

    pub fn add(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn subtract(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Subtract, rhs)
    }

    pub fn multiply(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Multiply, rhs)
    }

    pub fn divide(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Divide, rhs)
    }

    pub fn gt(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Gt, rhs)
    }

    pub fn lt(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn and(&self, rhs: &Image) -> Self {
        self.binary(BinaryOp::And, rhs)
    }

    fn unary(&self, op: UnaryOp) -> Self {
        Self::wrap(ImageExpr::Unary {
            op,
            input: self.clone(),
        })
    }

    pub fn neg(&self) -> Self {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Self {
        self.unary(UnaryOp::Exp)
    }

    pub fn reciprocal(&self) -> Self {
        self.unary(UnaryOp::Reciprocal)
    }

    pub fn reduce_bands(&self, reducer: Reducer) -> Self {
        Self::wrap(ImageExpr::ReduceBands {
            reducer,
            input: self.clone(),
        })
    }

    /// Invalidate pixels where `mask` is zero or itself invalid
    pub fn update_mask(&self, mask: &Image) -> Self {
        Self::wrap(ImageExpr::UpdateMask {
            input: self.clone(),
            mask: mask.clone(),
        })
    }

    /// Validity of each band as 0/1, valid everywhere
    pub fn mask(&self) -> Self {
        Self::wrap(ImageExpr::Mask(self.clone()))
    }

    /// Replace invalid pixels with `fallback`; valid pixels are never touched
    pub fn unmask(&self, fallback: &Image) -> Self {
        Self::wrap(ImageExpr::Unmask {
            input: self.clone(),
            fallback: fallback.clone(),
        })
    }

    pub fn unmask_value(&self, value: f64) -> Self {
        self.unmask(&Image::constant(value))
    }

    pub fn clip(&self, geometry: &Geometry) -> Self {
        Self::wrap(ImageExpr::Clip {
            input: self.clone(),
            geometry: geometry.clone(),
        })
    }

    /// Square-kernel neighbourhood statistic; `radius` in pixels
    pub fn focal(&self, stat: FocalStat, radius: f64) -> Self {
        Self::wrap(ImageExpr::Focal {
            input: self.clone(),
            stat,
            radius,
        })
    }

    pub fn focal_mean(&self, radius: f64) -> Self {
        self.focal(FocalStat::Mean, radius)
    }

    pub fn edge_otsu(&self, spec: EdgeOtsuSpec) -> Self {
        Self::wrap(ImageExpr::EdgeOtsu {
            input: self.clone(),
            spec,
        })
    }

    /// Terrain-flattened backscatter (dB) plus the untouched angle band, last
    pub fn slope_correction(&self, elevation: &Image, spec: SlopeCorrectionSpec) -> Self {
        Self::wrap(ImageExpr::SlopeCorrection {
            input: self.clone(),
            elevation: elevation.clone(),
            spec,
        })
    }

    pub fn canny(&self, low: f32, high: f32, sigma: f32) -> Self {
        Self::wrap(ImageExpr::Canny {
            input: self.clone(),
            low,
            high,
            sigma,
        })
    }

    /// Squared pixel distance to the nearest non-zero pixel, capped at `neighborhood²`
    pub fn fast_distance_transform(&self, neighborhood: usize) -> Self {
        Self::wrap(ImageExpr::DistanceTransform {
            input: self.clone(),
            neighborhood,
        })
    }

    /// Truncate to unsigned 8-bit, saturating at 0 and 255
    pub fn cast_u8(&self) -> Self {
        Self::wrap(ImageExpr::CastU8(self.clone()))
    }

    pub fn set(&self, key: &str, value: Number) -> Self {
        Self::wrap(ImageExpr::SetProperty {
            input: self.clone(),
            key: key.to_string(),
            value,
        })
    }
}

impl Number {
    fn wrap(expr: NumberExpr) -> Self {
        Number(Arc::new(expr))
    }

    pub fn expr(&self) -> &NumberExpr {
        &self.0
    }

    pub fn constant(value: f64) -> Self {
        Self::wrap(NumberExpr::Constant(value))
    }

    pub fn null() -> Self {
        Self::wrap(NumberExpr::Null)
    }

    pub fn count(n: usize) -> Self {
        Self::constant(n as f64)
    }

    pub fn percentile(image: &Image, percentile: f64, region: &Geometry, scale: f64, max_pixels: u64) -> Self {
        Self::wrap(NumberExpr::Percentile {
            image: image.clone(),
            percentile,
            region: region.clone(),
            scale,
            max_pixels,
        })
    }

    pub fn max_of(values: &[Number]) -> Self {
        Self::wrap(NumberExpr::Max(values.to_vec()))
    }
}
