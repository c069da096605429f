//! In-process evaluator for the expression graph
//!
//! Planes are held as ndarray grids with a boolean validity mask. Constants
//! stay scalar until they meet a gridded operand. Operands on different grids
//! are brought onto the left-hand grid by nearest-neighbour resampling.

use chrono::{DateTime, Utc};
use ndarray::{Array2, Zip};
use std::collections::{BTreeMap, HashMap};

use super::expr::{
    BandSelector, BinaryOp, EdgeOtsuSpec, FocalStat, Image, ImageExpr, Number, NumberExpr, Reducer, SlopeCorrectionSpec,
    UnaryOp,
};
use super::kernels;
use super::RasterAlgebra;
use crate::types::{Band, FusionError, FusionResult, Geometry, Grid, Plane, PropertyValue, Raster, ValidityMask};

/// Buckets of the Otsu histogram
const HISTOGRAM_BUCKETS: usize = 255;

#[cfg(feature = "parallel")]
macro_rules! zip_for_each {
    ($zip:expr, $f:expr) => {
        $zip.par_for_each($f)
    };
}

#[cfg(not(feature = "parallel"))]
macro_rules! zip_for_each {
    ($zip:expr, $f:expr) => {
        $zip.for_each($f)
    };
}

#[derive(Debug, Clone)]
enum Samples {
    Uniform { value: f32, valid: bool },
    Pixels { values: Plane, valid: ValidityMask },
}

impl Samples {
    fn shape(&self) -> Option<(usize, usize)> {
        match self {
            Samples::Uniform { .. } => None,
            Samples::Pixels { values, .. } => Some(values.dim()),
        }
    }

    fn materialize(&self, shape: (usize, usize)) -> (Plane, ValidityMask) {
        match self {
            Samples::Uniform { value, valid } => (Plane::from_elem(shape, *value), ValidityMask::from_elem(shape, *valid)),
            Samples::Pixels { values, valid } => (values.clone(), valid.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    name: String,
    samples: Samples,
}

#[derive(Debug, Clone)]
struct SceneMeta {
    id: String,
    footprint: Option<Geometry>,
    time: DateTime<Utc>,
    properties: BTreeMap<String, PropertyValue>,
}

impl Default for SceneMeta {
    fn default() -> Self {
        Self {
            id: String::new(),
            footprint: None,
            time: DateTime::<Utc>::default(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Evaluated {
    grid: Option<Grid>,
    layers: Vec<Layer>,
    meta: Option<SceneMeta>,
}

impl Evaluated {
    fn aligned_to(mut self, target: Option<&Grid>) -> Self {
        let Some(target) = target else {
            return self;
        };
        let from = match self.grid.clone() {
            Some(current) if &current != target => current,
            _ => return self,
        };
        for layer in &mut self.layers {
            if let Samples::Pixels { values, valid } = &layer.samples {
                let (values, valid) = kernels::resample_nearest(values, valid, &from, target);
                layer.samples = Samples::Pixels { values, valid };
            }
        }
        self.grid = Some(target.clone());
        self
    }

    fn band_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn into_raster(self) -> FusionResult<Raster> {
        let grid = self.grid.ok_or_else(|| {
            FusionError::Processing("image has no pixel grid (constant-only expression) and cannot be materialized".to_string())
        })?;
        let meta = self.meta.unwrap_or_default();
        let footprint = meta.footprint.unwrap_or_else(|| Geometry::Rectangle(grid.bounds()));
        let shape = grid.shape();
        let mut raster = Raster::new(&meta.id, grid, meta.time)
            .with_footprint(footprint)
            .with_properties(meta.properties);
        for layer in self.layers {
            let (values, valid) = match layer.samples {
                Samples::Pixels { values, valid } => (values, valid),
                uniform => uniform.materialize(shape),
            };
            raster = raster.with_masked_band(Band {
                name: layer.name,
                values,
                valid,
            })?;
        }
        Ok(raster)
    }
}

fn apply_binary(op: BinaryOp, x: f32, y: f32) -> (f32, bool) {
    match op {
        BinaryOp::Add => (x + y, true),
        BinaryOp::Subtract => (x - y, true),
        BinaryOp::Multiply => (x * y, true),
        BinaryOp::Divide => {
            let r = x / y;
            (r, r.is_finite())
        }
        BinaryOp::Gt => ((x > y) as u8 as f32, true),
        BinaryOp::Lt => ((x < y) as u8 as f32, true),
        BinaryOp::And => ((x != 0.0 && y != 0.0) as u8 as f32, true),
    }
}

fn apply_unary(op: UnaryOp, x: f32) -> f32 {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Reciprocal => 1.0 / x,
    }
}

/// Combine two sample sets pixel-wise
///
/// `value` maps (a, a_valid, b, b_valid) to the output value and validity.
fn combine<F>(a: &Samples, b: &Samples, f: F) -> Samples
where
    F: Fn(f32, bool, f32, bool) -> (f32, bool) + Sync + Send,
{
    if let (Samples::Uniform { value: x, valid: xv }, Samples::Uniform { value: y, valid: yv }) = (a, b) {
        let (value, valid) = f(*x, *xv, *y, *yv);
        return Samples::Uniform { value, valid };
    }
    let shape = a.shape().or_else(|| b.shape()).unwrap_or((0, 0));
    let (av, avalid) = a.materialize(shape);
    let (bv, bvalid) = b.materialize(shape);
    let mut values = Plane::zeros(shape);
    let mut valid = ValidityMask::from_elem(shape, false);
    zip_for_each!(
        Zip::from(&mut values).and(&mut valid).and(&av).and(&avalid).and(&bv).and(&bvalid),
        |o, ov, &x, &xv, &y, &yv| {
            let (r, ok) = f(x, xv, y, yv);
            *o = r;
            *ov = ok;
        }
    );
    Samples::Pixels { values, valid }
}

fn map_samples<F>(samples: &Samples, f: F) -> Samples
where
    F: Fn(f32, bool) -> (f32, bool) + Sync + Send,
{
    combine(samples, &Samples::Uniform { value: 0.0, valid: true }, |x, xv, _, _| f(x, xv))
}

/// Pair bands of two images: equal counts zip, a single band broadcasts
fn pair_layers<'a>(lhs: &'a [Layer], rhs: &'a [Layer]) -> FusionResult<Vec<(String, &'a Samples, &'a Samples)>> {
    let (n, m) = (lhs.len(), rhs.len());
    if n == m {
        Ok(lhs.iter().zip(rhs).map(|(a, b)| (a.name.clone(), &a.samples, &b.samples)).collect())
    } else if m == 1 {
        Ok(lhs.iter().map(|a| (a.name.clone(), &a.samples, &rhs[0].samples)).collect())
    } else if n == 1 {
        Ok(rhs.iter().map(|b| (b.name.clone(), &lhs[0].samples, &b.samples)).collect())
    } else {
        Err(FusionError::Configuration(format!(
            "band count mismatch: {} vs {} bands",
            n, m
        )))
    }
}

/// Per-pixel reduction across layers, ignoring invalid inputs
fn reduce_samples(inputs: &[&Samples], reducer: Reducer) -> FusionResult<Samples> {
    if inputs.is_empty() {
        return Err(FusionError::Configuration("cannot reduce an image with no bands".to_string()));
    }
    let fold = move |acc: f32, acc_valid: bool, x: f32, x_valid: bool| -> (f32, bool) {
        if !x_valid {
            return (acc, acc_valid);
        }
        if !acc_valid {
            return (x, true);
        }
        match reducer {
            Reducer::Sum => (acc + x, true),
            Reducer::Max => (acc.max(x), true),
            Reducer::FirstNonNull => (acc, true),
        }
    };
    let mut acc = Samples::Uniform { value: 0.0, valid: false };
    for input in inputs {
        acc = combine(&acc, input, fold);
    }
    Ok(acc)
}

fn region_mask(grid: &Grid, region: &Geometry) -> Array2<bool> {
    Array2::from_shape_fn(grid.shape(), |(i, j)| {
        let (x, y) = grid.pixel_center(i, j);
        region.contains(x, y)
    })
}

/// Pixel stride that approximates sampling `grid` at `scale` meters
fn sample_stride(scale: f64, grid: &Grid) -> usize {
    (scale / grid.scale_m()).round().max(1.0) as usize
}

#[cfg(feature = "parallel")]
fn map_layers<F>(layers: Vec<Layer>, f: F) -> FusionResult<Vec<Layer>>
where
    F: Fn(Layer) -> FusionResult<Layer> + Sync + Send,
{
    use rayon::prelude::*;
    layers.into_par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn map_layers<F>(layers: Vec<Layer>, f: F) -> FusionResult<Vec<Layer>>
where
    F: Fn(Layer) -> FusionResult<Layer> + Sync + Send,
{
    layers.into_iter().map(f).collect()
}

/// Evaluates expression graphs in memory
#[derive(Debug, Clone, Default)]
pub struct LocalEvaluator;

impl LocalEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl RasterAlgebra for LocalEvaluator {
    fn evaluate(&self, image: &Image) -> FusionResult<Raster> {
        let mut session = Session::default();
        session.image(image)?.into_raster()
    }

    fn evaluate_number(&self, number: &Number) -> FusionResult<Option<f64>> {
        let mut session = Session::default();
        session.number(number)
    }
}

/// One evaluation pass; shared nodes are computed once
#[derive(Default)]
struct Session {
    cache: HashMap<usize, Evaluated>,
}

impl Session {
    fn image(&mut self, image: &Image) -> FusionResult<Evaluated> {
        let key = image.node_id();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let result = self.compute(image.expr())?;
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    fn compute(&mut self, expr: &ImageExpr) -> FusionResult<Evaluated> {
        match expr {
            ImageExpr::Source(raster) => Ok(Evaluated {
                grid: Some(raster.grid().clone()),
                layers: raster
                    .bands()
                    .iter()
                    .map(|b| Layer {
                        name: b.name.clone(),
                        samples: Samples::Pixels {
                            values: b.values.clone(),
                            valid: b.valid.clone(),
                        },
                    })
                    .collect(),
                meta: Some(SceneMeta {
                    id: raster.id().to_string(),
                    footprint: Some(raster.footprint().clone()),
                    time: raster.time(),
                    properties: raster.properties().clone(),
                }),
            }),
            ImageExpr::Constant { value, name } => {
                let v = self.number(value)?;
                Ok(Evaluated {
                    grid: None,
                    layers: vec![Layer {
                        name: name.clone(),
                        samples: Samples::Uniform {
                            value: v.unwrap_or(0.0) as f32,
                            valid: v.is_some(),
                        },
                    }],
                    meta: None,
                })
            }
            ImageExpr::Select { input, selectors } => {
                let ev = self.image(input)?;
                let layers = select_layers(&ev.layers, selectors)?;
                Ok(Evaluated { layers, ..ev })
            }
            ImageExpr::Rename { input, names } => {
                let mut ev = self.image(input)?;
                if names.len() != ev.layers.len() {
                    return Err(FusionError::Configuration(format!(
                        "cannot rename {} bands {:?} to {:?}",
                        ev.layers.len(),
                        ev.band_names(),
                        names
                    )));
                }
                for (layer, name) in ev.layers.iter_mut().zip(names) {
                    layer.name = name.clone();
                }
                Ok(ev)
            }
            ImageExpr::Suffix { input, suffix } => {
                let mut ev = self.image(input)?;
                for layer in &mut ev.layers {
                    layer.name.push_str(suffix);
                }
                Ok(ev)
            }
            ImageExpr::AddBands { input, other, overwrite } => {
                let base = self.image(input)?;
                let grid = base.grid.clone();
                let extra = self.image(other)?;
                let grid = grid.or_else(|| extra.grid.clone());
                let mut base = base.aligned_to(grid.as_ref());
                let extra = extra.aligned_to(grid.as_ref());
                for layer in extra.layers {
                    match base.layers.iter_mut().find(|l| l.name == layer.name) {
                        Some(existing) if *overwrite => *existing = layer,
                        Some(_) => {
                            return Err(FusionError::Configuration(format!(
                                "band '{}' already exists; add it with overwrite",
                                layer.name
                            )))
                        }
                        None => base.layers.push(layer),
                    }
                }
                base.grid = grid;
                base.meta = base.meta.or(extra.meta);
                Ok(base)
            }
            ImageExpr::Cat(images) => {
                let parts = images.iter().map(|i| self.image(i)).collect::<FusionResult<Vec<_>>>()?;
                let grid = parts.iter().find_map(|p| p.grid.clone());
                let mut out = Evaluated {
                    grid: grid.clone(),
                    layers: Vec::new(),
                    meta: None,
                };
                for part in parts {
                    let part = part.aligned_to(grid.as_ref());
                    out.meta = out.meta.or(part.meta);
                    for mut layer in part.layers {
                        let base = layer.name.clone();
                        let mut n = 0;
                        while out.layers.iter().any(|l| l.name == layer.name) {
                            n += 1;
                            layer.name = format!("{}_{}", base, n);
                        }
                        out.layers.push(layer);
                    }
                }
                Ok(out)
            }
            ImageExpr::Binary { op, lhs, rhs } => {
                let a = self.image(lhs)?;
                let b = self.image(rhs)?;
                let grid = a.grid.clone().or_else(|| b.grid.clone());
                let a = a.aligned_to(grid.as_ref());
                let b = b.aligned_to(grid.as_ref());
                let op = *op;
                let layers = pair_layers(&a.layers, &b.layers)?
                    .into_iter()
                    .map(|(name, x, y)| Layer {
                        name,
                        samples: combine(x, y, move |x, xv, y, yv| {
                            let (r, ok) = apply_binary(op, x, y);
                            (r, xv && yv && ok)
                        }),
                    })
                    .collect();
                Ok(Evaluated {
                    grid,
                    layers,
                    meta: a.meta.or(b.meta),
                })
            }
            ImageExpr::Unary { op, input } => {
                let mut ev = self.image(input)?;
                let op = *op;
                for layer in &mut ev.layers {
                    layer.samples = map_samples(&layer.samples, move |x, v| (apply_unary(op, x), v));
                }
                Ok(ev)
            }
            ImageExpr::ReduceBands { reducer, input } => {
                let ev = self.image(input)?;
                let inputs: Vec<&Samples> = ev.layers.iter().map(|l| &l.samples).collect();
                let samples = reduce_samples(&inputs, *reducer)?;
                Ok(Evaluated {
                    layers: vec![Layer {
                        name: reducer.band_name().to_string(),
                        samples,
                    }],
                    ..ev
                })
            }
            ImageExpr::UpdateMask { input, mask } => {
                let a = self.image(input)?;
                let m = self.image(mask)?;
                let grid = a.grid.clone().or_else(|| m.grid.clone());
                let a = a.aligned_to(grid.as_ref());
                let m = m.aligned_to(grid.as_ref());
                let mut layers = Vec::with_capacity(a.layers.len());
                for layer in &a.layers {
                    let mask_layer = match m.layers.len() {
                        1 => &m.layers[0],
                        n if n == a.layers.len() => &m.layers[layers.len()],
                        n => {
                            return Err(FusionError::Configuration(format!(
                                "mask has {} bands, image has {}",
                                n,
                                a.layers.len()
                            )))
                        }
                    };
                    layers.push(Layer {
                        name: layer.name.clone(),
                        samples: combine(&layer.samples, &mask_layer.samples, |x, xv, mv, mvalid| {
                            (x, xv && mvalid && mv != 0.0)
                        }),
                    });
                }
                Ok(Evaluated {
                    grid,
                    layers,
                    meta: a.meta,
                })
            }
            ImageExpr::Mask(input) => {
                let mut ev = self.image(input)?;
                for layer in &mut ev.layers {
                    layer.samples = map_samples(&layer.samples, |_, v| (if v { 1.0 } else { 0.0 }, true));
                }
                Ok(ev)
            }
            ImageExpr::Unmask { input, fallback } => {
                let a = self.image(input)?;
                let f = self.image(fallback)?;
                let grid = a.grid.clone().or_else(|| f.grid.clone());
                let a = a.aligned_to(grid.as_ref());
                let f = f.aligned_to(grid.as_ref());
                if f.layers.len() != 1 && f.layers.len() != a.layers.len() {
                    return Err(FusionError::Configuration(format!(
                        "unmask fallback has {} bands, image has {}",
                        f.layers.len(),
                        a.layers.len()
                    )));
                }
                let layers = a
                    .layers
                    .iter()
                    .enumerate()
                    .map(|(k, layer)| {
                        let fb = if f.layers.len() == 1 { &f.layers[0] } else { &f.layers[k] };
                        Layer {
                            name: layer.name.clone(),
                            samples: combine(&layer.samples, &fb.samples, |x, xv, y, yv| {
                                if xv {
                                    (x, true)
                                } else {
                                    (y, yv)
                                }
                            }),
                        }
                    })
                    .collect();
                Ok(Evaluated {
                    grid,
                    layers,
                    meta: a.meta,
                })
            }
            ImageExpr::Clip { input, geometry } => {
                let mut ev = self.image(input)?;
                if let Some(grid) = &ev.grid {
                    let inside = region_mask(grid, geometry);
                    let shape = grid.shape();
                    for layer in &mut ev.layers {
                        let (values, mut valid) = layer.samples.materialize(shape);
                        Zip::from(&mut valid).and(&inside).for_each(|v, &i| *v = *v && i);
                        layer.samples = Samples::Pixels { values, valid };
                    }
                }
                if let Some(meta) = ev.meta.as_mut() {
                    meta.footprint = Some(geometry.clone());
                }
                Ok(ev)
            }
            ImageExpr::Focal { input, stat, radius } => {
                let ev = self.image(input)?;
                let radius = radius.floor().max(0.0) as usize;
                let std_dev = *stat == FocalStat::StdDev;
                let layers = map_layers(ev.layers, move |layer| {
                    let samples = match layer.samples {
                        Samples::Uniform { value, valid } => Samples::Uniform {
                            value: if std_dev { 0.0 } else { value },
                            valid,
                        },
                        Samples::Pixels { values, valid } => {
                            let (values, valid) = kernels::focal_statistic(&values, &valid, radius, std_dev);
                            Samples::Pixels { values, valid }
                        }
                    };
                    Ok(Layer { samples, ..layer })
                })?;
                Ok(Evaluated { layers, ..ev })
            }
            ImageExpr::EdgeOtsu { input, spec } => {
                let ev = self.image(input)?;
                edge_otsu(ev, spec)
            }
            ImageExpr::SlopeCorrection { input, elevation, spec } => {
                let ev = self.image(input)?;
                let dem = self.image(elevation)?;
                slope_correction(ev, dem, spec)
            }
            ImageExpr::Canny { input, low, high, sigma } => {
                let ev = self.image(input)?;
                let (low, high, sigma) = (*low, *high, *sigma);
                let layers = map_layers(ev.layers, move |layer| {
                    let samples = match layer.samples {
                        Samples::Uniform { valid, .. } => Samples::Uniform { value: 0.0, valid },
                        Samples::Pixels { values, valid } => Samples::Pixels {
                            values: kernels::canny(&values, &valid, low, high, sigma),
                            valid,
                        },
                    };
                    Ok(Layer { samples, ..layer })
                })?;
                Ok(Evaluated { layers, ..ev })
            }
            ImageExpr::DistanceTransform { input, neighborhood } => {
                let ev = self.image(input)?;
                let cap = (*neighborhood * *neighborhood) as f32;
                let layers = map_layers(ev.layers, move |layer| {
                    let samples = match layer.samples {
                        Samples::Uniform { value, valid } => Samples::Uniform {
                            value: if valid && value != 0.0 { 0.0 } else { cap },
                            valid: true,
                        },
                        Samples::Pixels { values, valid } => {
                            let features = Zip::from(&values).and(&valid).map_collect(|&v, &ok| ok && v != 0.0);
                            let distance = kernels::squared_distance_transform(&features, cap);
                            let shape = distance.dim();
                            Samples::Pixels {
                                values: distance,
                                valid: ValidityMask::from_elem(shape, true),
                            }
                        }
                    };
                    Ok(Layer { samples, ..layer })
                })?;
                Ok(Evaluated { layers, ..ev })
            }
            ImageExpr::CastU8(input) => {
                let mut ev = self.image(input)?;
                for layer in &mut ev.layers {
                    // `as u8` truncates toward zero and saturates; NaN maps to 0
                    layer.samples = map_samples(&layer.samples, |x, v| (if v { x as u8 as f32 } else { 0.0 }, v));
                }
                Ok(ev)
            }
            ImageExpr::SetProperty { input, key, value } => {
                let mut ev = self.image(input)?;
                let v = self.number(value)?;
                let meta = ev.meta.get_or_insert_with(SceneMeta::default);
                match v {
                    Some(v) => {
                        meta.properties.insert(key.clone(), PropertyValue::Number(v));
                    }
                    None => {
                        meta.properties.remove(key);
                    }
                }
                Ok(ev)
            }
            ImageExpr::Composite { images, reducer } => {
                let parts = images.iter().map(|i| self.image(i)).collect::<FusionResult<Vec<_>>>()?;
                let Some(first) = parts.first() else {
                    return Ok(Evaluated {
                        grid: None,
                        layers: Vec::new(),
                        meta: None,
                    });
                };
                let names = first.band_names();
                let grid = parts.iter().find_map(|p| p.grid.clone());
                let parts: Vec<Evaluated> = parts.into_iter().map(|p| p.aligned_to(grid.as_ref())).collect();
                if let Some(bad) = parts.iter().find(|p| p.layers.len() != names.len()) {
                    return Err(FusionError::Configuration(format!(
                        "collection members disagree on band count: {:?} vs {:?}",
                        names,
                        bad.band_names()
                    )));
                }
                let mut layers = Vec::with_capacity(names.len());
                for (k, name) in names.into_iter().enumerate() {
                    let inputs: Vec<&Samples> = parts.iter().map(|p| &p.layers[k].samples).collect();
                    layers.push(Layer {
                        name,
                        samples: reduce_samples(&inputs, *reducer)?,
                    });
                }
                Ok(Evaluated {
                    grid,
                    layers,
                    meta: None,
                })
            }
        }
    }

    fn number(&mut self, number: &Number) -> FusionResult<Option<f64>> {
        match number.expr() {
            NumberExpr::Constant(v) => Ok(Some(*v)),
            NumberExpr::Null => Ok(None),
            NumberExpr::Max(values) => {
                let mut best: Option<f64> = None;
                for value in values {
                    if let Some(v) = self.number(value)? {
                        best = Some(best.map_or(v, |b| b.max(v)));
                    }
                }
                Ok(best)
            }
            NumberExpr::Percentile {
                image,
                percentile,
                region,
                scale,
                max_pixels,
            } => {
                let ev = self.image(image)?;
                let Some(layer) = ev.layers.first() else {
                    return Ok(None);
                };
                match (&ev.grid, &layer.samples) {
                    (_, Samples::Uniform { value, valid }) => Ok(valid.then_some(*value as f64)),
                    (Some(grid), Samples::Pixels { values, valid }) => {
                        let stride = sample_stride(*scale, grid);
                        let inside = region_mask(grid, region);
                        let requested = inside
                            .indexed_iter()
                            .filter(|&((i, j), &ok)| ok && i % stride == 0 && j % stride == 0)
                            .count() as u64;
                        if requested > *max_pixels {
                            return Err(FusionError::TooManyPixels {
                                requested,
                                limit: *max_pixels,
                            });
                        }
                        let mut samples: Vec<f64> = values
                            .indexed_iter()
                            .filter(|((i, j), _)| i % stride == 0 && j % stride == 0 && inside[[*i, *j]] && valid[[*i, *j]])
                            .map(|(_, &v)| v as f64)
                            .collect();
                        log::debug!(
                            "percentile {} over {} of {} sampled pixels (stride {})",
                            percentile,
                            samples.len(),
                            requested,
                            stride
                        );
                        Ok(kernels::percentile(&mut samples, *percentile))
                    }
                    (None, Samples::Pixels { .. }) => Err(FusionError::Processing(
                        "pixel plane without a grid".to_string(),
                    )),
                }
            }
        }
    }
}

fn select_layers(layers: &[Layer], selectors: &[BandSelector]) -> FusionResult<Vec<Layer>> {
    let available = || layers.iter().map(|l| l.name.as_str()).collect::<Vec<_>>().join(", ");
    let mut out = Vec::new();
    for selector in selectors {
        match selector {
            BandSelector::Index(i) => {
                let layer = layers.get(*i).ok_or_else(|| {
                    FusionError::Configuration(format!("band index {} out of range (bands: {})", i, available()))
                })?;
                out.push(layer.clone());
            }
            BandSelector::Name(name) => {
                let layer = layers.iter().find(|l| &l.name == name).ok_or_else(|| {
                    FusionError::Configuration(format!("band '{}' not found (bands: {})", name, available()))
                })?;
                out.push(layer.clone());
            }
            BandSelector::Prefix(prefix) => {
                let before = out.len();
                out.extend(layers.iter().filter(|l| l.name.starts_with(prefix.as_str())).cloned());
                if out.len() == before {
                    return Err(FusionError::Configuration(format!(
                        "no band starts with '{}' (bands: {})",
                        prefix,
                        available()
                    )));
                }
            }
        }
    }
    Ok(out)
}

/// Edge-restricted Otsu: histogram only pixels near the seed partition boundary
fn edge_otsu(ev: Evaluated, spec: &EdgeOtsuSpec) -> FusionResult<Evaluated> {
    if ev.layers.len() != 1 {
        return Err(FusionError::Configuration(format!(
            "edge Otsu needs a single-band image, got bands {:?}",
            ev.band_names()
        )));
    }
    let compare = move |v: f32, t: f32| -> f32 {
        let water = if spec.invert { v > t } else { v < t };
        water as u8 as f32
    };
    let grid = match ev.grid.clone() {
        Some(grid) => grid,
        None => {
            let samples = match &ev.layers[0].samples {
                Samples::Uniform { value, valid } => Samples::Uniform {
                    value: compare(*value, spec.thresh_no_data),
                    valid: *valid,
                },
                Samples::Pixels { .. } => {
                    return Err(FusionError::Processing("pixel plane without a grid".to_string()));
                }
            };
            return Ok(Evaluated {
                layers: vec![Layer {
                    name: "water".to_string(),
                    samples,
                }],
                ..ev
            });
        }
    };
    let layer = &ev.layers[0];

    let (values, valid) = layer.samples.materialize(grid.shape());
    let inside = region_mask(&grid, &spec.region);
    let usable = Zip::from(&valid).and(&inside).map_collect(|&v, &i| v && i);

    let water = if !usable.iter().any(|&u| u) {
        log::debug!("edge Otsu: no valid pixels in region, output fully masked");
        Samples::Pixels {
            values: Plane::zeros(grid.shape()),
            valid: ValidityMask::from_elem(grid.shape(), false),
        }
    } else {
        let binary = values.mapv(|v| v > spec.initial_threshold);
        let edges = kernels::class_boundary(&binary, &usable);
        let buffer_px = (spec.edge_buffer / grid.scale_m()).round().max(1.0) as usize;
        let near_edge = kernels::dilate(&edges, buffer_px);
        let stride = sample_stride(spec.scale, &grid);

        let mut samples = Vec::new();
        for ((i, j), &v) in values.indexed_iter() {
            if i % stride == 0 && j % stride == 0 && near_edge[[i, j]] && usable[[i, j]] {
                samples.push(v);
            }
        }
        if samples.len() as u64 > spec.max_pixels {
            return Err(FusionError::TooManyPixels {
                requested: samples.len() as u64,
                limit: spec.max_pixels,
            });
        }
        let threshold = kernels::otsu_threshold(&samples, HISTOGRAM_BUCKETS).unwrap_or_else(|| {
            log::debug!("edge Otsu: degenerate histogram, using no-data threshold {}", spec.thresh_no_data);
            spec.thresh_no_data
        });
        log::debug!(
            "edge Otsu threshold {:.4} from {} edge samples (buffer {} px, stride {})",
            threshold,
            samples.len(),
            buffer_px,
            stride
        );
        let out = values.mapv(|v| compare(v, threshold));
        Samples::Pixels { values: out, valid }
    };

    Ok(Evaluated {
        grid: Some(grid),
        layers: vec![Layer {
            name: "water".to_string(),
            samples: water,
        }],
        meta: ev.meta,
    })
}

/// Volumetric slope correction of every backscatter band
///
/// The satellite heading is the circular mean aspect of the incidence-angle surface.
/// Missing elevation reads as sea level. Pixels in layover or shadow, and
/// pixels within `spec.buffer` meters of them, are masked.
fn slope_correction(ev: Evaluated, dem: Evaluated, spec: &SlopeCorrectionSpec) -> FusionResult<Evaluated> {
    let grid = ev
        .grid
        .clone()
        .ok_or_else(|| FusionError::Processing("slope correction needs a gridded image".to_string()))?;
    let shape = grid.shape();
    let (angle, angle_valid) = match ev.layers.iter().find(|l| l.name == spec.angle_band) {
        Some(layer) => layer.samples.materialize(shape),
        None => {
            return Err(FusionError::Configuration(format!(
                "slope correction needs an '{}' band (bands: {:?})",
                spec.angle_band,
                ev.band_names()
            )))
        }
    };

    let dem = dem.aligned_to(Some(&grid));
    let dem_layer = dem
        .layers
        .first()
        .ok_or_else(|| FusionError::Configuration("elevation image has no bands".to_string()))?;
    let (elevation, elevation_valid) = dem_layer.samples.materialize(shape);
    let elevation = Zip::from(&elevation)
        .and(&elevation_valid)
        .map_collect(|&z, &ok| if ok { z } else { 0.0 });

    let spacing = grid.scale_m();
    let (slope, aspect) = kernels::slope_aspect(&elevation, spacing);

    // Heading from the incidence-angle gradient; gaps take the mean angle
    let valid_angles: Vec<f32> = angle
        .iter()
        .zip(angle_valid.iter())
        .filter(|&(_, &ok)| ok)
        .map(|(&a, _)| a)
        .collect();
    let heading = if valid_angles.is_empty() {
        None
    } else {
        let fill = valid_angles.iter().sum::<f32>() / valid_angles.len() as f32;
        let filled = Zip::from(&angle).and(&angle_valid).map_collect(|&a, &ok| if ok { a } else { fill });
        let (_, angle_aspect) = kernels::slope_aspect(&filled, spacing);
        kernels::circular_mean(&angle_aspect, &angle_valid)
    };
    log::debug!(
        "slope correction: heading {:?} deg, buffer {} m, spacing {:.1} m",
        heading.map(f32::to_degrees),
        spec.buffer,
        spacing
    );

    let theta = angle.mapv(f32::to_radians);
    let mut alpha_r = Plane::zeros(shape);
    let mut hidden = Array2::from_elem(shape, true);
    if let Some(heading) = heading {
        Zip::indexed(&mut alpha_r).and(&mut hidden).for_each(|(i, j), a, h| {
            if angle_valid[[i, j]] {
                *a = kernels::range_slope(slope[[i, j]], aspect[[i, j]], heading);
                *h = !kernels::is_visible(*a, theta[[i, j]]);
            }
        });
    }
    let cap = (spec.distance_neighborhood * spec.distance_neighborhood) as f32;
    let distance = kernels::squared_distance_transform(&hidden, cap);
    let keep = distance.mapv(|d2| d2.sqrt() as f64 * spacing > spec.buffer);
    log::debug!(
        "slope correction: {} of {} pixels masked for layover/shadow",
        keep.iter().filter(|&&k| !k).count(),
        keep.len()
    );

    let angle_band = spec.angle_band.clone();
    let layers = map_layers(ev.layers, |layer| {
        if layer.name == angle_band {
            return Ok(layer);
        }
        let (values, valid) = layer.samples.materialize(shape);
        let mut out = Plane::zeros(shape);
        let mut out_valid = ValidityMask::from_elem(shape, false);
        Zip::indexed(&mut out).and(&mut out_valid).for_each(|(i, j), o, ov| {
            if valid[[i, j]] && angle_valid[[i, j]] && keep[[i, j]] {
                let v = kernels::volumetric_flatten_db(values[[i, j]], theta[[i, j]], alpha_r[[i, j]]);
                if v.is_finite() {
                    *o = v;
                    *ov = true;
                }
            }
        });
        Ok(Layer {
            name: layer.name,
            samples: Samples::Pixels {
                values: out,
                valid: out_valid,
            },
        })
    })?;
    let (mut layers, angle_layers): (Vec<Layer>, Vec<Layer>) =
        layers.into_iter().partition(|l| l.name != spec.angle_band);
    layers.extend(angle_layers);

    Ok(Evaluated {
        grid: Some(grid),
        layers,
        meta: ev.meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn grid(rows: usize, cols: usize) -> Grid {
        Grid::new(0.0, rows as f64 * 30.0, 30.0, rows, cols, "EPSG:32615")
    }

    fn raster_from(name: &str, values: Vec<f32>, rows: usize, cols: usize) -> Raster {
        let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        Raster::new("test", grid(rows, cols), time)
            .with_band(name, Plane::from_shape_vec((rows, cols), values).unwrap())
            .unwrap()
    }

    #[test]
    fn test_constant_broadcast_and_names() {
        let img = Image::source(raster_from("b", vec![1.0, 2.0, 3.0, 4.0], 2, 2));
        let out = LocalEvaluator::new()
            .evaluate(&img.multiply(&Image::constant(10.0)).add(&Image::constant(1.0)))
            .unwrap();
        let band = out.band("b").unwrap();
        assert_eq!(band.values.as_slice().unwrap(), &[11.0, 21.0, 31.0, 41.0]);
    }

    #[test]
    fn test_invalid_pixels_propagate_through_arithmetic() {
        let img = Image::source(raster_from("b", vec![1.0, f32::NAN, 3.0, 4.0], 2, 2));
        let out = LocalEvaluator::new().evaluate(&img.add(&Image::constant(1.0))).unwrap();
        let band = out.band("b").unwrap();
        assert!(!band.valid[[0, 1]]);
        assert!(band.valid[[0, 0]]);
    }

    #[test]
    fn test_unmask_keeps_valid_pixels() {
        let img = Image::source(raster_from("b", vec![1.0, f32::NAN, 3.0, f32::NAN], 2, 2));
        let out = LocalEvaluator::new().evaluate(&img.unmask_value(9.0)).unwrap();
        let band = out.band("b").unwrap();
        assert_eq!(band.values.as_slice().unwrap(), &[1.0, 9.0, 3.0, 9.0]);
        assert!(band.valid.iter().all(|&v| v));
    }

    #[test]
    fn test_missing_band_is_configuration_error() {
        let img = Image::source(raster_from("b", vec![1.0; 4], 2, 2));
        let err = LocalEvaluator::new().evaluate(&img.select(&["nir"])).unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
    }

    #[test]
    fn test_empty_composite_then_max_with_epsilon() {
        let composite = Image::composite(&[], Reducer::FirstNonNull);
        let stabilized = composite.add_bands(&Image::constant(1e-3), false).reduce_bands(Reducer::Max);
        let mask = Image::source(raster_from("m", vec![1.0; 4], 2, 2));
        let region = Geometry::rectangle(0.0, 0.0, 60.0, 60.0);
        let p = Number::percentile(&stabilized.update_mask(&mask), 50.0, &region, 30.0, 1000);
        let v = LocalEvaluator::new().evaluate_number(&p).unwrap().unwrap();
        assert!((v - 1e-3).abs() < 1e-6);
    }

    #[test]
    fn test_first_non_null_prefers_earlier_members() {
        let newer = Image::source(raster_from("proba", vec![f32::NAN, 20.0, 30.0, f32::NAN], 2, 2));
        let older = Image::source(raster_from("proba", vec![1.0, 2.0, 3.0, f32::NAN], 2, 2));
        let out = LocalEvaluator::new()
            .evaluate(&Image::composite(&[newer, older], Reducer::FirstNonNull))
            .unwrap();
        let band = out.band("proba").unwrap();
        assert_eq!(band.value_at(0, 0), Some(1.0));
        assert_eq!(band.value_at(0, 1), Some(20.0));
        assert_eq!(band.value_at(1, 0), Some(30.0));
        assert_eq!(band.value_at(1, 1), None);
    }

    #[test]
    fn test_percentile_pixel_cap() {
        let img = Image::source(raster_from("p", vec![1.0; 16], 4, 4));
        let region = Geometry::rectangle(0.0, 0.0, 120.0, 120.0);
        let p = Number::percentile(&img, 50.0, &region, 30.0, 4);
        let err = LocalEvaluator::new().evaluate_number(&p).unwrap_err();
        assert!(matches!(err, FusionError::TooManyPixels { requested: 16, limit: 4 }));
    }

    #[test]
    fn test_resampling_onto_lhs_grid() {
        // 2x2 grid at 60 m covering the same area as a 4x4 grid at 30 m
        let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        let coarse = Raster::new("c", Grid::new(0.0, 120.0, 60.0, 2, 2, "EPSG:32615"), time)
            .with_band("v", Plane::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        let fine = raster_from("v", vec![0.0; 16], 4, 4);
        let out = LocalEvaluator::new()
            .evaluate(&Image::source(fine).add(&Image::source(coarse)))
            .unwrap();
        let band = out.band("v").unwrap();
        assert_eq!(band.values[[0, 0]], 1.0);
        assert_eq!(band.values[[0, 3]], 2.0);
        assert_eq!(band.values[[3, 0]], 3.0);
        assert_eq!(band.values[[3, 3]], 4.0);
    }

    #[test]
    fn test_cat_deduplicates_names() {
        let img = Image::source(raster_from("sum", vec![1.0; 4], 2, 2));
        let out = LocalEvaluator::new().evaluate(&Image::cat(&[img.neg(), img])).unwrap();
        assert_eq!(out.band_names(), vec!["sum".to_string(), "sum_1".to_string()]);
    }
}
