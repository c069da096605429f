use std::collections::BTreeMap;
use std::fmt;

use crate::algebra::{Image, Scene};
use crate::config::{EXPORT_CRS, EXPORT_MAX_PIXELS, FINE_SCALE_M};
use crate::export::naming::{NamingScheme, SceneName};
use crate::export::retry::{RetryPolicy, Sleeper};
use crate::types::{FusionError, FusionResult, Geometry};

/// Probability to percent, then every band to unsigned 8-bit
pub fn rescale(image: &Image) -> Image {
    let percent = image.select(&["proba"]).multiply(&Image::constant(100.0));
    image.add_bands(&percent, true).cast_u8()
}

/// Downsampling rule for one band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Mode,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Mode => "mode",
        }
    }

    pub fn parse(value: &str) -> FusionResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "mode" => Ok(Aggregation::Mode),
            other => Err(FusionError::InvalidFormat(format!("unknown pyramiding policy '{}'", other))),
        }
    }

    /// Aggregate valid u8 samples; the mean is rounded, mode ties go to the smaller value
    pub fn aggregate(&self, values: &[u8]) -> Option<u8> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregation::Mean => {
                let sum: u64 = values.iter().map(|&v| v as u64).sum();
                Some((sum as f64 / values.len() as f64).round() as u8)
            }
            Aggregation::Mode => {
                let mut counts = [0usize; 256];
                for &v in values {
                    counts[v as usize] += 1;
                }
                let mut best = 0;
                for v in 1..256 {
                    if counts[v] > counts[best] {
                        best = v;
                    }
                }
                Some(best as u8)
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-band downsampling rules; unlisted bands use the mean
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidingPolicy {
    rules: BTreeMap<String, Aggregation>,
}

impl PyramidingPolicy {
    pub fn new() -> Self {
        Self { rules: BTreeMap::new() }
    }

    pub fn with_rule(mut self, band: &str, aggregation: Aggregation) -> Self {
        self.rules.insert(band.to_string(), aggregation);
        self
    }

    pub fn get(&self, band: &str) -> Aggregation {
        self.rules.get(band).copied().unwrap_or(Aggregation::Mean)
    }

    pub fn rules(&self) -> &BTreeMap<String, Aggregation> {
        &self.rules
    }
}

impl Default for PyramidingPolicy {
    fn default() -> Self {
        Self::new()
            .with_rule("proba", Aggregation::Mean)
            .with_rule("water", Aggregation::Mode)
    }
}

/// Which geometry bounds an export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRegion {
    /// The scene footprint as is
    Footprint,
    /// Rectangle bounding the footprint
    CoarseBounds,
}

#[derive(Debug, Clone)]
pub struct ExportParams {
    pub target_collection: String,
    pub scale: f64,
    pub crs: String,
    pub max_pixels: f64,
    pub pyramiding: PyramidingPolicy,
    pub region: ExportRegion,
    pub naming: NamingScheme,
}

impl ExportParams {
    pub fn new(target_collection: &str, region: ExportRegion, naming: NamingScheme) -> Self {
        Self {
            target_collection: target_collection.to_string(),
            scale: FINE_SCALE_M,
            crs: EXPORT_CRS.to_string(),
            max_pixels: EXPORT_MAX_PIXELS,
            pyramiding: PyramidingPolicy::default(),
            region,
            naming,
        }
    }
}

/// Everything an export backend needs for one asset
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub image: Image,
    pub description: String,
    pub asset_id: String,
    pub region: Geometry,
    pub scale: f64,
    pub crs: String,
    pub max_pixels: f64,
    pub pyramiding: PyramidingPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Ready,
    Running,
    Completed,
    Failed(String),
}

pub trait ExportJob {
    /// Trigger the job; called once per successful submission
    fn start(&mut self) -> FusionResult<()>;

    fn status(&self) -> JobStatus;

    /// Block until the job leaves the running state
    fn wait(&mut self) -> FusionResult<JobStatus>;
}

pub trait ExportBackend {
    fn submit(&self, request: &ExportRequest) -> FusionResult<Box<dyn ExportJob>>;
}

/// Outcome of one batch
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Asset ids whose job was started
    pub submitted: Vec<String>,
    /// Asset ids that exhausted their retries, with the last error
    pub failed: Vec<(String, String)>,
}

/// Sequential, retried export of finished scenes
pub struct ExportScheduler<'a> {
    backend: &'a dyn ExportBackend,
    sleeper: &'a dyn Sleeper,
    params: ExportParams,
    policy: RetryPolicy,
}

impl<'a> ExportScheduler<'a> {
    pub fn new(backend: &'a dyn ExportBackend, sleeper: &'a dyn Sleeper, params: ExportParams) -> Self {
        Self {
            backend,
            sleeper,
            params,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn params(&self) -> &ExportParams {
        &self.params
    }

    /// Build the request for one scene (image is rescaled here)
    pub fn request(&self, scene: &Scene, name: &SceneName) -> ExportRequest {
        let region = match self.params.region {
            ExportRegion::Footprint => scene.footprint.clone(),
            ExportRegion::CoarseBounds => scene.footprint.bounding_rectangle(),
        };
        ExportRequest {
            image: rescale(&scene.image),
            description: name.description(),
            asset_id: name.asset_id(&self.params.target_collection),
            region,
            scale: self.params.scale,
            crs: self.params.crs.clone(),
            max_pixels: self.params.max_pixels,
            pyramiding: self.params.pyramiding.clone(),
        }
    }

    /// Export scenes in order
    ///
    /// Identifiers are all validated before the first submission. A scene
    /// whose transient failures exhaust the retry budget is recorded and the
    /// batch moves on; any other error, cancellation included, aborts.
    /// Cancellation is also checked before each scene is submitted.
    pub fn export_all(&self, scenes: &[Scene]) -> FusionResult<ExportReport> {
        let names = scenes
            .iter()
            .map(|s| SceneName::parse(&s.id, self.params.naming))
            .collect::<FusionResult<Vec<_>>>()?;

        let mut report = ExportReport::default();
        for (i, (scene, name)) in scenes.iter().zip(&names).enumerate() {
            if let Err(e) = self.sleeper.check_cancelled() {
                log::warn!("Export batch stopped before scene {}/{}", i + 1, scenes.len());
                return Err(e);
            }
            let request = self.request(scene, name);
            log::info!("Exporting {}/{}: {} -> {}", i + 1, scenes.len(), request.description, request.asset_id);

            let outcome = self.policy.run(self.sleeper, |attempt| {
                log::debug!("Submitting {} (attempt {})", request.asset_id, attempt);
                let mut job = self.backend.submit(&request)?;
                job.start()?;
                Ok(job)
            });

            match outcome {
                Ok(_) => report.submitted.push(request.asset_id),
                Err(e) if e.is_transient() => {
                    log::error!("Export of {} failed after retries: {}", request.asset_id, e);
                    report.failed.push((request.asset_id, e.to_string()));
                }
                Err(e) => {
                    log::error!("Export of {} aborted: {}", request.asset_id, e);
                    return Err(e);
                }
            }
        }
        log::info!(
            "Export batch done: {} started, {} failed",
            report.submitted.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
