//! File-backed asset store
//!
//! Each collection is a directory under the store root. An asset is an XML
//! sidecar `<name>.xml` plus one `<name>.<band>.u8` file per band (gzip when
//! enabled). Band payloads are row-major unsigned bytes with 255 as nodata.
//! The sidecar is written last, so a half-written asset is never listed, and
//! re-exporting an asset overwrites it.

use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use super::catalog::{open_maybe_gz, parse_time, write_maybe_gz, GridEntry, PropertyEntry};
use super::AssetStore;
use crate::algebra::{ImageCollection, LocalEvaluator, RasterAlgebra, Scene};
use crate::export::{Aggregation, ExportBackend, ExportJob, ExportRequest, JobStatus};
use crate::types::{Band, FusionError, FusionResult, Geometry, Grid, Plane, Raster, ValidityMask};

/// Byte reserved for nodata in stored bands
pub const NODATA_U8: u8 = 255;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "asset")]
struct AssetSidecar {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@description")]
    description: String,
    #[serde(rename = "@time")]
    time: String,
    #[serde(rename = "@crs")]
    crs: String,
    #[serde(rename = "@scale")]
    scale: f64,
    grid: GridEntry,
    region: RegionEntry,
    #[serde(rename = "band", default)]
    bands: Vec<AssetBandEntry>,
    #[serde(rename = "property", default)]
    properties: Vec<PropertyEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegionEntry {
    #[serde(rename = "@minX")]
    min_x: f64,
    #[serde(rename = "@minY")]
    min_y: f64,
    #[serde(rename = "@maxX")]
    max_x: f64,
    #[serde(rename = "@maxY")]
    max_y: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssetBandEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@file")]
    file: String,
    #[serde(rename = "@pyramiding")]
    pyramiding: String,
}

/// I/O failures while writing an asset are worth another attempt
fn transient_io(e: FusionError) -> FusionError {
    match e {
        FusionError::Io(io) => FusionError::transient(io.to_string()),
        other => other,
    }
}

/// Rows and columns whose pixel centres fall inside `region`'s bounds
fn crop_window(grid: &Grid, region: &Geometry) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let bounds = region.bounds();
    let rows: Vec<usize> = (0..grid.rows)
        .filter(|&i| {
            let (_, y) = grid.pixel_center(i, 0);
            y >= bounds.min_y && y <= bounds.max_y
        })
        .collect();
    let cols: Vec<usize> = (0..grid.cols)
        .filter(|&j| {
            let (x, _) = grid.pixel_center(0, j);
            x >= bounds.min_x && x <= bounds.max_x
        })
        .collect();
    match (rows.first(), rows.last(), cols.first(), cols.last()) {
        (Some(&r0), Some(&r1), Some(&c0), Some(&c1)) => Some((r0..r1 + 1, c0..c1 + 1)),
        _ => None,
    }
}

/// Block-aggregate a stored band by an integer factor
fn downsample(values: &Plane, valid: &ValidityMask, factor: usize, aggregation: Aggregation) -> (Plane, ValidityMask) {
    let (rows, cols) = values.dim();
    let out_shape = ((rows + factor - 1) / factor, (cols + factor - 1) / factor);
    let mut out = Plane::zeros(out_shape);
    let mut out_valid = ValidityMask::from_elem(out_shape, false);
    let mut block = Vec::with_capacity(factor * factor);
    for bi in 0..out_shape.0 {
        for bj in 0..out_shape.1 {
            block.clear();
            for i in bi * factor..((bi + 1) * factor).min(rows) {
                for j in bj * factor..((bj + 1) * factor).min(cols) {
                    if valid[[i, j]] {
                        block.push(values[[i, j]] as u8);
                    }
                }
            }
            if let Some(v) = aggregation.aggregate(&block) {
                out[[bi, bj]] = v as f32;
                out_valid[[bi, bj]] = true;
            }
        }
    }
    (out, out_valid)
}

#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    root: PathBuf,
    evaluator: LocalEvaluator,
    gzip: bool,
    #[cfg(feature = "gdal")]
    geotiff: bool,
}

impl LocalAssetStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            evaluator: LocalEvaluator::new(),
            gzip: false,
            #[cfg(feature = "gdal")]
            geotiff: false,
        }
    }

    /// Platform data directory, e.g. `~/.local/share/aquafuse`
    pub fn default_root() -> FusionResult<PathBuf> {
        dirs::data_local_dir()
            .map(|d| d.join("aquafuse"))
            .ok_or_else(|| FusionError::Configuration("no platform data directory; pass --asset-root".to_string()))
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    /// Also write a multi-band GeoTIFF next to each asset
    #[cfg(feature = "gdal")]
    pub fn with_geotiff(mut self, geotiff: bool) -> Self {
        self.geotiff = geotiff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a collection path onto a directory, refusing to leave the root
    fn collection_dir(&self, path: &str) -> FusionResult<PathBuf> {
        let relative = Path::new(path.trim_matches('/'));
        if path.trim_matches('/').is_empty()
            || relative.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(FusionError::Configuration(format!("invalid collection path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }

    fn asset_location(&self, asset_id: &str) -> FusionResult<(PathBuf, String)> {
        let (collection, name) = asset_id
            .trim_end_matches('/')
            .rsplit_once('/')
            .ok_or_else(|| FusionError::Configuration(format!("asset id '{}' has no collection", asset_id)))?;
        if name.is_empty() || name == "." || name == ".." {
            return Err(FusionError::Configuration(format!("invalid asset name in '{}'", asset_id)));
        }
        Ok((self.collection_dir(collection)?, name.to_string()))
    }

    fn band_file_name(&self, asset: &str, band: &str) -> String {
        let suffix = if self.gzip { ".u8.gz" } else { ".u8" };
        format!("{}.{}{}", asset, band, suffix)
    }

    fn write_asset(&self, request: &ExportRequest, dir: &Path, asset: &str) -> FusionResult<()> {
        let raster = self.evaluator.evaluate(&request.image)?;
        let grid = raster.grid();
        let (rows, cols) = crop_window(grid, &request.region).ok_or_else(|| {
            FusionError::fatal(format!("export region of {} does not overlap the image", request.asset_id))
        })?;
        let pixels = (rows.len() * cols.len()) as f64;
        if pixels > request.max_pixels {
            return Err(FusionError::TooManyPixels {
                requested: pixels as u64,
                limit: request.max_pixels as u64,
            });
        }
        let cropped = Grid::new(
            grid.origin_x + cols.start as f64 * grid.pixel_size,
            grid.origin_y - rows.start as f64 * grid.pixel_size,
            grid.pixel_size,
            rows.len(),
            cols.len(),
            &grid.crs,
        );
        log::debug!(
            "Writing {} ({}x{} px, bands {:?})",
            request.asset_id,
            cropped.rows,
            cropped.cols,
            raster.band_names()
        );

        let mut band_entries = Vec::new();
        #[cfg(feature = "gdal")]
        let mut payloads: Vec<(String, Vec<u8>)> = Vec::new();
        for band in raster.bands() {
            let bytes: Vec<u8> = rows
                .clone()
                .flat_map(|i| cols.clone().map(move |j| (i, j)))
                .map(|(i, j)| match band.value_at(i, j) {
                    Some(v) => (v as u8).min(NODATA_U8 - 1),
                    None => NODATA_U8,
                })
                .collect();
            let file = self.band_file_name(asset, &band.name);
            write_maybe_gz(&dir.join(&file), &bytes)?;
            band_entries.push(AssetBandEntry {
                name: band.name.clone(),
                file,
                pyramiding: request.pyramiding.get(&band.name).as_str().to_string(),
            });
            #[cfg(feature = "gdal")]
            payloads.push((band.name.clone(), bytes));
        }

        #[cfg(feature = "gdal")]
        if self.geotiff {
            write_geotiff(&dir.join(format!("{}.tif", asset)), &cropped, &payloads)?;
        }

        let bounds = request.region.bounds();
        let sidecar = AssetSidecar {
            id: request.asset_id.clone(),
            description: request.description.clone(),
            time: raster.time().to_rfc3339(),
            crs: request.crs.clone(),
            scale: request.scale,
            grid: GridEntry::from(&cropped),
            region: RegionEntry {
                min_x: bounds.min_x,
                min_y: bounds.min_y,
                max_x: bounds.max_x,
                max_y: bounds.max_y,
            },
            bands: band_entries,
            properties: raster
                .properties()
                .iter()
                .map(|(k, v)| PropertyEntry::new(k, v))
                .collect(),
        };
        let xml = quick_xml::se::to_string(&sidecar).map_err(|e| FusionError::Xml(e.to_string()))?;
        std::fs::write(dir.join(format!("{}.xml", asset)), xml)?;
        log::info!("Wrote asset {}", request.asset_id);
        Ok(())
    }

    /// Read a collection back, aggregating each band by `factor` with its pyramiding policy
    pub fn load_collection_downsampled(&self, path: &str, factor: usize) -> FusionResult<ImageCollection> {
        if factor == 0 {
            return Err(FusionError::Configuration("downsampling factor must be at least 1".to_string()));
        }
        let dir = self.collection_dir(path)?;
        if !dir.is_dir() {
            return Err(FusionError::fatal(format!("collection '{}' does not exist", path)));
        }
        let mut sidecars: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |e| e == "xml"))
            .collect();
        sidecars.sort();

        let mut scenes = Vec::with_capacity(sidecars.len());
        for sidecar in sidecars {
            scenes.push(Scene::from_raster(self.load_asset(&dir, &sidecar, factor)?));
        }
        log::info!("Loaded {} assets from collection {}", scenes.len(), path);
        Ok(ImageCollection::new(scenes))
    }

    fn load_asset(&self, dir: &Path, sidecar_path: &Path, factor: usize) -> FusionResult<Raster> {
        let text = std::fs::read_to_string(sidecar_path)?;
        let sidecar: AssetSidecar = from_str(&text)?;
        let name = sidecar_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| sidecar.id.clone());
        let stored = sidecar.grid.to_grid()?;
        let shape = stored.shape();
        let grid = Grid::new(
            stored.origin_x,
            stored.origin_y,
            stored.pixel_size * factor as f64,
            (stored.rows + factor - 1) / factor,
            (stored.cols + factor - 1) / factor,
            &stored.crs,
        );

        let mut raster = Raster::new(&name, grid, parse_time(&sidecar.time)?).with_footprint(Geometry::rectangle(
            sidecar.region.min_x,
            sidecar.region.min_y,
            sidecar.region.max_x,
            sidecar.region.max_y,
        ));
        for entry in &sidecar.bands {
            let mut bytes = Vec::new();
            open_maybe_gz(&dir.join(&entry.file))?.read_to_end(&mut bytes)?;
            if bytes.len() != shape.0 * shape.1 {
                return Err(FusionError::InvalidFormat(format!(
                    "{}: {} bytes for a {}x{} band",
                    entry.file,
                    bytes.len(),
                    shape.0,
                    shape.1
                )));
            }
            let values = Plane::from_shape_vec(shape, bytes.iter().map(|&b| b as f32).collect())
                .map_err(|e| FusionError::InvalidFormat(e.to_string()))?;
            let valid = ValidityMask::from_shape_vec(shape, bytes.iter().map(|&b| b != NODATA_U8).collect())
                .map_err(|e| FusionError::InvalidFormat(e.to_string()))?;
            let (values, valid) = if factor > 1 {
                downsample(&values, &valid, factor, Aggregation::parse(&entry.pyramiding)?)
            } else {
                (values, valid)
            };
            raster = raster.with_masked_band(Band {
                name: entry.name.clone(),
                values,
                valid,
            })?;
        }
        for property in &sidecar.properties {
            raster = raster.with_property(&property.key, property.to_value());
        }
        Ok(raster)
    }
}

impl ExportBackend for LocalAssetStore {
    fn submit(&self, request: &ExportRequest) -> FusionResult<Box<dyn ExportJob>> {
        let (dir, asset) = self.asset_location(&request.asset_id)?;
        if !dir.is_dir() {
            return Err(FusionError::fatal(format!(
                "target collection for {} does not exist",
                request.asset_id
            )));
        }
        log::debug!("Submitted {} ({})", request.asset_id, request.description);
        Ok(Box::new(LocalExportJob {
            store: self.clone(),
            request: request.clone(),
            dir,
            asset,
            status: JobStatus::Ready,
        }))
    }
}

impl AssetStore for LocalAssetStore {
    fn create_collection(&self, path: &str) -> FusionResult<()> {
        let dir = self.collection_dir(path)?;
        if dir.exists() {
            return Err(FusionError::AssetExists(path.to_string()));
        }
        std::fs::create_dir_all(&dir)?;
        log::info!("Created collection {}", path);
        Ok(())
    }

    fn load_collection(&self, path: &str) -> FusionResult<ImageCollection> {
        self.load_collection_downsampled(path, 1)
    }
}

/// Export job that writes synchronously when started
pub struct LocalExportJob {
    store: LocalAssetStore,
    request: ExportRequest,
    dir: PathBuf,
    asset: String,
    status: JobStatus,
}

impl ExportJob for LocalExportJob {
    fn start(&mut self) -> FusionResult<()> {
        if self.status != JobStatus::Ready {
            return Err(FusionError::fatal(format!("job {} was already started", self.request.asset_id)));
        }
        self.status = JobStatus::Running;
        match self.store.write_asset(&self.request, &self.dir, &self.asset) {
            Ok(()) => {
                self.status = JobStatus::Completed;
                Ok(())
            }
            Err(e) => {
                let e = transient_io(e);
                self.status = JobStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn status(&self) -> JobStatus {
        self.status.clone()
    }

    fn wait(&mut self) -> FusionResult<JobStatus> {
        Ok(self.status.clone())
    }
}

#[cfg(feature = "gdal")]
fn write_geotiff(path: &Path, grid: &Grid, bands: &[(String, Vec<u8>)]) -> FusionResult<()> {
    use gdal::DriverManager;

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<u8, _>(
        path,
        grid.cols as isize,
        grid.rows as isize,
        bands.len() as isize,
    )?;
    dataset.set_geo_transform(&grid.geo_transform())?;
    if let Some(code) = grid.crs.strip_prefix("EPSG:").and_then(|c| c.parse::<u32>().ok()) {
        dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(code)?)?;
    }
    for (k, (_, data)) in bands.iter().enumerate() {
        let mut rasterband = dataset.rasterband(k as isize + 1)?;
        let buffer = gdal::raster::Buffer::new((grid.cols, grid.rows), data.clone());
        rasterband.write((0, 0), (grid.cols, grid.rows), &buffer)?;
        rasterband.set_no_data_value(Some(NODATA_U8 as f64))?;
    }
    Ok(())
}
