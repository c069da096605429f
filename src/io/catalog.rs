//! File-backed scene catalogue
//!
//! A catalogue directory holds `catalog.xml` plus one raw band file per scene
//! band. Band files are little-endian `f32` in row-major order, optionally
//! gzip-compressed (`.gz` suffix); NaN marks nodata.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::SceneSource;
use crate::algebra::{Image, ImageCollection, Scene};
use crate::config::CLOUD_COVER_KEY;
use crate::export::Sensor;
use crate::types::{FusionError, FusionResult, Geometry, Grid, Plane, PropertyValue, Raster};

pub const MANIFEST_NAME: &str = "catalog.xml";

/// Band name given to recurrence layers
pub const RECURRENCE_BAND: &str = "monthly_recurrence";

/// Band name given to the elevation model
pub const ELEVATION_BAND: &str = "elevation";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "catalog")]
pub struct CatalogManifest {
    #[serde(rename = "scene", default)]
    pub scenes: Vec<SceneEntry>,
    #[serde(rename = "recurrence", default)]
    pub recurrence: Vec<RecurrenceEntry>,
    #[serde(rename = "elevation", default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<ElevationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneEntry {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@sensor")]
    pub sensor: String,
    #[serde(rename = "@time")]
    pub time: String,
    #[serde(rename = "@cloudCover", default, skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,
    pub grid: GridEntry,
    #[serde(rename = "band", default)]
    pub bands: Vec<BandEntry>,
    #[serde(rename = "property", default)]
    pub properties: Vec<PropertyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceEntry {
    #[serde(rename = "@month")]
    pub month: u32,
    #[serde(rename = "@file")]
    pub file: String,
    pub grid: GridEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevationEntry {
    #[serde(rename = "@file")]
    pub file: String,
    pub grid: GridEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridEntry {
    #[serde(rename = "@originX")]
    pub origin_x: f64,
    #[serde(rename = "@originY")]
    pub origin_y: f64,
    #[serde(rename = "@pixelSize")]
    pub pixel_size: f64,
    #[serde(rename = "@rows")]
    pub rows: usize,
    #[serde(rename = "@cols")]
    pub cols: usize,
    #[serde(rename = "@crs")]
    pub crs: String,
}

impl From<&Grid> for GridEntry {
    fn from(grid: &Grid) -> Self {
        Self {
            origin_x: grid.origin_x,
            origin_y: grid.origin_y,
            pixel_size: grid.pixel_size,
            rows: grid.rows,
            cols: grid.cols,
            crs: grid.crs.clone(),
        }
    }
}

impl GridEntry {
    pub fn to_grid(&self) -> FusionResult<Grid> {
        if !(self.pixel_size > 0.0) || self.rows == 0 || self.cols == 0 {
            return Err(FusionError::InvalidFormat(format!(
                "degenerate grid {}x{} with pixel size {}",
                self.rows, self.cols, self.pixel_size
            )));
        }
        Ok(Grid::new(self.origin_x, self.origin_y, self.pixel_size, self.rows, self.cols, &self.crs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@file")]
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyEntry {
    #[serde(rename = "@key")]
    pub key: String,
    #[serde(rename = "@value")]
    pub value: String,
}

impl PropertyEntry {
    pub fn new(key: &str, value: &PropertyValue) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Numeric when the text parses as a number
    pub fn to_value(&self) -> PropertyValue {
        match self.value.parse::<f64>() {
            Ok(v) => PropertyValue::Number(v),
            Err(_) => PropertyValue::Text(self.value.clone()),
        }
    }
}

pub(crate) fn parse_time(value: &str) -> FusionResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FusionError::InvalidFormat(format!("bad timestamp '{}': {}", value, e)))
}

pub(crate) fn open_maybe_gz(path: &Path) -> FusionResult<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

pub(crate) fn write_maybe_gz(path: &Path, bytes: &[u8]) -> FusionResult<()> {
    let file = BufWriter::new(File::create(path)?);
    if path.extension().map_or(false, |e| e == "gz") {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        file.write_all(bytes)?;
        file.flush()?;
    }
    Ok(())
}

/// Read a raw little-endian f32 plane
pub fn read_f32_plane(path: &Path, shape: (usize, usize)) -> FusionResult<Plane> {
    let mut bytes = Vec::new();
    open_maybe_gz(path)?.read_to_end(&mut bytes)?;
    let expected = shape.0 * shape.1 * 4;
    if bytes.len() != expected {
        return Err(FusionError::InvalidFormat(format!(
            "{}: {} bytes, expected {} for a {}x{} f32 plane",
            path.display(),
            bytes.len(),
            expected,
            shape.0,
            shape.1
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Plane::from_shape_vec(shape, values).map_err(|e| FusionError::InvalidFormat(e.to_string()))
}

/// Write a plane as raw little-endian f32; gzip when the path ends in `.gz`
pub fn write_f32_plane(path: &Path, plane: &Plane) -> FusionResult<()> {
    let bytes: Vec<u8> = plane.iter().flat_map(|v| v.to_le_bytes()).collect();
    write_maybe_gz(path, &bytes)
}

fn sensor_from_tag(tag: &str) -> FusionResult<Sensor> {
    match tag {
        "S1" => Ok(Sensor::Sentinel1),
        "LC08" => Ok(Sensor::Landsat8),
        other => Err(FusionError::InvalidFormat(format!("unknown sensor '{}' in catalogue", other))),
    }
}

fn file_stem_for(id: &str) -> String {
    id.rsplit('/')
        .next()
        .unwrap_or(id)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Scene catalogue rooted at a directory
pub struct LocalCatalog {
    root: PathBuf,
    manifest: CatalogManifest,
    gzip: bool,
}

impl LocalCatalog {
    /// Open an existing catalogue
    pub fn open<P: AsRef<Path>>(root: P) -> FusionResult<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest_path = root.join(MANIFEST_NAME);
        log::info!("Reading scene catalogue: {}", manifest_path.display());
        let text = std::fs::read_to_string(&manifest_path)?;
        let manifest: CatalogManifest = from_str(&text)?;
        log::debug!(
            "Catalogue lists {} scenes and {} recurrence layers",
            manifest.scenes.len(),
            manifest.recurrence.len()
        );
        Ok(Self {
            root,
            manifest,
            gzip: false,
        })
    }

    /// Start an empty catalogue; nothing is written until [`save`](Self::save)
    pub fn create<P: AsRef<Path>>(root: P) -> FusionResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            manifest: CatalogManifest::default(),
            gzip: false,
        })
    }

    /// Gzip band files written from now on
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.manifest.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.scenes.is_empty()
    }

    fn band_file_name(&self, stem: &str, band: &str) -> String {
        let suffix = if self.gzip { ".f32.gz" } else { ".f32" };
        format!("{}.{}{}", stem, band, suffix)
    }

    /// Write the raster's bands and list it in the manifest
    pub fn add_scene(&mut self, raster: &Raster, sensor: Sensor) -> FusionResult<()> {
        let stem = file_stem_for(raster.id());
        let mut bands = Vec::with_capacity(raster.bands().len());
        for band in raster.bands() {
            let file = self.band_file_name(&stem, &band.name);
            let plane = ndarray::Zip::from(&band.values)
                .and(&band.valid)
                .map_collect(|&v, &ok| if ok { v } else { f32::NAN });
            write_f32_plane(&self.root.join(&file), &plane)?;
            bands.push(BandEntry {
                name: band.name.clone(),
                file,
            });
        }
        let cloud_cover = raster.property(CLOUD_COVER_KEY).and_then(|v| v.as_number());
        let properties = raster
            .properties()
            .iter()
            .filter(|(k, _)| k.as_str() != CLOUD_COVER_KEY)
            .map(|(k, v)| PropertyEntry::new(k, v))
            .collect();
        self.manifest.scenes.push(SceneEntry {
            id: raster.id().to_string(),
            sensor: sensor.tag().to_string(),
            time: raster.time().to_rfc3339(),
            cloud_cover,
            grid: GridEntry::from(raster.grid()),
            bands,
            properties,
        });
        Ok(())
    }

    /// Register the recurrence layer for a calendar month (first band of `raster`)
    pub fn add_recurrence(&mut self, month: u32, raster: &Raster) -> FusionResult<()> {
        let band = raster
            .bands()
            .first()
            .ok_or_else(|| FusionError::Configuration("recurrence raster has no bands".to_string()))?;
        let file = self.band_file_name(&format!("recurrence_{:02}", month), RECURRENCE_BAND);
        write_f32_plane(&self.root.join(&file), &band.values)?;
        self.manifest.recurrence.retain(|r| r.month != month);
        self.manifest.recurrence.push(RecurrenceEntry {
            month,
            file,
            grid: GridEntry::from(raster.grid()),
        });
        Ok(())
    }

    /// Store the elevation model (first band of `raster`), replacing any previous one
    pub fn set_elevation(&mut self, raster: &Raster) -> FusionResult<()> {
        let band = raster
            .bands()
            .first()
            .ok_or_else(|| FusionError::Configuration("elevation raster has no bands".to_string()))?;
        let file = self.band_file_name("dem", ELEVATION_BAND);
        let plane = ndarray::Zip::from(&band.values)
            .and(&band.valid)
            .map_collect(|&v, &ok| if ok { v } else { f32::NAN });
        write_f32_plane(&self.root.join(&file), &plane)?;
        self.manifest.elevation = Some(ElevationEntry {
            file,
            grid: GridEntry::from(raster.grid()),
        });
        Ok(())
    }

    pub fn save(&self) -> FusionResult<()> {
        let xml = quick_xml::se::to_string(&self.manifest).map_err(|e| FusionError::Xml(e.to_string()))?;
        std::fs::write(self.root.join(MANIFEST_NAME), xml)?;
        Ok(())
    }

    fn load_scene(&self, entry: &SceneEntry) -> FusionResult<Raster> {
        let grid = entry.grid.to_grid()?;
        let shape = grid.shape();
        let mut raster = Raster::new(&entry.id, grid, parse_time(&entry.time)?);
        for band in &entry.bands {
            let plane = read_f32_plane(&self.root.join(&band.file), shape)?;
            raster = raster.with_band(&band.name, plane)?;
        }
        for property in &entry.properties {
            raster = raster.with_property(&property.key, property.to_value());
        }
        if let Some(cover) = entry.cloud_cover {
            raster = raster.with_property(CLOUD_COVER_KEY, PropertyValue::Number(cover));
        }
        Ok(raster)
    }
}

impl SceneSource for LocalCatalog {
    fn scenes(
        &self,
        sensor: Sensor,
        region: &Geometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FusionResult<ImageCollection> {
        let mut scenes = Vec::new();
        for entry in &self.manifest.scenes {
            if sensor_from_tag(&entry.sensor)? != sensor {
                continue;
            }
            let time = parse_time(&entry.time)?;
            if time < start || time >= end {
                continue;
            }
            let footprint = Geometry::Rectangle(entry.grid.to_grid()?.bounds());
            if !footprint.intersects(region) {
                continue;
            }
            log::debug!("Loading scene {}", entry.id);
            scenes.push(Scene::from_raster(self.load_scene(entry)?));
        }
        log::info!("Catalogue: {} {} scenes between {} and {}", scenes.len(), sensor, start, end);
        Ok(ImageCollection::new(scenes).sort_by_time(true))
    }

    fn monthly_recurrence(&self, month: u32) -> FusionResult<Option<Image>> {
        let Some(entry) = self.manifest.recurrence.iter().find(|r| r.month == month) else {
            return Ok(None);
        };
        let grid = entry.grid.to_grid()?;
        let plane = read_f32_plane(&self.root.join(&entry.file), grid.shape())?;
        let raster = Raster::new(&format!("recurrence_{:02}", month), grid, DateTime::<Utc>::default())
            .with_band(RECURRENCE_BAND, plane)?;
        Ok(Some(Image::source(raster)))
    }

    fn elevation(&self) -> FusionResult<Option<Image>> {
        let Some(entry) = &self.manifest.elevation else {
            return Ok(None);
        };
        let grid = entry.grid.to_grid()?;
        let plane = read_f32_plane(&self.root.join(&entry.file), grid.shape())?;
        let raster = Raster::new(ELEVATION_BAND, grid, DateTime::<Utc>::default()).with_band(ELEVATION_BAND, plane)?;
        Ok(Some(Image::source(raster)))
    }
}
