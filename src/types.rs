use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::METERS_PER_DEGREE;

/// Real-valued pixel plane (rows x cols)
pub type Plane = Array2<f32>;

/// Per-pixel validity (true = valid data, false = nodata)
pub type ValidityMask = Array2<bool>;

/// Axis-aligned bounding box in map units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Planar region used to bound exports and scope region reducers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Rectangle(BoundingBox),
    /// Closed ring of (x, y) vertices; the closing vertex may be omitted
    Polygon(Vec<[f64; 2]>),
}

impl Geometry {
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Geometry::Rectangle(BoundingBox::new(min_x, min_y, max_x, max_y))
    }

    /// Build a rectangle from `[min_lon, min_lat, max_lon, max_lat]`
    pub fn from_bbox(coords: &[f64]) -> FusionResult<Self> {
        if coords.len() != 4 {
            return Err(FusionError::Configuration(format!(
                "bounding box needs 4 values (min_lon min_lat max_lon max_lat), got {}",
                coords.len()
            )));
        }
        let (min_x, min_y, max_x, max_y) = (coords[0], coords[1], coords[2], coords[3]);
        if !coords.iter().all(|c| c.is_finite()) || min_x >= max_x || min_y >= max_y {
            return Err(FusionError::Configuration(format!(
                "invalid bounding box {:?}: minimums must be below maximums",
                coords
            )));
        }
        Ok(Geometry::rectangle(min_x, min_y, max_x, max_y))
    }

    pub fn bounds(&self) -> BoundingBox {
        match self {
            Geometry::Rectangle(bbox) => *bbox,
            Geometry::Polygon(ring) => {
                let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
                for [x, y] in ring {
                    bbox.min_x = bbox.min_x.min(*x);
                    bbox.min_y = bbox.min_y.min(*y);
                    bbox.max_x = bbox.max_x.max(*x);
                    bbox.max_y = bbox.max_y.max(*y);
                }
                bbox
            }
        }
    }

    /// Rectangle covering this geometry
    pub fn bounding_rectangle(&self) -> Geometry {
        Geometry::Rectangle(self.bounds())
    }

    /// Bounding-box intersection test, conservative for polygons
    pub fn intersects(&self, other: &Geometry) -> bool {
        self.bounds().intersects(&other.bounds())
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self {
            Geometry::Rectangle(bbox) => bbox.contains(x, y),
            Geometry::Polygon(ring) => {
                if ring.len() < 3 || !self.bounds().contains(x, y) {
                    return false;
                }
                // Even-odd ray casting
                let mut inside = false;
                let mut j = ring.len() - 1;
                for i in 0..ring.len() {
                    let [xi, yi] = ring[i];
                    let [xj, yj] = ring[j];
                    if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                        inside = !inside;
                    }
                    j = i;
                }
                inside
            }
        }
    }
}

/// Regular north-up pixel grid with square pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    /// Map x of the top-left corner
    pub origin_x: f64,
    /// Map y of the top-left corner
    pub origin_y: f64,
    /// Pixel edge length in CRS units
    pub pixel_size: f64,
    pub rows: usize,
    pub cols: usize,
    pub crs: String,
}

impl Grid {
    pub fn new(origin_x: f64, origin_y: f64, pixel_size: f64, rows: usize, cols: usize, crs: &str) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_size,
            rows,
            cols,
            crs: crs.to_string(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_size,
            self.origin_y - (row as f64 + 0.5) * self.pixel_size,
        )
    }

    /// Pixel containing map coordinate (x, y), if inside the grid
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.pixel_size).floor();
        let row = ((self.origin_y - y) / self.pixel_size).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row < self.rows && col < self.cols {
            Some((row, col))
        } else {
            None
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(
            self.origin_x,
            self.origin_y - self.rows as f64 * self.pixel_size,
            self.origin_x + self.cols as f64 * self.pixel_size,
            self.origin_y,
        )
    }

    /// Nominal ground size of one pixel in meters
    pub fn scale_m(&self) -> f64 {
        if self.crs.eq_ignore_ascii_case("EPSG:4326") {
            self.pixel_size * METERS_PER_DEGREE
        } else {
            self.pixel_size
        }
    }

    /// GDAL-style affine transform
    pub fn geo_transform(&self) -> [f64; 6] {
        [self.origin_x, self.pixel_size, 0.0, self.origin_y, 0.0, -self.pixel_size]
    }
}

/// Scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(v) => Some(*v),
            PropertyValue::Text(s) => s.parse().ok(),
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Number(v) => write!(f, "{}", v),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One named band with its nodata mask
#[derive(Debug, Clone)]
pub struct Band {
    pub name: String,
    pub values: Plane,
    pub valid: ValidityMask,
}

impl Band {
    /// Band whose validity is derived from finiteness (NaN = nodata)
    pub fn from_values(name: &str, values: Plane) -> Self {
        let valid = values.mapv(|v| v.is_finite());
        Self {
            name: name.to_string(),
            values,
            valid,
        }
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    pub fn value_at(&self, row: usize, col: usize) -> Option<f32> {
        if self.valid[[row, col]] {
            Some(self.values[[row, col]])
        } else {
            None
        }
    }
}

/// Geo-referenced, timestamped multi-band image
///
/// Immutable once built: transforms produce new rasters through the
/// expression graph in [`crate::algebra`].
#[derive(Debug, Clone)]
pub struct Raster {
    id: String,
    grid: Grid,
    footprint: Geometry,
    time: DateTime<Utc>,
    bands: Vec<Band>,
    properties: BTreeMap<String, PropertyValue>,
}

impl Raster {
    pub fn new(id: &str, grid: Grid, time: DateTime<Utc>) -> Self {
        let footprint = Geometry::Rectangle(grid.bounds());
        Self {
            id: id.to_string(),
            grid,
            footprint,
            time,
            bands: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a band; NaN pixels become nodata
    pub fn with_band(self, name: &str, values: Plane) -> FusionResult<Self> {
        let band = Band::from_values(name, values);
        self.with_masked_band(band)
    }

    pub fn with_masked_band(mut self, band: Band) -> FusionResult<Self> {
        if band.values.dim() != self.grid.shape() || band.valid.dim() != self.grid.shape() {
            return Err(FusionError::InvalidFormat(format!(
                "band '{}' has shape {:?}, grid is {:?}",
                band.name,
                band.values.dim(),
                self.grid.shape()
            )));
        }
        if self.bands.iter().any(|b| b.name == band.name) {
            return Err(FusionError::Configuration(format!(
                "duplicate band name '{}' in raster {}",
                band.name, self.id
            )));
        }
        self.bands.push(band);
        Ok(self)
    }

    pub fn with_footprint(mut self, footprint: Geometry) -> Self {
        self.footprint = footprint;
        self
    }

    pub fn with_property(mut self, key: &str, value: PropertyValue) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, PropertyValue>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn footprint(&self) -> &Geometry {
        &self.footprint
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name.clone()).collect()
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// Error types for water fusion processing
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Region reduction needs {requested} pixels, limit is {limit}")]
    TooManyPixels { requested: u64, limit: u64 },

    #[error("Backend error: {message}")]
    Backend { message: String, transient: bool },

    #[error("Asset already exists: {0}")]
    AssetExists(String),

    #[error("Run cancelled")]
    Cancelled,

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl FusionError {
    /// Backend failure worth retrying
    pub fn transient(message: impl Into<String>) -> Self {
        FusionError::Backend {
            message: message.into(),
            transient: true,
        }
    }

    /// Backend failure that retrying will not fix
    pub fn fatal(message: impl Into<String>) -> Self {
        FusionError::Backend {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FusionError::Backend { transient: true, .. })
    }
}

impl From<quick_xml::DeError> for FusionError {
    fn from(e: quick_xml::DeError) -> Self {
        FusionError::Xml(e.to_string())
    }
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_grid_locate_round_trip() {
        let grid = Grid::new(100.0, 200.0, 30.0, 4, 5, "EPSG:32615");
        for row in 0..4 {
            for col in 0..5 {
                let (x, y) = grid.pixel_center(row, col);
                assert_eq!(grid.locate(x, y), Some((row, col)));
            }
        }
        assert_eq!(grid.locate(99.0, 150.0), None);
        assert_eq!(grid.locate(150.0, 201.0), None);
        assert_eq!(grid.scale_m(), 30.0);
    }

    #[test]
    fn test_polygon_contains() {
        let triangle = Geometry::Polygon(vec![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]]);
        assert!(triangle.contains(1.0, 1.0));
        assert!(!triangle.contains(8.0, 8.0));
        assert_eq!(triangle.bounds(), BoundingBox::new(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_bbox_validation() {
        assert!(Geometry::from_bbox(&[-90.0, 10.0, -89.0, 11.0]).is_ok());
        assert!(Geometry::from_bbox(&[-89.0, 10.0, -90.0, 11.0]).is_err());
        assert!(Geometry::from_bbox(&[-90.0, 10.0, -89.0]).is_err());
    }

    #[test]
    fn test_raster_band_shape_checked() {
        let grid = Grid::new(0.0, 3.0, 1.0, 3, 3, "EPSG:32615");
        let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        let raster = Raster::new("a", grid, time);
        assert!(raster.clone().with_band("x", Plane::zeros((3, 3))).is_ok());
        assert!(raster.with_band("x", Plane::zeros((2, 3))).is_err());
    }

    #[test]
    fn test_nan_is_nodata() {
        let band = Band::from_values("b", Plane::from_shape_vec((1, 3), vec![1.0, f32::NAN, 2.0]).unwrap());
        assert_eq!(band.valid_count(), 2);
        assert_eq!(band.value_at(0, 1), None);
    }
}
