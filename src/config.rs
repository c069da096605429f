//! Resolution regimes and fixed processing constants
//!
//! Edge detection and Otsu thresholding run at the coarse scale; exports and
//! the fill percentile run at the fine scale.

/// Working resolution for edge detection and Otsu thresholding (meters)
pub const COARSE_SCALE_M: f64 = 300.0;

/// Export and fill-percentile resolution (meters)
pub const FINE_SCALE_M: f64 = 30.0;

/// CRS every asset is exported in
pub const EXPORT_CRS: &str = "EPSG:4326";

/// Pixel cap handed to the export backend
pub const EXPORT_MAX_PIXELS: f64 = 1e13;

/// Pixel cap for region reducers (percentile, histogram)
pub const REGION_MAX_PIXELS: u64 = 1_000_000_000;

/// Approximate ground length of one degree at the equator
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Scene identifiers of SAR predictions inside a target collection start with this
pub const SAR_ID_PREFIX: &str = "S1";

/// Optical scenes at or above this cloud cover (%) are skipped
pub const MAX_CLOUD_COVER: f64 = 75.0;

/// Property key carrying scene cloud cover
pub const CLOUD_COVER_KEY: &str = "CLOUD_COVER";
