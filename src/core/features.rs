//! Per-sensor band preparation ahead of classification

use crate::algebra::{FocalStat, Image};

/// Half-width of the SAR texture window; floors to a 9x9 kernel
pub const SAR_NEIGHBORHOOD_RADIUS: f64 = 4.5;

/// Append the modified normalized difference water index as `mndwi`
pub fn add_mndwi(image: &Image) -> Image {
    let green = image.select(&["green"]);
    let swir1 = image.select(&["swir1"]);
    let mndwi = green.subtract(&swir1).divide(&green.add(&swir1)).rename("mndwi");
    image.add_bands(&mndwi, false)
}

/// Append focal mean and standard deviation of every `V*` polarization band
pub fn add_sar_neighborhood(image: &Image) -> Image {
    let polarizations = image.select_prefix("V");
    let mean = polarizations.focal(FocalStat::Mean, SAR_NEIGHBORHOOD_RADIUS).suffix("_mean");
    let std_dev = polarizations.focal(FocalStat::StdDev, SAR_NEIGHBORHOOD_RADIUS).suffix("_stdDev");
    image.add_bands(&mean, false).add_bands(&std_dev, false)
}

/// Append the `VVVH` co/cross-polarization ratio
pub fn add_sar_ratio(image: &Image) -> Image {
    let ratio = image.select(&["VV"]).divide(&image.select(&["VH"])).rename("VVVH");
    image.add_bands(&ratio, false)
}

/// Full SAR feature stack: texture first, ratio last
pub fn sar_features(image: &Image) -> Image {
    add_sar_ratio(&add_sar_neighborhood(image))
}

/// 1 where the monthly recurrence layer has ever seen water, 0 elsewhere
pub fn max_extent(recurrence: &Image) -> Image {
    let seen = recurrence.gt(&Image::constant(0.0)).unmask_value(0.0);
    recurrence.mask().and(&seen)
}
