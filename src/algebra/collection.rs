//! Ordered scene collections
//!
//! Membership filters work on scene metadata only (time, footprint,
//! identifier, properties); pixel work stays inside each scene's [`Image`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::expr::{Image, Reducer};
use crate::types::{Geometry, PropertyValue, Raster};

/// One collection member: scene metadata plus its (lazy) image
#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub time: DateTime<Utc>,
    pub footprint: Geometry,
    pub properties: BTreeMap<String, PropertyValue>,
    pub image: Image,
}

impl Scene {
    pub fn from_raster(raster: Raster) -> Self {
        let raster = Arc::new(raster);
        Self {
            id: raster.id().to_string(),
            time: raster.time(),
            footprint: raster.footprint().clone(),
            properties: raster.properties().clone(),
            image: Image::from_shared(raster),
        }
    }

    /// Same metadata, different pixels
    pub fn with_image(&self, image: Image) -> Self {
        Self {
            image,
            ..self.clone()
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageCollection {
    scenes: Vec<Scene>,
}

impl ImageCollection {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }

    pub fn from_rasters(rasters: Vec<Raster>) -> Self {
        Self::new(rasters.into_iter().map(Scene::from_raster).collect())
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    fn filtered<F: Fn(&Scene) -> bool>(&self, keep: F) -> Self {
        Self::new(self.scenes.iter().filter(|s| keep(s)).cloned().collect())
    }

    /// Scenes with `start <= time < end`
    pub fn filter_date(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.filtered(|s| s.time >= start && s.time < end)
    }

    pub fn filter_bounds(&self, geometry: &Geometry) -> Self {
        self.filtered(|s| s.footprint.intersects(geometry))
    }

    pub fn filter_id_prefix(&self, prefix: &str) -> Self {
        self.filtered(|s| s.id.starts_with(prefix))
    }

    /// Scenes whose numeric property is below `limit`; scenes without it are dropped
    pub fn filter_property_lt(&self, key: &str, limit: f64) -> Self {
        self.filtered(|s| s.property(key).and_then(PropertyValue::as_number).map_or(false, |v| v < limit))
    }

    /// Stable sort by acquisition time
    pub fn sort_by_time(&self, ascending: bool) -> Self {
        let mut scenes = self.scenes.clone();
        if ascending {
            scenes.sort_by_key(|s| s.time);
        } else {
            scenes.sort_by(|a, b| b.time.cmp(&a.time));
        }
        Self::new(scenes)
    }

    pub fn select(&self, names: &[&str]) -> Self {
        self.map(|s| s.image.select(names))
    }

    pub fn map<F: Fn(&Scene) -> Image>(&self, f: F) -> Self {
        Self::new(self.scenes.iter().map(|s| s.with_image(f(s))).collect())
    }

    /// Per-pixel reduction across members in collection order
    pub fn reduce(&self, reducer: Reducer) -> Image {
        let images: Vec<Image> = self.scenes.iter().map(|s| s.image.clone()).collect();
        Image::composite(&images, reducer)
    }

    /// Each pixel takes the first valid value in collection order
    pub fn reduce_first_non_null(&self) -> Image {
        self.reduce(Reducer::FirstNonNull)
    }
}

impl IntoIterator for ImageCollection {
    type Item = Scene;
    type IntoIter = std::vec::IntoIter<Scene>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenes.into_iter()
    }
}
