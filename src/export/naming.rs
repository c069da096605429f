//! Export asset naming from scene identifiers
//!
//! Identifiers are slash-delimited paths; the final segment is split on
//! underscores and the acquisition date token is read at a fixed,
//! sensor-dependent position. The two pipelines disagree on that position for
//! Landsat 8 identifiers (index 1 in the SAR pipeline, index 2 in the optical
//! one) and both layouts are kept. A token that does not look like a date is
//! rejected instead of producing a silently wrong asset name.

use regex::Regex;
use std::fmt;

use crate::types::{FusionError, FusionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Sentinel1,
    Landsat8,
}

impl Sensor {
    pub fn tag(&self) -> &'static str {
        match self {
            Sensor::Sentinel1 => "S1",
            Sensor::Landsat8 => "LC08",
        }
    }

    /// Substring detection; `S1` wins when both tags occur
    pub fn detect(identifier: &str) -> Option<Sensor> {
        if identifier.contains("S1") {
            Some(Sensor::Sentinel1)
        } else if identifier.contains("LC08") {
            Some(Sensor::Landsat8)
        } else {
            None
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Token layout used by each pipeline's export step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    SarPipeline,
    OpticalPipeline,
}

impl NamingScheme {
    pub fn date_index(&self, sensor: Sensor) -> usize {
        match (self, sensor) {
            (_, Sensor::Sentinel1) => 4,
            (NamingScheme::SarPipeline, Sensor::Landsat8) => 1,
            (NamingScheme::OpticalPipeline, Sensor::Landsat8) => 2,
        }
    }
}

/// Parsed export name of one scene
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneName {
    pub sensor: Sensor,
    pub date_token: String,
    /// Final path segment of the identifier
    pub asset_name: String,
}

impl SceneName {
    pub fn parse(identifier: &str, scheme: NamingScheme) -> FusionResult<Self> {
        let sensor = Sensor::detect(identifier).ok_or_else(|| {
            FusionError::Configuration(format!("identifier '{}' carries no known sensor tag (S1, LC08)", identifier))
        })?;
        let asset_name = identifier.rsplit('/').next().unwrap_or(identifier).to_string();
        let index = scheme.date_index(sensor);
        let token = asset_name.split('_').nth(index).ok_or_else(|| {
            FusionError::Configuration(format!(
                "identifier '{}' has no segment {} for the {} date token",
                identifier, index, sensor
            ))
        })?;
        if !date_token_pattern()?.is_match(token) {
            return Err(FusionError::Configuration(format!(
                "segment {} of '{}' is '{}', not a date token; {} identifier layout changed?",
                index, identifier, token, sensor
            )));
        }
        Ok(Self {
            sensor,
            date_token: token.to_string(),
            asset_name,
        })
    }

    /// Export task description, `export_<sensor>_<date>`
    pub fn description(&self) -> String {
        format!("export_{}_{}", self.sensor.tag(), self.date_token)
    }

    pub fn asset_id(&self, target_collection: &str) -> String {
        format!("{}/{}", target_collection.trim_end_matches('/'), self.asset_name)
    }
}

fn date_token_pattern() -> FusionResult<Regex> {
    // YYYYMMDD, optionally followed by THHMMSS
    Regex::new(r"^\d{8}(T\d{6})?$").map_err(|e| FusionError::Configuration(e.to_string()))
}
