use aquafuse::algebra::{Image, LocalEvaluator, RasterAlgebra};
use aquafuse::core::edge_threshold::{AdaptiveEdgeThreshold, EdgeOtsuParams};
use aquafuse::export::{NamingScheme, SceneName, Sensor};
use aquafuse::types::{Geometry, Grid, Plane, Raster};
use chrono::{Duration, TimeZone, Utc};

/// Deterministic pseudo-random sequence in [0, 1)
fn lcg(seed: u64) -> impl FnMut() -> f32 {
    let mut state = seed;
    move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 40) as f32 / (1u64 << 24) as f32
    }
}

#[test]
fn test_threshold_output_is_boolean_and_never_gains_validity() {
    let threshold = AdaptiveEdgeThreshold::with_params(EdgeOtsuParams {
        scale: 30.0,
        edge_buffer: 90.0,
        ..EdgeOtsuParams::default()
    });
    let grid = Grid::new(600_000.0, 4_000_000.0, 30.0, 16, 16, "EPSG:32616");
    let region = Geometry::Rectangle(grid.bounds());
    let time = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();

    for seed in 0..20u64 {
        let mut next = lcg(seed);
        let values = Plane::from_shape_fn((16, 16), |_| {
            let v = next();
            // roughly one pixel in six is nodata
            if v < 0.16 {
                f32::NAN
            } else {
                next()
            }
        });
        let raster = Raster::new("prob", grid.clone(), time).with_band("proba", values).unwrap();
        let input = raster.band("proba").unwrap().clone();

        let out = LocalEvaluator::new()
            .evaluate(&threshold.apply(&Image::source(raster), &region))
            .unwrap();
        let water = out.band("water").unwrap();

        for ((i, j), &ok) in water.valid.indexed_iter() {
            if ok {
                assert!(input.valid[[i, j]], "seed {}: pixel ({}, {}) gained validity", seed, i, j);
                let v = water.values[[i, j]];
                assert!(v == 0.0 || v == 1.0, "seed {}: non-binary output {}", seed, v);
            }
        }
    }
}

#[test]
fn test_date_token_layout_for_generated_identifiers() {
    let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
    for day in (0..3000).step_by(37) {
        let t = start + Duration::days(day) + Duration::seconds(day * 611 % 86_400);
        let stamp = t.format("%Y%m%dT%H%M%S").to_string();
        let date = t.format("%Y%m%d").to_string();

        let s1 = format!("COPERNICUS/S1_GRD/S1A_IW_GRDH_1SDV_{}_{}_031000_038000_ABCD", stamp, stamp);
        for scheme in [NamingScheme::SarPipeline, NamingScheme::OpticalPipeline] {
            let name = SceneName::parse(&s1, scheme).unwrap();
            assert_eq!(name.sensor, Sensor::Sentinel1);
            assert_eq!(name.date_token, stamp);
            assert_eq!(name.description(), format!("export_S1_{}", stamp));
        }

        let lc08 = format!("LANDSAT/LC08/C01/T1_SR/LC08_{:03}{:03}_{}", day % 233 + 1, day % 248 + 1, date);
        let name = SceneName::parse(&lc08, NamingScheme::OpticalPipeline).unwrap();
        assert_eq!(name.sensor, Sensor::Landsat8);
        assert_eq!(name.date_token, date);
        assert_eq!(name.asset_id("users/me/fusion/"), format!("users/me/fusion/{}", lc08.rsplit('/').next().unwrap()));

        // shifted layouts are rejected rather than misnamed
        let shifted = format!("COL/S1A_IW_GRDH_{}_1SDV_x", stamp);
        assert!(SceneName::parse(&shifted, NamingScheme::OpticalPipeline).is_err());
    }
}
