use aquafuse::export::{CancellationToken, Sensor, ThreadSleeper};
use aquafuse::io::{AssetStore, LocalAssetStore, LocalCatalog};
use aquafuse::pipeline::{OpticalPipeline, PipelineRequest, SarPipeline};
use aquafuse::types::{FusionError, Grid, Plane, PropertyValue, Raster};
use aquafuse::{FillDecision, LocalEvaluator, RasterAlgebra};
use chrono::{NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

const TARGET: &str = "users/me/fusion";
const SIZE: usize = 20;

const S1_JUNE: &str = "COPERNICUS/S1_GRD/S1A_IW_GRDH_1SDV_20200610T120000_20200610T120025_033000_03D000_ABCD";
const S1_MAY: &str = "COPERNICUS/S1_GRD/S1B_IW_GRDH_1SDV_20200520T120000_20200520T120025_021700_029300_0E1F";
const S1_APRIL: &str = "COPERNICUS/S1_GRD/S1A_IW_GRDH_1SDV_20200415T120000_20200415T120025_032200_03B900_77AA";
const S1_ELSEWHERE: &str = "COPERNICUS/S1_GRD/S1A_IW_GRDH_1SDV_20200611T120000_20200611T120025_033015_03D010_C0DE";
const LC08_CLEAR: &str = "LANDSAT/LC08/C01/T1_SR/LC08_022039_20200615";
const LC08_CLOUDY: &str = "LANDSAT/LC08/C01/T1_SR/LC08_022039_20200622";

fn grid_at(min_lon: f64, max_lat: f64) -> Grid {
    Grid::new(min_lon, max_lat, 0.05, SIZE, SIZE, "EPSG:4326")
}

fn plane(water: f32, land: f32) -> Plane {
    Plane::from_shape_fn((SIZE, SIZE), |(_, j)| if j < SIZE / 2 { water } else { land })
}

fn sar_raster(id: &str, grid: Grid, month: u32, day: u32) -> Raster {
    let time = Utc.with_ymd_and_hms(2020, month, day, 12, 0, 0).unwrap();
    Raster::new(id, grid, time)
        .with_band("VV", plane(-21.0, -8.0))
        .unwrap()
        .with_band("VH", plane(-27.0, -15.0))
        .unwrap()
        .with_band("angle", Plane::from_shape_fn((SIZE, SIZE), |(_, j)| 32.0 + 0.5 * j as f32))
        .unwrap()
}

/// Flat terrain with a strip of nodata along the northern edge
fn elevation_raster() -> Raster {
    let values = Plane::from_shape_fn((SIZE, SIZE), |(i, _)| if i == 0 { f32::NAN } else { 0.0 });
    Raster::new("MERIT/DEM", grid_at(-90.0, 11.0), Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap())
        .with_band("dem", values)
        .unwrap()
}

fn optical_raster(id: &str, day: u32, cloud_cover: f64) -> Raster {
    let time = Utc.with_ymd_and_hms(2020, 6, day, 16, 0, 0).unwrap();
    let bands = [
        ("blue", 0.05, 0.05),
        ("green", 0.06, 0.08),
        ("red", 0.04, 0.07),
        ("nir", 0.02, 0.30),
        ("swir1", 0.01, 0.25),
        ("swir2", 0.01, 0.15),
    ];
    let mut raster = Raster::new(id, grid_at(-90.0, 11.0), time);
    for (name, water, land) in bands {
        let mut values = plane(water, land);
        // cloud patch on the land side
        for i in 0..3 {
            for j in 15..SIZE {
                values[[i, j]] = f32::NAN;
            }
        }
        raster = raster.with_band(name, values).unwrap();
    }
    raster.with_property("CLOUD_COVER", PropertyValue::Number(cloud_cover))
}

fn build_catalog(dir: &std::path::Path) -> LocalCatalog {
    let mut catalog = LocalCatalog::create(dir).unwrap();
    let home = grid_at(-90.0, 11.0);
    catalog.add_scene(&sar_raster(S1_JUNE, home.clone(), 6, 10), Sensor::Sentinel1).unwrap();
    catalog.add_scene(&sar_raster(S1_MAY, home.clone(), 5, 20), Sensor::Sentinel1).unwrap();
    catalog.add_scene(&sar_raster(S1_APRIL, home, 4, 15), Sensor::Sentinel1).unwrap();
    catalog
        .add_scene(&sar_raster(S1_ELSEWHERE, grid_at(10.0, 50.0), 6, 11), Sensor::Sentinel1)
        .unwrap();
    catalog.add_scene(&optical_raster(LC08_CLEAR, 15, 12.0), Sensor::Landsat8).unwrap();
    catalog.add_scene(&optical_raster(LC08_CLOUDY, 22, 80.0), Sensor::Landsat8).unwrap();
    catalog.set_elevation(&elevation_raster()).unwrap();
    catalog.save().unwrap();
    LocalCatalog::open(dir).unwrap()
}

fn request() -> PipelineRequest {
    PipelineRequest::new(
        &[-90.0, 10.0, -89.0, 11.0],
        NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
        NaiveDate::from_ymd_opt(2020, 7, 1).unwrap(),
        TARGET,
    )
    .unwrap()
}

fn asset_names(store: &LocalAssetStore) -> Vec<String> {
    let mut names: Vec<String> = store
        .load_collection(TARGET)
        .unwrap()
        .scenes()
        .iter()
        .map(|s| s.id.clone())
        .collect();
    names.sort();
    names
}

#[test]
fn test_sar_then_optical_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let catalog_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let catalog = build_catalog(catalog_dir.path());
    let store = LocalAssetStore::new(store_dir.path()).with_gzip(true);
    let sleeper = ThreadSleeper::new(CancellationToken::new());
    let request = request();

    let sar_report = SarPipeline::new(&catalog, &store, &sleeper).unwrap().run(&request).unwrap();
    // one-month look-back picks up May; April and the far-away scene stay out
    assert_eq!(sar_report.submitted.len(), 2);
    assert!(sar_report.failed.is_empty());
    assert_eq!(
        asset_names(&store),
        vec![
            "S1A_IW_GRDH_1SDV_20200610T120000_20200610T120025_033000_03D000_ABCD".to_string(),
            "S1B_IW_GRDH_1SDV_20200520T120000_20200520T120025_021700_029300_0E1F".to_string(),
        ]
    );

    let predictions = store.load_collection(TARGET).unwrap();
    for scene in predictions.scenes() {
        let raster = LocalEvaluator::new().evaluate(&scene.image).unwrap();
        assert_eq!(raster.band_names(), vec!["proba".to_string(), "water".to_string()]);
        let proba = raster.band("proba").unwrap();
        assert!(proba.valid_count() > 0);
        assert!(proba
            .values
            .iter()
            .zip(proba.valid.iter())
            .all(|(&v, &ok)| !ok || (0.0..=100.0).contains(&v)));
        let water = raster.band("water").unwrap();
        assert!(water.values.iter().zip(water.valid.iter()).all(|(&v, &ok)| !ok || v == 0.0 || v == 1.0));
        // elevation nodata is treated as sea level, not as a gap
        assert!(proba.value_at(0, 5).is_some());
    }

    let optical_report = OpticalPipeline::new(&catalog, &store, &sleeper).unwrap().run(&request).unwrap();
    // the 80% cloud scene is skipped
    assert_eq!(optical_report.submitted, vec![format!("{}/LC08_022039_20200615", TARGET)]);

    let collection = store.load_collection(TARGET).unwrap();
    assert_eq!(collection.len(), 3);
    let fused = collection
        .scenes()
        .iter()
        .find(|s| s.id == "LC08_022039_20200615")
        .unwrap();
    let raster = LocalEvaluator::new().evaluate(&fused.image).unwrap();
    let decision = FillDecision::from_raster(&raster).unwrap();
    assert_eq!(decision.usable, 1);
    assert!(decision.p_thresh >= 5.0);

    let water = raster.band("water").unwrap();
    assert_eq!(water.value_at(10, 2), Some(1.0));
    assert_eq!(water.value_at(10, 17), Some(0.0));
    // the cloud patch is filled from the June SAR prediction
    assert!(water.value_at(1, 17).is_some());
    let proba = raster.band("proba").unwrap();
    assert_eq!(proba.value_at(1, 17), None);
    assert!(proba.value_at(10, 2).unwrap() > 90.0);
}

#[test]
fn test_sar_rerun_reuses_existing_collection() {
    let catalog_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let catalog = build_catalog(catalog_dir.path());
    let store = LocalAssetStore::new(store_dir.path());
    let sleeper = ThreadSleeper::new(CancellationToken::new());

    let pipeline = SarPipeline::new(&catalog, &store, &sleeper).unwrap();
    pipeline.run(&request()).unwrap();
    let again = pipeline.run(&request()).unwrap();

    assert_eq!(again.submitted.len(), 2);
    assert_eq!(asset_names(&store).len(), 2);
}

#[test]
fn test_optical_without_sar_collection_fails() {
    let catalog_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let catalog = build_catalog(catalog_dir.path());
    let store = LocalAssetStore::new(store_dir.path());
    let sleeper = ThreadSleeper::new(CancellationToken::new());

    let result = OpticalPipeline::new(&catalog, &store, &sleeper).unwrap().run(&request());

    assert!(matches!(result, Err(FusionError::Backend { transient: false, .. })));
}
