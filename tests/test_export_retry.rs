use aquafuse::algebra::Scene;
use aquafuse::export::{
    CancellationToken, ExportBackend, ExportJob, ExportParams, ExportRegion, ExportRequest, ExportScheduler, JobStatus,
    NamingScheme, RetryPolicy, Sleeper, ThreadSleeper,
};
use aquafuse::types::{FusionError, FusionResult, Grid, Plane, Raster};
use chrono::{TimeZone, Utc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

const S1_A: &str = "COPERNICUS/S1_GRD/S1A_IW_GRDH_1SDV_20200101T234512_20200101T234537_030612_038202_6A8D";
const S1_B: &str = "COPERNICUS/S1_GRD/S1B_IW_GRDH_1SDV_20200105T120000_20200105T120025_019800_025700_1B2C";

#[derive(Default)]
struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> FusionResult<()> {
        self.delays.borrow_mut().push(duration);
        Ok(())
    }
}

struct CancelledSleeper;

impl Sleeper for CancelledSleeper {
    fn sleep(&self, _duration: Duration) -> FusionResult<()> {
        Err(FusionError::Cancelled)
    }
}

enum Failure {
    Transient(u32),
    Fatal,
}

/// Backend whose submissions fail according to a per-asset plan
#[derive(Default)]
struct ScriptedBackend {
    plan: RefCell<HashMap<String, Failure>>,
    submits: RefCell<Vec<String>>,
    started: Rc<RefCell<Vec<String>>>,
}

impl ScriptedBackend {
    fn fail_transient(self, asset_id: &str, times: u32) -> Self {
        self.plan.borrow_mut().insert(asset_id.to_string(), Failure::Transient(times));
        self
    }

    fn fail_fatal(self, asset_id: &str) -> Self {
        self.plan.borrow_mut().insert(asset_id.to_string(), Failure::Fatal);
        self
    }

    fn submit_count(&self, asset_id: &str) -> usize {
        self.submits.borrow().iter().filter(|id| id.as_str() == asset_id).count()
    }
}

struct RecordingJob {
    asset_id: String,
    started: Rc<RefCell<Vec<String>>>,
    status: JobStatus,
}

impl ExportJob for RecordingJob {
    fn start(&mut self) -> FusionResult<()> {
        self.started.borrow_mut().push(self.asset_id.clone());
        self.status = JobStatus::Running;
        Ok(())
    }

    fn status(&self) -> JobStatus {
        self.status.clone()
    }

    fn wait(&mut self) -> FusionResult<JobStatus> {
        self.status = JobStatus::Completed;
        Ok(self.status.clone())
    }
}

impl ExportBackend for ScriptedBackend {
    fn submit(&self, request: &ExportRequest) -> FusionResult<Box<dyn ExportJob>> {
        self.submits.borrow_mut().push(request.asset_id.clone());
        let mut plan = self.plan.borrow_mut();
        match plan.get_mut(&request.asset_id) {
            Some(Failure::Transient(left)) if *left > 0 => {
                *left -= 1;
                return Err(FusionError::transient("backend busy"));
            }
            Some(Failure::Fatal) => return Err(FusionError::fatal("quota exceeded")),
            _ => {}
        }
        Ok(Box::new(RecordingJob {
            asset_id: request.asset_id.clone(),
            started: Rc::clone(&self.started),
            status: JobStatus::Ready,
        }))
    }
}

fn scene(id: &str) -> Scene {
    let grid = Grid::new(-90.0, 11.0, 0.5, 2, 2, "EPSG:4326");
    let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let raster = Raster::new(id, grid, time)
        .with_band("proba", Plane::from_elem((2, 2), 0.5))
        .unwrap();
    Scene::from_raster(raster)
}

fn params() -> ExportParams {
    ExportParams::new("users/me/fusion", ExportRegion::Footprint, NamingScheme::SarPipeline)
}

fn asset(id: &str) -> String {
    format!("users/me/fusion/{}", id.rsplit('/').next().unwrap())
}

#[test]
fn test_nine_transient_failures_then_single_start() {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = ScriptedBackend::default().fail_transient(&asset(S1_A), 9);
    let sleeper = RecordingSleeper::default();

    let report = ExportScheduler::new(&backend, &sleeper, params())
        .export_all(&[scene(S1_A)])
        .unwrap();

    assert_eq!(report.submitted, vec![asset(S1_A)]);
    assert!(report.failed.is_empty());
    assert_eq!(backend.submit_count(&asset(S1_A)), 10);
    assert_eq!(*backend.started.borrow(), vec![asset(S1_A)]);
    let secs: Vec<u64> = sleeper.delays.borrow().iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 256]);
}

#[test]
fn test_exhausted_retries_recorded_and_batch_continues() {
    let backend = ScriptedBackend::default().fail_transient(&asset(S1_A), 50);
    let sleeper = RecordingSleeper::default();

    let report = ExportScheduler::new(&backend, &sleeper, params())
        .export_all(&[scene(S1_A), scene(S1_B)])
        .unwrap();

    // never more than the ten allowed attempts
    assert_eq!(backend.submit_count(&asset(S1_A)), 10);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, asset(S1_A));
    assert_eq!(report.submitted, vec![asset(S1_B)]);
    assert_eq!(*backend.started.borrow(), vec![asset(S1_B)]);
}

#[test]
fn test_non_transient_error_aborts_batch() {
    let backend = ScriptedBackend::default().fail_fatal(&asset(S1_A));
    let sleeper = RecordingSleeper::default();

    let result = ExportScheduler::new(&backend, &sleeper, params()).export_all(&[scene(S1_A), scene(S1_B)]);

    assert!(matches!(result, Err(FusionError::Backend { transient: false, .. })));
    assert_eq!(backend.submit_count(&asset(S1_A)), 1);
    assert_eq!(backend.submit_count(&asset(S1_B)), 0);
    assert!(sleeper.delays.borrow().is_empty());
}

#[test]
fn test_cancellation_during_backoff_aborts() {
    let backend = ScriptedBackend::default().fail_transient(&asset(S1_A), 3);

    let result = ExportScheduler::new(&backend, &CancelledSleeper, params()).export_all(&[scene(S1_A), scene(S1_B)]);

    assert!(matches!(result, Err(FusionError::Cancelled)));
    assert_eq!(backend.submit_count(&asset(S1_A)), 1);
    assert!(backend.started.borrow().is_empty());
}

#[test]
fn test_cancelled_run_submits_nothing() {
    let backend = ScriptedBackend::default();
    let token = CancellationToken::new();
    token.cancel();
    let sleeper = ThreadSleeper::new(token);

    let result = ExportScheduler::new(&backend, &sleeper, params()).export_all(&[scene(S1_A), scene(S1_B)]);

    assert!(matches!(result, Err(FusionError::Cancelled)));
    assert!(backend.submits.borrow().is_empty());
}

#[test]
fn test_invalid_identifier_fails_before_any_submission() {
    let backend = ScriptedBackend::default();
    let sleeper = RecordingSleeper::default();

    let result = ExportScheduler::new(&backend, &sleeper, params()).export_all(&[scene(S1_A), scene("COL/unknown_scene")]);

    assert!(matches!(result, Err(FusionError::Configuration(_))));
    assert!(backend.submits.borrow().is_empty());
}

#[test]
fn test_custom_policy_limits_attempts() {
    let backend = ScriptedBackend::default().fail_transient(&asset(S1_A), 5);
    let sleeper = RecordingSleeper::default();
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        backoff: 2.0,
    };

    let report = ExportScheduler::new(&backend, &sleeper, params())
        .with_policy(policy)
        .export_all(&[scene(S1_A)])
        .unwrap();

    assert_eq!(backend.submit_count(&asset(S1_A)), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(*sleeper.delays.borrow(), vec![Duration::from_millis(10), Duration::from_millis(20)]);
}

#[test]
fn test_request_uses_footprint_and_export_grid() {
    let backend = ScriptedBackend::default();
    let sleeper = RecordingSleeper::default();
    let scheduler = ExportScheduler::new(&backend, &sleeper, params());
    let s = scene(S1_A);
    let name = aquafuse::SceneName::parse(&s.id, NamingScheme::SarPipeline).unwrap();

    let request = scheduler.request(&s, &name);

    assert_eq!(request.description, "export_S1_20200101T234512");
    assert_eq!(request.scale, 30.0);
    assert_eq!(request.crs, "EPSG:4326");
    assert_eq!(request.max_pixels, 1e13);
    assert_eq!(request.region, s.footprint);
}
