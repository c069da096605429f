//! Command-line arguments shared by both export binaries

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;

use crate::export::CancellationToken;
use crate::io::LocalAssetStore;
use crate::pipeline::PipelineRequest;
use crate::types::FusionResult;

#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// Bounding box: min_lon min_lat max_lon max_lat
    #[arg(long, num_args = 4, value_names = ["MIN_LON", "MIN_LAT", "MAX_LON", "MAX_LAT"], allow_negative_numbers = true, required = true)]
    pub bbox: Vec<f64>,

    /// Start date, YYYY-MM-DD (inclusive)
    #[arg(long = "start_time")]
    pub start_time: NaiveDate,

    /// End date, YYYY-MM-DD (exclusive)
    #[arg(long = "end_time")]
    pub end_time: NaiveDate,

    /// Target collection path for the exported assets
    #[arg(long = "target_ic")]
    pub target_ic: String,

    /// Directory holding catalog.xml and the scene band files
    #[arg(long, default_value = "catalog")]
    pub catalog: PathBuf,

    /// Asset store root (defaults to the platform data directory)
    #[arg(long = "asset-root")]
    pub asset_root: Option<PathBuf>,

    /// Gzip band files written to the asset store
    #[arg(long)]
    pub gzip: bool,
}

impl PipelineArgs {
    pub fn to_request(&self) -> FusionResult<PipelineRequest> {
        PipelineRequest::new(&self.bbox, self.start_time, self.end_time, &self.target_ic)
    }

    pub fn asset_root(&self) -> FusionResult<PathBuf> {
        match &self.asset_root {
            Some(root) => Ok(root.clone()),
            None => LocalAssetStore::default_root(),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::warn!("Received Ctrl+C, cancelling pending exports");
        },
        _ = terminate => {
            log::warn!("Received terminate signal, cancelling pending exports");
        },
    }
}

/// Cancel `token` on the first Ctrl+C or SIGTERM; a second Ctrl+C exits at once
///
/// Signals are watched from a background thread so the pipelines stay
/// synchronous.
pub fn cancel_on_interrupt(token: CancellationToken) -> FusionResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    std::thread::Builder::new().name("signal-watch".to_string()).spawn(move || {
        runtime.block_on(async move {
            shutdown_signal().await;
            token.cancel();
            if signal::ctrl_c().await.is_ok() {
                log::error!("Second interrupt, exiting");
                std::process::exit(130);
            }
        })
    })?;
    Ok(())
}
