//! Predict water on Sentinel-1 scenes and export them to the target collection

use anyhow::{Context, Result};
use clap::Parser;

use aquafuse::cli::{cancel_on_interrupt, PipelineArgs};
use aquafuse::export::{CancellationToken, ThreadSleeper};
use aquafuse::io::{LocalAssetStore, LocalCatalog};
use aquafuse::pipeline::SarPipeline;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = PipelineArgs::parse();
    let request = args.to_request()?;

    let catalog = LocalCatalog::open(&args.catalog)
        .with_context(|| format!("opening scene catalogue {}", args.catalog.display()))?;
    let store = LocalAssetStore::new(args.asset_root()?).with_gzip(args.gzip);
    let token = CancellationToken::new();
    cancel_on_interrupt(token.clone()).context("installing signal handlers")?;
    let sleeper = ThreadSleeper::new(token);

    let report = SarPipeline::new(&catalog, &store, &sleeper)?.run(&request)?;
    log::info!(
        "Started {} exports into {} ({} failed)",
        report.submitted.len(),
        request.target_collection,
        report.failed.len()
    );
    for (asset, error) in &report.failed {
        log::error!("{}: {}", asset, error);
    }
    Ok(())
}
