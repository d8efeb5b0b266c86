use anyhow::{Context, Result};
use cds_retrieve::{Client, CredentialResolver, JobRequest};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Configure authentication via env vars or a `.cdsapirc` file.
    let credentials = CredentialResolver::from_env().resolve()?;

    let request = JobRequest::from_value(
        "reanalysis-era5-pressure-levels-monthly-means",
        json!({
            "data_format": "grib",
            "product_type": "monthly_averaged_reanalysis",
            "variable": "divergence",
            "pressure_level": "1",
            "year": "2020",
            "month": "06",
            "area": [90, -180, -90, 180],
            "time": "00:00"
        }),
    )
    .context("request must be a JSON object")?;

    // Give up after two hours or on Ctrl-C.
    let cancel = CancellationToken::new();
    let watchdog = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2 * 60 * 60)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        watchdog.cancel();
    });

    let target = Path::new("data/era5.grib");
    let status = Client::new()?
        .retrieve(&credentials, &request, target, &cancel)
        .await?;

    println!(
        "job {} finished with status {}; result written to {}",
        status.get("jobID").and_then(|v| v.as_str()).unwrap_or("?"),
        status["status"],
        target.display()
    );
    Ok(())
}
