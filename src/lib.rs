//! An async client for the Copernicus Climate Data Store (CDS) Retrieve API.
//!
//! Retrieving data from the CDS is a three step flow: submit a job, poll its status until it
//! finishes, then download the resulting file. [`Client::retrieve`] runs that flow for one job.
//!
//! ## Quick start
//! - Configure authentication via environment variables (`CDSAPI_URL`, `CDSAPI_KEY`) or a
//!   `.cdsapirc` file (supported in the current directory and in your home directory).
//! - Resolve [`Credentials`] and call [`Client::retrieve`] with a dataset and a JSON request.
//!
//! ```no_run
//! use cds_retrieve::{Client, CredentialResolver, JobRequest};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), cds_retrieve::Error> {
//! let credentials = CredentialResolver::from_env().resolve()?;
//! let request = JobRequest::from_value(
//!     "reanalysis-era5-pressure-levels-monthly-means",
//!     json!({
//!         "data_format": "grib",
//!         "product_type": "monthly_averaged_reanalysis",
//!         "variable": "divergence",
//!         "pressure_level": "1",
//!         "year": "2020",
//!         "month": "06",
//!         "time": "00:00"
//!     }),
//! )
//! .expect("request parameters are a JSON object");
//!
//! let status = Client::new()?
//!     .retrieve(
//!         &credentials,
//!         &request,
//!         std::path::Path::new("era5.grib"),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(status["status"], "successful");
//! # Ok(())
//! # }
//! ```
//!
//! Polling backs off exponentially (1 s, 2 s, 4 s, ... capped at 10 minutes). Jobs can run
//! for hours; bound them by cancelling the [`CancellationToken`](tokio_util::sync::CancellationToken)
//! passed to `retrieve`, e.g. from a `tokio::time::timeout` or a signal handler.

#![forbid(unsafe_code)]

mod client;
mod config;
mod download;
mod error;
mod processing;
mod sleeper;
mod util;

use std::path::Path;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

pub use client::{Client, ClientOptions};
pub use config::{CredentialResolver, Credentials, ENV_KEY, ENV_RC, ENV_URL};
pub use error::{Error, Result};
pub use processing::{JobHandle, JobRequest, JobStatus, ResultAsset, StatusPayload};
pub use sleeper::{Sleeper, TokioSleeper};
pub use util::{MAX_POLL_WAIT, MIN_POLL_WAIT};

/// Resolves credentials from the environment / `.cdsapirc` and runs one retrieval with a
/// default [`Client`].
///
/// Credentials are looked up again on every call.
pub async fn retrieve(
    dataset: &str,
    parameters: Map<String, Value>,
    target: &Path,
) -> Result<StatusPayload> {
    retrieve_with(
        &CredentialResolver::from_env(),
        &Client::new()?,
        dataset,
        parameters,
        target,
    )
    .await
}

/// Like [`retrieve`], with an explicit credential source and client.
pub async fn retrieve_with(
    resolver: &CredentialResolver,
    client: &Client,
    dataset: &str,
    parameters: Map<String, Value>,
    target: &Path,
) -> Result<StatusPayload> {
    let credentials = resolver.resolve()?;
    let request = JobRequest::new(dataset, parameters);
    client
        .retrieve(&credentials, &request, target, &CancellationToken::new())
        .await
}
