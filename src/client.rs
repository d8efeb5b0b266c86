use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::download::stream_to_file;
use crate::error::{Error, Result, Stage, classify_http_error};
use crate::processing::{JobHandle, JobRequest, JobStatus, ResultAsset, StatusPayload, locate_job};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::util::{Backoff, MAX_POLL_WAIT};

const TOKEN_HEADER: &str = "PRIVATE-TOKEN";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// First wait between two status polls; doubled after every non-terminal poll. Raised to
    /// [`MIN_POLL_WAIT`](crate::MIN_POLL_WAIT) if smaller.
    pub initial_wait: Duration,
    /// Ceiling for the poll wait.
    pub max_wait: Duration,
    /// Per-request timeout for API calls, covering connect, send and body. Asset downloads
    /// are not bounded by it.
    pub timeout: Duration,
    /// Bound on connection setup for every request, downloads included. Fixed when the
    /// client is built.
    pub connect_timeout: Duration,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Show a progress bar while downloading.
    pub progress: bool,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(1),
            max_wait: MAX_POLL_WAIT,
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            verify_tls: true,
            progress: true,
            user_agent: format!("cds-retrieve/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Runs retrievals against the CDS Retrieve API.
///
/// The client holds no credentials and no per-job state; one `Client` can serve any number
/// of concurrent [`retrieve`](Self::retrieve) calls.
#[derive(Clone)]
pub struct Client {
    options: ClientOptions,
    sleeper: Arc<dyn Sleeper>,
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Result<Self> {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&options.user_agent)
                .unwrap_or(HeaderValue::from_static("cds-retrieve")),
        );

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(!options.verify_tls)
            .build()?;

        Ok(Self {
            options,
            sleeper: Arc::new(TokioSleeper),
            http,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.options.initial_wait = wait;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.options.max_wait = wait;
        self
    }

    /// Sets the per-request timeout of API calls. Connection setup stays bounded by
    /// [`ClientOptions::connect_timeout`], which only [`with_options`](Self::with_options) sets.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.options.progress = progress;
        self
    }

    /// Replaces the timer used between status polls.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Submits `request`, waits for the job to finish and downloads its result to `target`.
    ///
    /// Returns the last status document observed while polling. `target` is created or
    /// truncated only once the job is known to have succeeded. Triggering `cancel` aborts the
    /// pending HTTP call or sleep with [`Error::Cancelled`].
    #[tracing::instrument(
        skip_all,
        fields(dataset = %request.dataset, path = %target.display())
    )]
    pub async fn retrieve(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<StatusPayload> {
        let result = self.run(credentials, request, target, cancel).await;
        if let Err(Error::Cancelled) = &result {
            warn!("retrieval cancelled");
        }
        result
    }

    async fn run(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<StatusPayload> {
        if request.dataset.trim().is_empty() {
            return Err(Error::EmptyDatasetName);
        }

        let job = self.submit(credentials, request, cancel).await?;
        let status = self
            .wait_for_completion(credentials, request, &job, cancel)
            .await?;
        let asset = self
            .fetch_result_asset(credentials, request, &job, cancel)
            .await?;
        self.download(credentials, request, &asset, target, cancel)
            .await?;

        Ok(status)
    }

    /// POSTs the execution request. Never retried.
    async fn submit(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobHandle> {
        let url = format!(
            "{}/retrieve/v1/processes/{}/execute",
            credentials.url.trim_end_matches('/'),
            request.dataset
        );

        let req = self
            .authed(self.http.post(&url), credentials)
            .json(&request.body())
            .timeout(self.options.timeout);
        let resp = self.send(req, &url, cancel).await?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let submitted: StatusPayload = self
            .read_json(Stage::Submit, &url, request, resp, cancel)
            .await?;

        let job = locate_job(&url, location.as_deref(), &submitted)?;

        info!(
            status_url = %job.status_url,
            status = submitted.get("status").and_then(|v| v.as_str()).unwrap_or("?"),
            "job submitted"
        );
        Ok(job)
    }

    /// Polls until the job reaches `successful` or `failed`, backing off between polls.
    async fn wait_for_completion(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<StatusPayload> {
        let mut backoff = Backoff::new(self.options.initial_wait, self.options.max_wait);
        let mut last_status: Option<JobStatus> = None;

        loop {
            let req = self
                .authed(self.http.get(&job.status_url), credentials)
                .timeout(self.options.timeout);
            let resp = self.send(req, &job.status_url, cancel).await?;
            let payload: StatusPayload = self
                .read_json(Stage::Poll, &job.status_url, request, resp, cancel)
                .await?;
            let status = JobStatus::from_payload(&job.status_url, &payload)?;

            if last_status.as_ref() != Some(&status) {
                info!(%status, "job status");
                last_status = Some(status.clone());
            }

            match status {
                JobStatus::Successful => return Ok(payload),
                JobStatus::Failed => {
                    warn!(status_url = %job.status_url, "job failed on the server");
                    return Err(Error::RemoteJobFailed {
                        dataset: request.dataset.clone(),
                        payload,
                    });
                }
                _ => {
                    let wait = backoff.next_wait();
                    debug!(?wait, "job not finished yet");
                    self.sleep(wait, cancel).await?;
                }
            }
        }
    }

    async fn fetch_result_asset(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<ResultAsset> {
        let url = job.results_url();
        let req = self
            .authed(self.http.get(&url), credentials)
            .timeout(self.options.timeout);
        let resp = self.send(req, &url, cancel).await?;
        let body: Value = self
            .read_json(Stage::Results, &url, request, resp, cancel)
            .await?;

        let asset = ResultAsset::from_results(&url, body)?;
        debug!(
            href = %asset.download_url,
            size = ?asset.content_length,
            content_type = ?asset.content_type,
            "result asset"
        );
        Ok(asset)
    }

    async fn download(
        &self,
        credentials: &Credentials,
        request: &JobRequest,
        asset: &ResultAsset,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let req = self.authed(self.http.get(&asset.download_url), credentials);
        let resp = self.send(req, &asset.download_url, cancel).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = cancellable(cancel, resp.text()).await?;
            return Err(classify_http_error(
                Stage::Download,
                status,
                &asset.download_url,
                &request.dataset,
                &request.parameters,
                &body,
            ));
        }

        let bytes = stream_to_file(
            resp,
            target,
            asset.content_length,
            self.options.progress,
            cancel,
        )
        .await?;
        info!(bytes, path = %target.display(), "result downloaded");
        Ok(bytes)
    }

    fn authed(&self, req: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        req.header(TOKEN_HEADER, credentials.key.trim())
    }

    async fn send(
        &self,
        req: RequestBuilder,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        debug!(url, "sending request");
        cancellable(cancel, req.send()).await
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        stage: Stage,
        url: &str,
        request: &JobRequest,
        resp: Response,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let status = resp.status();
        let text = cancellable(cancel, resp.text()).await?;
        if !status.is_success() {
            return Err(classify_http_error(
                stage,
                status,
                url,
                &request.dataset,
                &request.parameters,
                &text,
            ));
        }

        serde_json::from_str::<T>(&text)
            .map_err(|e| Error::malformed(url, format!("invalid JSON (HTTP {}): {}", status, e)))
    }

    async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.sleeper.sleep(wait) => Ok(()),
        }
    }
}

async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, reqwest::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => Ok(res?),
    }
}
