use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::util::resolve_url;

/// Raw JSON status document, as returned by the job-status endpoint.
pub type StatusPayload = Map<String, Value>;

/// A dataset name plus its request parameters, forwarded verbatim as `{"inputs": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub dataset: String,
    pub parameters: Map<String, Value>,
}

impl JobRequest {
    pub fn new(dataset: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            dataset: dataset.into(),
            parameters,
        }
    }

    /// Builds a request from any JSON value; anything but an object is rejected.
    pub fn from_value(dataset: impl Into<String>, parameters: Value) -> Option<Self> {
        match parameters {
            Value::Object(map) => Some(Self::new(dataset, map)),
            _ => None,
        }
    }

    pub(crate) fn body(&self) -> Value {
        serde_json::json!({ "inputs": self.parameters })
    }
}

/// Where to poll for one submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub status_url: String,
}

impl JobHandle {
    pub fn results_url(&self) -> String {
        format!("{}/results", self.status_url.trim_end_matches('/'))
    }
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingLink {
    #[serde(default)]
    rel: Option<String>,
    href: String,
}

/// Resolves the polling location of a freshly submitted job.
///
/// The `Location` header wins; a `monitor` link in the body is the fallback. Relative
/// locations are resolved against `submit_url`, the URL the submission was POSTed to.
pub(crate) fn locate_job(
    submit_url: &str,
    location_header: Option<&str>,
    submission: &StatusPayload,
) -> Result<JobHandle> {
    let from_header = location_header
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string);

    let from_links = || -> Option<String> {
        let links = submission.get("links")?.clone();
        let links: Vec<ProcessingLink> = serde_json::from_value(links).ok()?;
        links
            .into_iter()
            .find(|l| l.rel.as_deref() == Some("monitor"))
            .map(|l| l.href)
    };

    let location = from_header.or_else(from_links).ok_or_else(|| {
        Error::malformed(
            submit_url,
            "submission response carries no job location (Location header or monitor link)",
        )
    })?;
    Ok(JobHandle {
        status_url: resolve_url(submit_url, &location)?,
    })
}

/// Observed state of a remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Accepted,
    Running,
    Successful,
    Failed,
    /// Any other value the service reports; treated as non-terminal.
    Other(String),
}

impl JobStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "running" => Self::Running,
            "successful" => Self::Successful,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Reads the `status` field of a status document.
    pub fn from_payload(url: &str, payload: &StatusPayload) -> Result<Self> {
        match payload.get("status") {
            Some(Value::String(s)) => Ok(Self::parse(s)),
            Some(other) => Err(Error::malformed(
                url,
                format!("`status` is not a string: {}", other),
            )),
            None => Err(Error::malformed(url, "missing `status` field")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingResults {
    asset: ProcessingAsset,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingAsset {
    value: ProcessingAssetValue,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingAssetValue {
    href: String,
    #[serde(default, rename = "file:size")]
    file_size: Option<u64>,
    #[serde(default, rename = "type")]
    content_type: Option<String>,
}

/// The downloadable product of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAsset {
    pub download_url: String,
    /// Expected size in bytes, if the service announced it.
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

impl ResultAsset {
    /// Extracts `asset.value.href` from a results document.
    pub(crate) fn from_results(results_url: &str, body: Value) -> Result<Self> {
        let results: ProcessingResults = serde_json::from_value(body).map_err(|e| {
            Error::malformed(results_url, format!("missing or invalid `asset.value`: {}", e))
        })?;

        let value = results.asset.value;
        let href = value.href.trim();
        if href.is_empty() {
            return Err(Error::malformed(results_url, "empty `asset.value.href`"));
        }

        Ok(Self {
            download_url: resolve_url(results_url, href)?,
            content_length: value.file_size,
            content_type: value.content_type,
        })
    }
}
