use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

use crate::processing::StatusPayload;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a retrieval.
///
/// None of these are retried by the client itself. [`Error::is_transient`] tells a caller
/// which ones are worth wrapping in their own retry loop.
#[derive(Debug, Error)]
pub enum Error {
    /// No source produced both a non-empty URL and key.
    #[error(
        "missing credentials: set CDSAPI_URL and CDSAPI_KEY or create a .cdsapirc file (searched: {})",
        display_paths(.searched)
    )]
    MissingCredentials { searched: Vec<PathBuf> },

    #[error(
        "credentials file {} must contain both a `url` and a `key` entry, e.g.\n  url: https://cds.climate.copernicus.eu/api\n  key: <your-personal-access-token>",
        .path.display()
    )]
    MalformedCredentialsFile { path: PathBuf },

    #[error("failed to read credentials file {}", .path.display())]
    CredentialsFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset name must not be empty")]
    EmptyDatasetName,

    /// The service rejected the submission or a status poll with a 4xx.
    #[error("request for dataset `{dataset}` was rejected (HTTP {status}): {reason}")]
    InvalidRequest {
        dataset: String,
        status: u16,
        reason: String,
    },

    #[error(
        "request to dataset `{dataset}` failed on the server.\nCheck https://cds.climate.copernicus.eu/requests for more information (after login).\nlast status: {}",
        payload_json(.payload)
    )]
    RemoteJobFailed {
        dataset: String,
        payload: StatusPayload,
    },

    #[error("unexpected HTTP {status} from {url}{}", detail_suffix(.detail))]
    UnexpectedHttp {
        status: u16,
        url: String,
        detail: String,
    },

    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("retrieval cancelled")]
    Cancelled,

    #[error("HTTP transport error")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn malformed(url: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a caller-level retry of the whole retrieval might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnexpectedHttp { status, .. } => {
                *status >= 500 || matches!(status, 408 | 429)
            }
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(no candidate files)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn payload_json(payload: &StatusPayload) -> String {
    serde_json::Value::Object(payload.clone()).to_string()
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

/// Problem-details body returned by the CDS API on errors.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct CdsErrorResponse {
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
    #[serde(default)]
    pub(crate) trace_id: Option<String>,
    // Some endpoints respond with {"message":...,"detail":...}
    #[serde(default)]
    pub(crate) message: Option<String>,
}

impl CdsErrorResponse {
    pub(crate) fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn title(&self) -> &str {
        self.title
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("")
    }

    fn detail(&self) -> &str {
        self.detail.as_deref().unwrap_or("")
    }

    /// One-line summary of the server message, falling back to the raw body.
    pub(crate) fn summary(&self, raw: &str) -> String {
        let title = self.title();
        let detail = self.detail();
        let mut out = match (title.is_empty(), detail.is_empty()) {
            (true, true) => raw.trim().to_string(),
            (false, true) => title.to_string(),
            (true, false) => detail.to_string(),
            (false, false) => format!("{} ({})", title, detail),
        };
        if let Some(trace) = self.trace_id.as_deref().filter(|t| !t.is_empty()) {
            out.push_str(&format!(" [trace_id: {}]", trace));
        }
        out
    }
}

/// Where in the job lifecycle a non-2xx response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Submit,
    Poll,
    Results,
    Download,
}

/// Maps a non-2xx response to the error taxonomy.
///
/// 4xx on submit or poll is the caller's fault and becomes [`Error::InvalidRequest`];
/// everything else is [`Error::UnexpectedHttp`].
pub(crate) fn classify_http_error(
    stage: Stage,
    status: StatusCode,
    url: &str,
    dataset: &str,
    parameters: &serde_json::Map<String, serde_json::Value>,
    body: &str,
) -> Error {
    let server = CdsErrorResponse::parse(body);
    let summary = server.summary(body);

    let client_fault = status.is_client_error() && matches!(stage, Stage::Submit | Stage::Poll);
    if !client_fault {
        return Error::UnexpectedHttp {
            status: status.as_u16(),
            url: url.to_string(),
            detail: summary,
        };
    }

    let reason = if stage == Stage::Submit && status == StatusCode::NOT_FOUND {
        format!("the requested dataset {} was not found", dataset)
    } else if looks_like_licence(status, &server) {
        format!(
            "required dataset licence(s) have not been accepted; open the dataset page on https://cds.climate.copernicus.eu, accept the licence(s) under \"Manage licences\" and retry. Server message: {}",
            summary
        )
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        format!(
            "authentication failed; check that the key is a valid, unexpired Personal Access Token. Server message: {}",
            summary
        )
    } else {
        format!(
            "the request is in a bad format: {}. Server message: {}",
            serde_json::Value::Object(parameters.clone()),
            summary
        )
    };

    Error::InvalidRequest {
        dataset: dataset.to_string(),
        status: status.as_u16(),
        reason,
    }
}

fn looks_like_licence(status: StatusCode, e: &CdsErrorResponse) -> bool {
    // Licence not accepted is extremely common; it deserves its own hint.
    status == StatusCode::FORBIDDEN
        && (e.title().to_lowercase().contains("required licences")
            || e.detail().to_lowercase().contains("required licence")
            || e.detail().to_lowercase().contains("manage-licences"))
}
