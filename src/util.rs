use std::time::Duration;

use reqwest::Url;

use crate::error::{Error, Result};

/// Ceiling for the wait between two status polls.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(600);

/// Floor for the wait between two status polls; a zero initial wait is raised to this.
pub const MIN_POLL_WAIT: Duration = Duration::from_millis(100);

/// Poll back-off: hands out the current wait, then doubles it up to a ceiling.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(MIN_POLL_WAIT);
        Self {
            current: initial.max(MIN_POLL_WAIT).min(max),
            max,
        }
    }

    /// Returns the wait to use now and advances the state.
    pub(crate) fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }
}

/// Resolves `reference` (absolute, root-relative or relative) against the URL of the
/// response it was found in.
pub(crate) fn resolve_url(base: &str, reference: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| Error::malformed(base, format!("invalid request URL: {}", e)))?;
    let resolved = base.join(reference).map_err(|e| {
        Error::malformed(base.as_str(), format!("invalid URL `{}`: {}", reference, e))
    })?;
    Ok(resolved.to_string())
}
