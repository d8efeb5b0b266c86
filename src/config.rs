use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};

pub const ENV_URL: &str = "CDSAPI_URL";
pub const ENV_KEY: &str = "CDSAPI_KEY";
pub const ENV_RC: &str = "CDSAPI_RC";

/// Endpoint and personal access token for one retrieval.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base CDS API URL, typically `https://cds.climate.copernicus.eu/api`.
    pub url: String,
    pub key: String,
}

impl Credentials {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Finds credentials in (order of precedence):
/// - values set explicitly with [`with_url`](Self::with_url) / [`with_key`](Self::with_key)
/// - environment variables `CDSAPI_URL` / `CDSAPI_KEY`
/// - the first existing config file among `CDSAPI_RC`, `./.cdsapirc` and `~/.cdsapirc`
///
/// Precedence is decided per field, so an explicit URL can be combined with a key from the
/// environment. Empty values count as unset.
#[derive(Clone)]
pub struct CredentialResolver {
    url: Option<String>,
    key: Option<String>,
    env: EnvLookup,
    rc_files: Option<Vec<PathBuf>>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CredentialResolver {
    /// A resolver reading the process environment and the default config file locations.
    pub fn from_env() -> Self {
        Self {
            url: None,
            key: None,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            rc_files: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replaces the environment lookup (`CDSAPI_URL`, `CDSAPI_KEY`, `CDSAPI_RC`).
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Uses exactly these config file candidates instead of the default search path.
    pub fn with_config_files(mut self, files: Vec<PathBuf>) -> Self {
        self.rc_files = Some(files);
        self
    }

    pub fn with_config_file(self, file: impl Into<PathBuf>) -> Self {
        self.with_config_files(vec![file.into()])
    }

    pub fn resolve(&self) -> Result<Credentials> {
        let mut url = non_empty(self.url.clone()).or_else(|| non_empty((self.env)(ENV_URL)));
        let mut key = non_empty(self.key.clone()).or_else(|| non_empty((self.env)(ENV_KEY)));

        let candidates = self.rc_candidates();
        if url.is_none() || key.is_none() {
            if let Some(rc_path) = candidates.iter().find(|p| p.is_file()) {
                debug!(path = %rc_path.display(), "reading credentials file");
                let rc = read_rc(rc_path)?;
                url = url.or(rc.url);
                key = key.or(rc.key);
            }
        }

        match (url, key) {
            (Some(url), Some(key)) => Ok(Credentials { url, key }),
            _ => Err(Error::MissingCredentials {
                searched: candidates,
            }),
        }
    }

    fn rc_candidates(&self) -> Vec<PathBuf> {
        if let Some(files) = &self.rc_files {
            return files.clone();
        }
        // 1) CDSAPI_RC (explicit)
        // 2) ./.cdsapirc
        // 3) ~/.cdsapirc
        if let Some(p) = non_empty((self.env)(ENV_RC)) {
            return vec![PathBuf::from(p)];
        }

        let mut v = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            v.push(cwd.join(".cdsapirc"));
        }
        if let Some(home) = dirs::home_dir() {
            v.push(home.join(".cdsapirc"));
        }
        v
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Default)]
struct RcFile {
    url: Option<String>,
    key: Option<String>,
}

/// Parses a `.cdsapirc`; both `url` and `key` must be present.
fn read_rc(path: &Path) -> Result<RcFile> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::CredentialsFileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let rc = parse_rc(&text);
    if rc.url.is_none() || rc.key.is_none() {
        return Err(Error::MalformedCredentialsFile {
            path: path.to_path_buf(),
        });
    }
    Ok(rc)
}

fn parse_rc(text: &str) -> RcFile {
    let mut cfg = RcFile::default();

    // Support formatting where `key:` is on one line and the token is on the next line.
    let mut pending_key: Option<&str> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(pk) = pending_key.take() {
            // Continuation value line, unless it starts a new entry.
            if !starts_entry(line) {
                set_field(&mut cfg, pk, strip_quotes(line));
                continue;
            }
        }

        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim();
            let v = strip_quotes(v.trim());
            if !is_known_key(k) {
                continue;
            }
            if v.is_empty() {
                pending_key = Some(k);
            } else {
                set_field(&mut cfg, k, v);
            }
        }
    }

    cfg
}

/// `name: value` with an identifier name. Bare URLs and legacy `<uid>:<secret>` tokens are
/// values.
fn starts_entry(line: &str) -> bool {
    line.split_once(':').is_some_and(|(k, v)| {
        let k = k.trim();
        k.starts_with(|c: char| c.is_ascii_alphabetic())
            && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && !v.starts_with("//")
    })
}

fn is_known_key(k: &str) -> bool {
    matches!(k, "url" | "key")
}

fn set_field(cfg: &mut RcFile, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    match name {
        "url" => cfg.url = Some(value.to_string()),
        "key" => cfg.key = Some(value.to_string()),
        _ => {}
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
