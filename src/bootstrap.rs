//! Bootstrap providers: a secondary source of toggles used at startup when the disk cache is
//! missing or empty (or always, with [`ClientConfig::bootstrap_override`]).
//!
//! [`ClientConfig::bootstrap_override`]: crate::ClientConfig::bootstrap_override
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{toggles::ToggleCollection, Error, Result};

/// A source of toggles read once during client construction.
pub trait ToggleBootstrapProvider {
    /// Read the toggle collection.
    ///
    /// `Ok(None)` means "no data" and is not an error. An `Err` is reported to the
    /// [`ErrorHandler`](crate::ErrorHandler) as [`ErrorType::Bootstrap`](crate::ErrorType) and the
    /// client keeps whatever the disk cache provided.
    fn read(&self) -> Result<Option<ToggleCollection>>;

    /// Whether a failed [`read`](Self::read) should fail client construction. Defaults to `false`.
    fn throws_on_fail(&self) -> bool {
        false
    }
}

impl<T: Fn() -> Option<ToggleCollection>> ToggleBootstrapProvider for T {
    fn read(&self) -> Result<Option<ToggleCollection>> {
        Ok(self())
    }
}

/// An in-memory collection bootstraps itself.
impl ToggleBootstrapProvider for ToggleCollection {
    fn read(&self) -> Result<Option<ToggleCollection>> {
        Ok(Some(self.clone()))
    }
}

/// Reads toggles from a JSON file in the wire format.
#[derive(Debug, Clone)]
pub struct ToggleBootstrapFileProvider {
    path: PathBuf,
    throw_on_fail: bool,
}

impl ToggleBootstrapFileProvider {
    /// Create a provider reading from `path`.
    pub fn new(path: impl Into<PathBuf>) -> ToggleBootstrapFileProvider {
        ToggleBootstrapFileProvider {
            path: path.into(),
            throw_on_fail: false,
        }
    }

    /// Fail client construction if the file exists but cannot be read or parsed.
    pub fn throw_on_fail(mut self, throw_on_fail: bool) -> ToggleBootstrapFileProvider {
        self.throw_on_fail = throw_on_fail;
        self
    }

    /// Path the provider reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ToggleBootstrapProvider for ToggleBootstrapFileProvider {
    fn read(&self) -> Result<Option<ToggleCollection>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!(target: "flagwise",
                            path:? = self.path;
                            "bootstrap file does not exist");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn throws_on_fail(&self) -> bool {
        self.throw_on_fail
    }
}

/// Fetches toggles over HTTP(S) with a blocking GET.
#[derive(Debug, Clone)]
pub struct ToggleBootstrapUrlProvider {
    url: String,
    headers: HeaderMap,
    timeout: Duration,
    throw_on_fail: bool,
}

impl ToggleBootstrapUrlProvider {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a provider fetching from `url`.
    pub fn new(url: impl Into<String>) -> ToggleBootstrapUrlProvider {
        ToggleBootstrapUrlProvider {
            url: url.into(),
            headers: HeaderMap::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            throw_on_fail: false,
        }
    }

    /// Add a header to the request.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if `name` or `value` are not valid header text.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<ToggleBootstrapUrlProvider> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| Error::InvalidConfiguration(format!("header {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| Error::InvalidConfiguration(format!("header {name}: {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Time-box the request. Defaults to [`Self::DEFAULT_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> ToggleBootstrapUrlProvider {
        self.timeout = timeout;
        self
    }

    /// Fail client construction on unreachable servers, non-success responses and unparsable
    /// bodies.
    pub fn throw_on_fail(mut self, throw_on_fail: bool) -> ToggleBootstrapUrlProvider {
        self.throw_on_fail = throw_on_fail;
        self
    }
}

impl ToggleBootstrapProvider for ToggleBootstrapUrlProvider {
    fn read(&self) -> Result<Option<ToggleCollection>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        log::debug!(target: "flagwise", url:display = self.url; "fetching bootstrap toggles");
        let response = client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BootstrapFailed {
                status: status.as_u16(),
            });
        }

        let body = response.text()?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn throws_on_fail(&self) -> bool {
        self.throw_on_fail
    }
}
