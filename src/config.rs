use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    bootstrap::ToggleBootstrapProvider,
    cache_loader::CacheFiles,
    context::{ContextProvider, EmptyContextProvider},
    events::{ErrorHandler, ImpressionHandler, NoopErrorHandler, NoopImpressionHandler},
    metrics::MetricsSink,
    poller::PollerThreadConfig,
    toggles::strategies::{SharedStrategy, Strategy, BUILTIN_STRATEGIES},
    Client, Error, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # use flagwise::{ClientConfig, ImpressionEvent};
/// let client = ClientConfig::new("checkout-service")
///     .base_url("https://flags.example.com/api")
///     .custom_header("authorization", "client-token")
///     .impression_handler(|event: ImpressionEvent| {
///         println!("{:?}", event);
///     })
///     .to_client()
///     .expect("valid configuration");
/// ```
pub struct ClientConfig {
    pub(crate) app_name: String,
    pub(crate) instance_id: String,
    pub(crate) environment: Option<String>,
    pub(crate) base_url: Option<String>,
    pub(crate) custom_headers: Vec<(String, String)>,
    pub(crate) cache_dir: PathBuf,
    pub(crate) file_writing: bool,
    pub(crate) bootstrap_provider: Option<Box<dyn ToggleBootstrapProvider + Send + Sync>>,
    pub(crate) bootstrap_override: bool,
    pub(crate) metrics_enabled: bool,
    pub(crate) strategies: HashMap<String, SharedStrategy>,
    pub(crate) context_provider: Box<dyn ContextProvider + Send + Sync>,
    pub(crate) metrics_sink: Option<Arc<dyn MetricsSink + Send + Sync>>,
    pub(crate) impression_handler: Box<dyn ImpressionHandler + Send + Sync>,
    pub(crate) error_handler: Arc<dyn ErrorHandler + Send + Sync>,
    pub(crate) poller: PollerThreadConfig,
}

impl ClientConfig {
    /// Create a default configuration for the application named `app_name`.
    ///
    /// ```
    /// # use flagwise::ClientConfig;
    /// ClientConfig::new("checkout-service");
    /// ```
    pub fn new(app_name: impl Into<String>) -> Self {
        ClientConfig {
            app_name: app_name.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            environment: None,
            base_url: None,
            custom_headers: Vec::new(),
            cache_dir: std::env::temp_dir(),
            file_writing: true,
            bootstrap_provider: None,
            bootstrap_override: true,
            metrics_enabled: true,
            strategies: HashMap::new(),
            context_provider: Box::new(EmptyContextProvider),
            metrics_sink: None,
            impression_handler: Box::new(NoopImpressionHandler),
            error_handler: Arc::new(NoopErrorHandler),
            poller: PollerThreadConfig::default(),
        }
    }

    /// Identifier of this process, sent to the server. Defaults to a random UUID.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Environment merged into every evaluation context that doesn't set one.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Base URL of the toggle server. Required for [`Client::start_poller_thread`].
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Header sent with every request to the toggle server, e.g. `authorization`.
    pub fn custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push((name.into(), value.into()));
        self
    }

    /// Directory holding the toggle cache files. Defaults to [`std::env::temp_dir`].
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Never write cache files. Existing ones are still read.
    pub fn disable_file_writing(mut self) -> Self {
        self.file_writing = false;
        self
    }

    /// Secondary toggle source used at startup.
    ///
    /// ```
    /// # use flagwise::{ClientConfig, ToggleBootstrapFileProvider};
    /// let config = ClientConfig::new("checkout-service")
    ///     .bootstrap_provider(ToggleBootstrapFileProvider::new("toggles.json"));
    /// ```
    pub fn bootstrap_provider(
        mut self,
        provider: impl ToggleBootstrapProvider + Send + Sync + 'static,
    ) -> Self {
        self.bootstrap_provider = Some(Box::new(provider));
        self
    }

    /// When `true` (the default), non-empty bootstrapped toggles replace the disk cache. When
    /// `false`, the bootstrap provider is only consulted if the cache is missing or empty.
    pub fn bootstrap_override(mut self, bootstrap_override: bool) -> Self {
        self.bootstrap_override = bootstrap_override;
        self
    }

    /// Don't record usage counts.
    pub fn disable_metrics(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    /// Register a custom activation strategy under `name`.
    pub fn strategy(
        mut self,
        name: impl Into<String>,
        strategy: impl Strategy + Send + Sync + 'static,
    ) -> Self {
        self.strategies.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Context used by evaluation calls that don't take one.
    pub fn context_provider(
        mut self,
        context_provider: impl ContextProvider + Send + Sync + 'static,
    ) -> Self {
        self.context_provider = Box::new(context_provider);
        self
    }

    /// Receiver of usage counts. Defaults to a [`MetricsBucket`](crate::MetricsBucket), reachable
    /// through [`Client::metrics`].
    pub fn metrics_sink(mut self, metrics_sink: impl MetricsSink + Send + Sync + 'static) -> Self {
        self.metrics_sink = Some(Arc::new(metrics_sink));
        self
    }

    /// Receiver of impression events for toggles with impression data enabled.
    pub fn impression_handler(
        mut self,
        impression_handler: impl ImpressionHandler + Send + Sync + 'static,
    ) -> Self {
        self.impression_handler = Box::new(impression_handler);
        self
    }

    /// Receiver of recoverable errors (cache I/O, bootstrap, fetch).
    pub fn error_handler(mut self, error_handler: impl ErrorHandler + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    /// Interval between fetches of the poller thread. Defaults to
    /// [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`]. Jitter is a tenth of the interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self
            .poller
            .with_interval(interval)
            .with_jitter(interval / 10);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] or [`Error::InvalidBaseUrl`] if the configuration is
    ///   invalid.
    /// - Errors returned by a bootstrap provider configured to throw on failure.
    ///
    /// ```
    /// # use flagwise::{ClientConfig, Client};
    /// let client: Client = ClientConfig::new("checkout-service")
    ///     .disable_file_writing()
    ///     .to_client()
    ///     .unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Fail fast on settings that can never work.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "app name must not be empty".to_owned(),
            ));
        }

        if self
            .app_name
            .contains(|c: char| std::path::is_separator(c) || c.is_control())
        {
            return Err(Error::InvalidConfiguration(format!(
                "app name {:?} cannot be used in a cache file name",
                self.app_name
            )));
        }

        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
        }

        if let Some(name) = self
            .strategies
            .keys()
            .find(|name| BUILTIN_STRATEGIES.contains(&name.as_str()))
        {
            return Err(Error::InvalidConfiguration(format!(
                "custom strategy {name:?} shadows a built-in strategy"
            )));
        }

        if self.poller.interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "poll interval must be greater than zero".to_owned(),
            ));
        }

        self.custom_header_map()?;

        Ok(())
    }

    pub(crate) fn cache_files(&self) -> CacheFiles {
        CacheFiles::new(&self.cache_dir, &self.app_name)
    }

    pub(crate) fn custom_header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(self.custom_headers.len());
        for (name, value) in &self.custom_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                Error::InvalidConfiguration(format!("invalid header name {name:?}: {err}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|err| {
                Error::InvalidConfiguration(format!("invalid value for header {name:?}: {err}"))
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}
