//! An HTTP client that fetches toggle definitions from the server.
use reqwest::{
    header::{HeaderMap, HeaderValue, ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};

use crate::{state_store::ChangeToken, toggles::ToggleCollection, Error, Result};

/// Outcome of a conditional fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// The server state still matches the token we sent.
    NotModified,
    /// A new collection and the token it came with.
    Modified {
        /// The new collection.
        collection: ToggleCollection,
        /// Token to send with the next fetch.
        token: ChangeToken,
    },
}

/// A source of toggle updates polled by [`PollerThread`](crate::PollerThread).
pub trait ToggleFetcher {
    /// Fetch toggles unless they are unchanged since `token`.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] stops the poller. Any other error is retried on the next tick.
    fn fetch(&mut self, token: &ChangeToken) -> Result<FetchResult>;
}

/// Settings for [`HttpToggleFetcher`].
#[derive(Debug, Clone)]
pub struct HttpToggleFetcherConfig {
    /// Base URL of the toggle server, e.g. `https://flags.example.com/api`.
    pub base_url: String,
    /// Sent as the `app-name` header.
    pub app_name: String,
    /// Sent as the `instance-id` header.
    pub instance_id: String,
    /// Extra headers sent with every request (e.g. `authorization`).
    pub custom_headers: HeaderMap,
}

const FEATURES_ENDPOINT: &str = "/client/features";

/// Fetches toggles from `{base_url}/client/features` with `If-None-Match` change detection.
pub struct HttpToggleFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    headers: HeaderMap,
    /// Once the server rejects our credentials, stop asking.
    unauthorized: bool,
}

impl HttpToggleFetcher {
    /// Create a new fetcher.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` doesn't parse.
    /// - [`Error::InvalidConfiguration`] if app name or instance id are not valid header values.
    pub fn new(config: HttpToggleFetcherConfig) -> Result<HttpToggleFetcher> {
        let url = Url::parse(&format!(
            "{}{FEATURES_ENDPOINT}",
            config.base_url.trim_end_matches('/')
        ))
        .map_err(Error::InvalidBaseUrl)?;

        let mut headers = config.custom_headers;
        headers.insert("app-name", header_value(&config.app_name)?);
        headers.insert("instance-id", header_value(&config.instance_id)?);
        headers.insert(
            "flagwise-sdk",
            HeaderValue::from_static(concat!("flagwise:", env!("CARGO_PKG_VERSION"))),
        );

        Ok(HttpToggleFetcher {
            client: reqwest::blocking::Client::new(),
            url,
            headers,
            unauthorized: false,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| Error::InvalidConfiguration(format!("invalid header value {value:?}: {err}")))
}

impl ToggleFetcher for HttpToggleFetcher {
    fn fetch(&mut self, token: &ChangeToken) -> Result<FetchResult> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        let mut request = self.client.get(self.url.clone()).headers(self.headers.clone());
        if !token.is_empty() {
            request = request.header(IF_NONE_MATCH, token.as_str());
        }

        log::debug!(target: "flagwise", change_token:display = token; "fetching toggles");
        let response = request.send()?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "flagwise", "toggles not modified");
                return Ok(FetchResult::NotModified);
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "flagwise", "client is not authorized. Check your authorization header");
                self.unauthorized = true;
                return Err(Error::Unauthorized);
            }
            _ => {}
        }

        let response = response.error_for_status().map_err(|err| {
            log::warn!(target: "flagwise", "received non-200 response while fetching toggles: {:?}", err);
            Error::from(err)
        })?;

        let token = response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(ChangeToken::from)
            .unwrap_or_default();

        let body = response.text()?;
        let collection: ToggleCollection = serde_json::from_str(&body)?;

        log::debug!(target: "flagwise",
                    toggles = collection.len(),
                    change_token:display = token;
                    "successfully fetched toggles");

        Ok(FetchResult::Modified { collection, token })
    }
}

/// Any closure producing fetch results is a fetcher. Handy for tests and custom transports.
impl<T: FnMut(&ChangeToken) -> Result<FetchResult>> ToggleFetcher for T {
    fn fetch(&mut self, token: &ChangeToken) -> Result<FetchResult> {
        self(token)
    }
}
