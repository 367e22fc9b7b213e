//! A local evaluation engine for remotely-defined feature toggles.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that decides, without a network round-trip, whether a
//! toggle is enabled for an [`EvaluationContext`] and which [`Variant`] the context should see.
//!
//! Toggle definitions live in an immutable [`ToggleCollection`] snapshot held by a [`StateStore`].
//! At construction the client fills the store from a disk cache and an optional
//! [`ToggleBootstrapProvider`]. A [`PollerThread`] then keeps it up to date, using a
//! [`ChangeToken`] (ETag) so that unchanged toggles are not re-downloaded. Evaluations always see
//! one complete snapshot, never a partially-updated one.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never fails: unknown toggles, unknown strategies, dangling segment references and
//! malformed constraint operands all resolve to safe defaults. Errors are only returned from client
//! construction (invalid configuration, or a bootstrap provider set to throw on failure) and from
//! the poller thread. Recoverable errors, such as an unreadable cache file or bootstrap source, are
//! reported to the [`ErrorHandler`] configured with [`ClientConfig::error_handler`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `flagwise` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into client operations.
//!
//! # Examples
//!
//! ```no_run
//! use flagwise::{ClientConfig, EvaluationContext};
//!
//! let client = ClientConfig::new("checkout-service")
//!     .base_url("https://flags.example.com/api")
//!     .custom_header("authorization", "client-token")
//!     .to_client()
//!     .unwrap();
//! let poller = client.start_poller_thread().unwrap();
//! poller.wait_for_configuration().unwrap();
//!
//! let context = EvaluationContext::new().with_user_id("u1");
//! if client.is_enabled_with_context("new-search", &context) {
//!     let variant = client.get_variant_with_context("new-search", &context);
//!     println!("new search, variant {}", variant.name);
//! }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod bootstrap;
mod cache_loader;
mod client;
mod config;
mod context;
mod error;
mod events;
mod fetcher;
mod metrics;
mod poller;
mod sharder;
mod state_store;
pub mod toggles;

pub use bootstrap::{ToggleBootstrapFileProvider, ToggleBootstrapProvider, ToggleBootstrapUrlProvider};
pub use client::Client;
pub use config::ClientConfig;
pub use context::{ContextProvider, EvaluationContext};
pub use error::{Error, Result};
pub use events::{
    ErrorEvent, ErrorHandler, ErrorType, ImpressionEvent, ImpressionEventType, ImpressionHandler,
};
pub use fetcher::{FetchResult, HttpToggleFetcher, HttpToggleFetcherConfig, ToggleFetcher};
pub use metrics::{MetricsBucket, MetricsSink, MetricsSnapshot, ToggleCounts};
pub use poller::{PollerThread, PollerThreadConfig};
pub use sharder::{Md5Sharder, Sharder};
pub use state_store::{ChangeToken, StateStore, ToggleState};
pub use toggles::{
    strategies::Strategy, Evaluation, EvaluationReason, ToggleCollection, ToggleDefinition, Variant,
    VariantDefinition,
};
