use std::sync::Arc;

use crate::{
    cache_loader::CachedFilesLoader,
    events::{guarded, ImpressionEvent, ImpressionEventType},
    fetcher::{HttpToggleFetcher, HttpToggleFetcherConfig},
    metrics::{MetricsBucket, MetricsSink},
    poller::{PollerSideEffects, PollerThread},
    sharder::Md5Sharder,
    state_store::{ChangeToken, StateStore},
    toggles::{
        evaluate, evaluate_toggle, select_variant, strategies::StrategyRegistry, Evaluation,
        ToggleCollection, ToggleDefinition, Variant, VariantDefinition,
    },
    ClientConfig, Error, EvaluationContext, Result,
};

/// A feature toggle client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Construction loads toggles from the disk cache and the bootstrap provider, so the client can
/// answer immediately. Evaluation never performs I/O and never fails: unknown toggles resolve to
/// the supplied default.
///
/// # Poller Thread
///
/// To keep toggles up to date, start the poller thread with [`Client::start_poller_thread()`]. It
/// is not started automatically so that clients can run from cache or bootstrap alone (e.g. in
/// tests).
///
/// # Examples
/// ```no_run
/// # use flagwise::{Client, ClientConfig, EvaluationContext};
/// let client = Client::new(
///     ClientConfig::new("checkout-service").base_url("https://flags.example.com/api"),
/// )
/// .unwrap();
/// let poller = client.start_poller_thread().unwrap();
/// poller.wait_for_configuration().unwrap();
///
/// let context = EvaluationContext::new().with_user_id("u1");
/// if client.is_enabled_with_context("new-search", &context) {
///     // ...
/// }
/// ```
pub struct Client {
    store: Arc<StateStore>,
    strategies: StrategyRegistry,
    metrics_sink: Option<Arc<dyn MetricsSink + Send + Sync>>,
    metrics_bucket: Option<Arc<MetricsBucket>>,
    config: ClientConfig,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] or [`Error::InvalidBaseUrl`] if the configuration is
    ///   invalid.
    /// - Errors returned by a bootstrap provider that
    ///   [throws on fail](crate::ToggleBootstrapProvider::throws_on_fail).
    pub fn new(mut config: ClientConfig) -> Result<Client> {
        config.validate()?;

        let files = config.cache_files();
        let initial = CachedFilesLoader {
            files: &files,
            file_writing: config.file_writing,
            bootstrap: config.bootstrap_provider.as_deref(),
            bootstrap_override: config.bootstrap_override,
            error_handler: config.error_handler.as_ref(),
        }
        .load()?;

        let store = Arc::new(StateStore::new());
        store.replace(
            Arc::new(initial.collection.unwrap_or_default()),
            initial.change_token,
        );

        let strategies = StrategyRegistry::new(
            std::mem::take(&mut config.strategies),
            StrategyRegistry::local_hostname(),
        );

        let (metrics_sink, metrics_bucket) = if !config.metrics_enabled {
            (None, None)
        } else if let Some(sink) = config.metrics_sink.take() {
            (Some(sink), None)
        } else {
            let bucket = Arc::new(MetricsBucket::new());
            let sink: Arc<dyn MetricsSink + Send + Sync> = bucket.clone();
            (Some(sink), Some(bucket))
        };

        log::debug!(target: "flagwise",
                    app_name:display = config.app_name,
                    toggles = store.current().len();
                    "client created");

        Ok(Client {
            store,
            strategies,
            metrics_sink,
            metrics_bucket,
            config,
        })
    }

    /// Check whether `toggle_name` is enabled for the context returned by the configured
    /// [`ContextProvider`](crate::ContextProvider). Unknown toggles are disabled.
    pub fn is_enabled(&self, toggle_name: &str) -> bool {
        self.is_enabled_or(toggle_name, &self.config.context_provider.context(), false)
    }

    /// Check whether `toggle_name` is enabled for `context`. Unknown toggles are disabled.
    pub fn is_enabled_with_context(&self, toggle_name: &str, context: &EvaluationContext) -> bool {
        self.is_enabled_or(toggle_name, context, false)
    }

    /// Check whether `toggle_name` is enabled for `context`, returning `default_enabled` if the
    /// toggle is unknown.
    ///
    /// ```
    /// # fn test(client: &flagwise::Client) {
    /// use flagwise::EvaluationContext;
    ///
    /// let context = EvaluationContext::new().with_user_id("u1");
    /// let enabled = client.is_enabled_or("new-search", &context, true);
    /// # }
    /// ```
    pub fn is_enabled_or(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
        default_enabled: bool,
    ) -> bool {
        self.evaluate(toggle_name, context, default_enabled).enabled
    }

    /// Like [`Client::is_enabled_or`] but also returns which strategy matched and why.
    pub fn evaluate(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
        default_enabled: bool,
    ) -> Evaluation {
        let collection = self.store.current();
        let context = self.merge_static_fields(context);

        let evaluation = evaluate(
            &collection,
            &self.strategies,
            toggle_name,
            &context,
            default_enabled,
            &Md5Sharder,
        );

        log::trace!(target: "flagwise",
                    toggle_name,
                    context:serde = *context,
                    evaluation:serde;
                    "evaluated a toggle");

        // Only toggles present in the collection are counted.
        if let Some(toggle) = collection.toggle(toggle_name) {
            self.record_evaluation(toggle_name, evaluation.enabled);
            self.emit_impression(
                toggle,
                ImpressionEventType::IsEnabled,
                evaluation.enabled,
                None,
                &context,
            );
        }

        evaluation
    }

    /// Get the variant of `toggle_name` for the context returned by the configured
    /// [`ContextProvider`](crate::ContextProvider).
    pub fn get_variant(&self, toggle_name: &str) -> Variant {
        self.get_variant_or(
            toggle_name,
            &self.config.context_provider.context(),
            &Variant::disabled(),
        )
    }

    /// Get the variant of `toggle_name` for `context`. Returns [`Variant::disabled()`] if the
    /// toggle is unknown, disabled for `context` or has no variants.
    pub fn get_variant_with_context(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
    ) -> Variant {
        self.get_variant_or(toggle_name, context, &Variant::disabled())
    }

    /// Get the variant of `toggle_name` for `context`, returning `default_variant` if the toggle is
    /// unknown, disabled for `context` or has no variants.
    ///
    /// ```
    /// # fn test(client: &flagwise::Client) {
    /// use flagwise::{EvaluationContext, Variant};
    ///
    /// let context = EvaluationContext::new().with_session_id("s1");
    /// let variant = client.get_variant_or("checkout-button", &context, &Variant::disabled());
    /// match variant.name.as_str() {
    ///     "blue" => { /* ... */ }
    ///     _ => { /* ... */ }
    /// }
    /// # }
    /// ```
    pub fn get_variant_or(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
        default_variant: &Variant,
    ) -> Variant {
        // Enablement and variant come from the same snapshot.
        let collection = self.store.current();
        let context = self.merge_static_fields(context);

        let Some(toggle) = collection.toggle(toggle_name) else {
            log::trace!(target: "flagwise", toggle_name; "unknown toggle, returning default variant");
            return default_variant.clone();
        };

        let evaluation = self.evaluate_known(&collection, toggle, &context);
        let variant = if evaluation.enabled {
            select_variant(toggle, &context, default_variant, &Md5Sharder)
        } else {
            default_variant.clone()
        };

        log::trace!(target: "flagwise",
                    toggle_name,
                    context:serde = *context,
                    variant:serde;
                    "selected a variant");

        self.record_evaluation(toggle_name, evaluation.enabled);
        self.record_variant(toggle_name, &variant.name);
        self.emit_impression(
            toggle,
            ImpressionEventType::GetVariant,
            evaluation.enabled,
            Some(&variant),
            &context,
        );

        variant
    }

    /// Variant definitions of `toggle_name` for the context returned by the configured
    /// [`ContextProvider`](crate::ContextProvider).
    pub fn get_variants(&self, toggle_name: &str) -> Option<Vec<VariantDefinition>> {
        self.get_variants_with_context(toggle_name, &self.config.context_provider.context())
    }

    /// Variant definitions of `toggle_name`, or `None` if the toggle is unknown or disabled for
    /// `context`.
    pub fn get_variants_with_context(
        &self,
        toggle_name: &str,
        context: &EvaluationContext,
    ) -> Option<Vec<VariantDefinition>> {
        let collection = self.store.current();
        let context = self.merge_static_fields(context);

        let toggle = collection.toggle(toggle_name)?;
        self.evaluate_known(&collection, toggle, &context)
            .enabled
            .then(|| toggle.variants.clone())
    }

    /// Names of all toggles in the active collection, sorted.
    pub fn toggle_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .current()
            .toggles()
            .map(|toggle| toggle.name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Change token of the active collection. Empty if toggles never came from the server.
    pub fn change_token(&self) -> ChangeToken {
        self.store.change_token()
    }

    /// The store holding the active collection. Useful to install toggles from a custom source.
    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// The default metrics bucket. `None` if metrics are disabled or a custom
    /// [`MetricsSink`] is configured.
    pub fn metrics(&self) -> Option<&MetricsBucket> {
        self.metrics_bucket.as_deref()
    }

    /// Start a poller thread to fetch toggles from the server.
    ///
    /// Fetched toggles are backed up to the cache files unless file writing is disabled.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] if no base URL is configured.
    /// - [`Error::Io`] if the thread failed to start.
    pub fn start_poller_thread(&self) -> Result<PollerThread> {
        let Some(base_url) = &self.config.base_url else {
            return Err(Error::InvalidConfiguration(
                "base URL is required to poll for toggles".to_owned(),
            ));
        };

        let fetcher = HttpToggleFetcher::new(HttpToggleFetcherConfig {
            base_url: base_url.clone(),
            app_name: self.config.app_name.clone(),
            instance_id: self.config.instance_id.clone(),
            custom_headers: self.config.custom_header_map()?,
        })?;

        let side_effects = PollerSideEffects {
            backup: self.config.file_writing.then(|| self.config.cache_files()),
            error_handler: self.config.error_handler.clone(),
        };

        Ok(PollerThread::start_with_side_effects(
            fetcher,
            self.store.clone(),
            self.config.poller.clone(),
            side_effects,
        )?)
    }

    fn evaluate_known(
        &self,
        collection: &ToggleCollection,
        toggle: &ToggleDefinition,
        context: &EvaluationContext,
    ) -> Evaluation {
        evaluate_toggle(collection, &self.strategies, toggle, context, &Md5Sharder)
    }

    fn merge_static_fields<'c>(
        &self,
        context: &'c EvaluationContext,
    ) -> std::borrow::Cow<'c, EvaluationContext> {
        context.with_static_fields(&self.config.app_name, self.config.environment.as_deref())
    }

    fn record_evaluation(&self, toggle_name: &str, enabled: bool) {
        if let Some(sink) = &self.metrics_sink {
            guarded("metrics_sink", || sink.record_evaluation(toggle_name, enabled));
        }
    }

    fn record_variant(&self, toggle_name: &str, variant_name: &str) {
        if let Some(sink) = &self.metrics_sink {
            guarded("metrics_sink", || sink.record_variant(toggle_name, variant_name));
        }
    }

    fn emit_impression(
        &self,
        toggle: &ToggleDefinition,
        event_type: ImpressionEventType,
        enabled: bool,
        variant: Option<&Variant>,
        context: &EvaluationContext,
    ) {
        if !toggle.impression_data {
            return;
        }

        let event = ImpressionEvent::new(event_type, &toggle.name, enabled, variant, context);
        log::trace!(target: "flagwise", event:serde; "emitting impression");
        guarded("impression_handler", || {
            self.config.impression_handler.on_impression(event)
        });
    }
}
