use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::{
    context::EvaluationContext,
    definitions_store::{DefinitionsSnapshot, DefinitionsStore, LoadOutcome},
    eval::FlagEvaluator,
    feature_flag_error::{FeatureFlagError, FlagsRecords},
    fetcher::{DefinitionsFetcher, FlagsFetcher, FlagsRequest, HttpFetcher, HttpFetcherConfig},
    flags_cache::{CachedFlags, FlagsCache, FlagsCacheKey},
    models::FlagValue,
    poller::{PollerThread, PollerThreadConfig},
    sharder::Sha1Sharder,
    ClientConfig, Result,
};

/// A feature flag client.
///
/// Flags are evaluated locally whenever definitions are available and the context carries
/// everything the flag's rules need. Otherwise the client asks the flag service and caches the
/// answer for the exact context.
///
/// Lookups never fail: they return the caller's default when no value can be determined. Use
/// [`Client::get_feature_flag_error`] to find out why.
///
/// # Examples
/// ```
/// # use flagcore::{Client, ClientConfig};
/// let client = Client::new(ClientConfig::from_api_key("api-key")).unwrap();
/// ```
pub struct Client {
    store: Arc<DefinitionsStore>,
    flags_fetcher: Arc<dyn FlagsFetcher>,
    local_evaluation: bool,
    flags_cache: FlagsCache,
    records: FlagsRecords,
    poller: Mutex<Option<PollerThread>>,
}

/// A flag value together with its payload.
struct ResolvedFlag {
    value: FlagValue,
    payload: Option<serde_json::Value>,
}

impl Client {
    /// Create a new `Client` talking to the flag service over HTTP.
    ///
    /// When local evaluation is enabled, a poller thread starts loading definitions right away.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client can't be initialized.
    pub fn new(mut config: ClientConfig) -> Result<Client> {
        let fetcher = Arc::new(HttpFetcher::new(HttpFetcherConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            personal_api_key: config.personal_api_key.clone(),
            timeout: config.request_timeout,
        })?);

        if config.local_evaluation && config.personal_api_key.is_none() {
            log::warn!(target: "flagcore", "local evaluation requires a personal API key, disabling it");
            config.local_evaluation = false;
        }

        Ok(Client::with_fetchers(config, fetcher.clone(), fetcher))
    }

    /// Create a new `Client` using custom transports.
    ///
    /// The credentials and base URL in `config` are ignored.
    pub fn with_fetchers(
        config: ClientConfig,
        definitions_fetcher: Arc<dyn DefinitionsFetcher>,
        flags_fetcher: Arc<dyn FlagsFetcher>,
    ) -> Client {
        let store = Arc::new(DefinitionsStore::new(definitions_fetcher));
        let cache_max_age = Some(config.cache_max_age);

        let client = Client {
            store,
            flags_fetcher,
            local_evaluation: config.local_evaluation,
            flags_cache: FlagsCache::new(config.cache_max_size, cache_max_age),
            records: FlagsRecords::new(FlagsRecords::DEFAULT_CAPACITY),
            poller: Mutex::new(None),
        };
        if client.local_evaluation {
            client.start_poller(config.poller);
        }
        client
    }

    fn start_poller(&self, config: PollerThreadConfig) {
        match PollerThread::start(self.store.clone(), config) {
            Ok(poller) => *self.lock_poller() = Some(poller),
            Err(err) => {
                // Definitions are still loaded on demand.
                log::warn!(target: "flagcore", "failed to start poller thread: {}", err);
            }
        }
    }

    /// Get the value of the flag with `flag_key`, or `default` if it can't be determined.
    pub fn get_feature_flag(
        &self,
        flag_key: &str,
        default: FlagValue,
        context: &EvaluationContext,
    ) -> FlagValue {
        self.resolve(flag_key, context)
            .map_or(default, |resolved| resolved.value)
    }

    /// Returns `true` if the flag is on or resolved to any variant, or `default` if it can't be
    /// determined.
    pub fn is_feature_enabled(
        &self,
        flag_key: &str,
        default: bool,
        context: &EvaluationContext,
    ) -> bool {
        self.resolve(flag_key, context)
            .map_or(default, |resolved| resolved.value.is_enabled())
    }

    /// Get the payload attached to the value the flag resolves to.
    pub fn get_feature_flag_payload(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Option<serde_json::Value> {
        self.resolve(flag_key, context)?.payload
    }

    /// Get all flags for `context`.
    ///
    /// Flags are computed locally only if every flag can be decided locally. Otherwise they are
    /// requested from the flag service. Returns `None` if neither works.
    pub fn get_feature_flags(&self, context: &EvaluationContext) -> Option<CachedFlags> {
        if let Some(cached) = self.flags_cache.get(&FlagsCacheKey::from(context)) {
            log::debug!(target: "flagcore", distinct_id:display = context.distinct_id; "flags cache hit");
            return Some(cached);
        }
        if let Some(flags) = self.local_flags(context, false) {
            return Some(flags);
        }
        self.remote_flags(context)
    }

    /// Get all flags that can be decided locally for `context`, skipping the rest. Never calls the
    /// flags endpoint.
    pub fn get_feature_flags_locally(&self, context: &EvaluationContext) -> Option<CachedFlags> {
        self.local_flags(context, true)
    }

    /// Explain why the last lookup of `flag_key` for `distinct_id` didn't produce a fully
    /// server-computed value. Returns `None` when there is nothing to report.
    pub fn get_feature_flag_error(
        &self,
        flag_key: &str,
        distinct_id: &str,
    ) -> Option<FeatureFlagError> {
        self.records.error_for(flag_key, distinct_id)
    }

    /// Load flag definitions now. Concurrent calls, and calls overlapping a poll, share one
    /// request.
    pub fn load_feature_flag_definitions(&self) -> LoadOutcome {
        self.store.load()
    }

    /// Stop polling for definitions and wait for the poller thread to exit. Lookups keep working
    /// with the last loaded definitions.
    pub fn shut_down(&self) {
        let poller = self.lock_poller().take();
        if let Some(poller) = poller {
            if let Err(err) = poller.shutdown() {
                log::warn!(target: "flagcore", "poller thread failed: {}", err);
            }
        }
        self.store.shut_down();
    }

    /// Drop all cached remote results.
    pub fn clear(&self) {
        self.flags_cache.clear();
        log::debug!(target: "flagcore", "flags cache cleared");
    }

    fn resolve(&self, flag_key: &str, context: &EvaluationContext) -> Option<ResolvedFlag> {
        let distinct_id = context.distinct_id.as_str();

        if let Some(cached) = self.flags_cache.get(&FlagsCacheKey::from(context)) {
            if let Some(value) = cached.flags.get(flag_key) {
                log::debug!(target: "flagcore", distinct_id; "flags cache hit");
                self.records.record_remote_lookup(distinct_id, flag_key);
                return Some(ResolvedFlag {
                    value: value.clone(),
                    payload: cached.payloads.get(flag_key).cloned(),
                });
            }
        }

        if let Some(resolved) = self.local_flag(flag_key, context) {
            self.records.record_local(distinct_id, flag_key);
            return Some(resolved);
        }

        self.records.record_remote_lookup(distinct_id, flag_key);
        let flags = self.remote_flags(context)?;
        Some(ResolvedFlag {
            value: flags.flags.get(flag_key)?.clone(),
            payload: flags.payloads.get(flag_key).cloned(),
        })
    }

    fn local_flag(&self, flag_key: &str, context: &EvaluationContext) -> Option<ResolvedFlag> {
        if !self.local_evaluation {
            return None;
        }
        let definitions = self.definitions()?;
        let flag = definitions.get_flag(flag_key)?;

        let mut evaluator = FlagEvaluator::new(&definitions, context, &Sha1Sharder, Utc::now());
        match evaluator.evaluate(flag) {
            Ok(value) => Some(ResolvedFlag {
                payload: flag.payload(&value).cloned(),
                value,
            }),
            Err(err) => {
                log::debug!(target: "flagcore",
                            flag_key,
                            distinct_id:display = context.distinct_id;
                            "local evaluation inconclusive: {}", err);
                None
            }
        }
    }

    fn local_flags(&self, context: &EvaluationContext, only_locally: bool) -> Option<CachedFlags> {
        if !self.local_evaluation {
            return None;
        }
        let definitions = self.definitions()?;

        let mut evaluator = FlagEvaluator::new(&definitions, context, &Sha1Sharder, Utc::now());
        let mut result = CachedFlags::default();
        for flag in definitions.flags() {
            match evaluator.evaluate(flag) {
                Ok(value) => {
                    if let Some(payload) = flag.payload(&value) {
                        result.payloads.insert(flag.key.clone(), payload.clone());
                    }
                    result.flags.insert(flag.key.clone(), value);
                }
                Err(err) => {
                    log::debug!(target: "flagcore",
                                flag_key:display = flag.key,
                                distinct_id:display = context.distinct_id;
                                "local evaluation inconclusive: {}", err);
                    if !only_locally {
                        return None;
                    }
                }
            }
        }

        for flag_key in result.flags.keys() {
            self.records.record_local(&context.distinct_id, flag_key);
        }
        Some(result)
    }

    /// Current definitions, loading them first if none have been loaded yet.
    fn definitions(&self) -> Option<Arc<DefinitionsSnapshot>> {
        if let Some(definitions) = self.store.get() {
            return Some(definitions);
        }
        log::debug!(target: "flagcore", "flag definitions not loaded, loading now");
        self.store.load();
        self.store.get()
    }

    fn remote_flags(&self, context: &EvaluationContext) -> Option<CachedFlags> {
        let key = FlagsCacheKey::from(context);
        if let Some(cached) = self.flags_cache.get(&key) {
            return Some(cached);
        }

        let distinct_id = context.distinct_id.as_str();
        log::debug!(target: "flagcore", distinct_id; "requesting flags from the flag service");
        match self.flags_fetcher.fetch_flags(&FlagsRequest::from(context)) {
            Ok(response) => {
                if response.errors_while_computing_flags {
                    log::warn!(target: "flagcore",
                               distinct_id,
                               request_id:? = response.request_id;
                               "flag service returned partial results");
                }
                if response.is_quota_limited() {
                    log::warn!(target: "flagcore", distinct_id; "feature flags are quota limited");
                }

                let flags = self.records.record_response(distinct_id, &response);
                self.flags_cache.put(key, flags.clone());
                Some(flags)
            }
            Err(err) => {
                log::warn!(target: "flagcore", distinct_id; "failed to request flags: {}", err);
                self.records.record_failure(distinct_id, &err);
                None
            }
        }
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<PollerThread>> {
        self.poller
            .lock()
            .expect("thread holding poller lock should not panic")
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Don't block in drop. The thread exits on its own after the stop command.
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(poller) = poller.as_ref() {
            poller.stop();
        }
    }
}
