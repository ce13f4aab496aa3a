use std::time::Duration;

use crate::{poller::PollerThreadConfig, Client, Result};

/// Configuration for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) base_url: String,
    pub(crate) local_evaluation: bool,
    pub(crate) poller: PollerThreadConfig,
    pub(crate) request_timeout: Duration,
    pub(crate) cache_max_size: usize,
    pub(crate) cache_max_age: Duration,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://us.i.posthog.com";

    /// Default timeout for a single request to the flag service.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Default number of remote results kept in the flags cache.
    pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

    /// Default time a remote result stays in the flags cache.
    pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(5 * 60);

    /// Create a default configuration using the specified project API key.
    ///
    /// Local evaluation is disabled until a personal API key is provided.
    ///
    /// ```
    /// # use flagcore::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            personal_api_key: None,
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            local_evaluation: false,
            poller: PollerThreadConfig::default(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            cache_max_size: ClientConfig::DEFAULT_CACHE_MAX_SIZE,
            cache_max_age: ClientConfig::DEFAULT_CACHE_MAX_AGE,
        }
    }

    /// Set the personal API key used to download flag definitions and enable local evaluation.
    ///
    /// ```
    /// # use flagcore::ClientConfig;
    /// let config = ClientConfig::from_api_key("api-key").personal_api_key("phx_personal");
    /// ```
    pub fn personal_api_key(mut self, personal_api_key: impl Into<String>) -> Self {
        self.personal_api_key = Some(personal_api_key.into());
        self.local_evaluation = true;
        self
    }

    /// Turn local evaluation on or off. Local evaluation is only possible with definitions, so
    /// the HTTP client also needs a personal API key.
    pub fn local_evaluation(mut self, enabled: bool) -> Self {
        self.local_evaluation = enabled;
        self
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set how often flag definitions are refreshed.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_interval(interval);
        self
    }

    /// Set the maximum random amount subtracted from the poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poller = self.poller.with_jitter(jitter);
        self
    }

    /// Set the timeout for a single request to the flag service.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the number of remote results kept in the flags cache. Zero disables the cache.
    pub fn cache_max_size(mut self, max_size: usize) -> Self {
        self.cache_max_size = max_size;
        self
    }

    /// Set how long a remote result stays in the flags cache. Zero disables the cache.
    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use flagcore::{Client, ClientConfig};
    /// let client: Client = ClientConfig::from_api_key("api-key").to_client().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::from_api_key("api-key");
        assert_eq!(config.base_url, ClientConfig::DEFAULT_BASE_URL);
        assert!(!config.local_evaluation);
        assert_eq!(config.personal_api_key, None);
        assert_eq!(config.cache_max_size, 1000);
        assert_eq!(config.cache_max_age, Duration::from_secs(300));
        assert_eq!(config.poller.interval, PollerThreadConfig::DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn personal_api_key_enables_local_evaluation() {
        let config = ClientConfig::from_api_key("api-key").personal_api_key("personal");
        assert!(config.local_evaluation);

        let config = config.local_evaluation(false);
        assert!(!config.local_evaluation);
        assert_eq!(config.personal_api_key.as_deref(), Some("personal"));
    }

    #[test]
    fn poller_settings() {
        let config = ClientConfig::from_api_key("api-key")
            .poll_interval(Duration::from_secs(10))
            .poll_jitter(Duration::from_secs(1));
        assert_eq!(config.poller.interval, Duration::from_secs(10));
        assert_eq!(config.poller.jitter, Duration::from_secs(1));
    }
}
