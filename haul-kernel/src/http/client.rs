//! Shared `reqwest` client construction for the Coordinator Client and any
//! other component that speaks HTTP to the outside world.

use std::time::Duration;

/// Tunables for the underlying `reqwest::Client`. Retry scheduling itself
/// lives in [`super::retry::RetryConfig`]; this only configures the
/// transport.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpClientConfig {
    pub fn create_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(concat!("haul/", env!("CARGO_PKG_VERSION")))
            .build()
    }
}

/// Thin wrapper pairing a built `reqwest::Client` with the config it was
/// built from, so call sites can inspect timeouts without re-deriving them.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> reqwest::Result<Self> {
        let inner = config.create_client()?;
        Ok(Self { inner, config })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}
