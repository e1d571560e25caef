//! Periodically refreshed JWKS cache
//!
//! The current [`KeySet`] lives behind an [`ArcSwap`]: verification reads a
//! snapshot without locking, a refresh replaces the whole snapshot at once.
//! A failed refresh keeps serving the previous snapshot.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::keys::{KeySet, KeySource, KeySourceError, VerificationKey};

/// Well-known key set of the GitHub Actions OIDC provider
pub const DEFAULT_JWKS_URL: &str = "https://token.actions.githubusercontent.com/.well-known/jwks";

/// Refresh behaviour for [`JwksCache`]
#[derive(Debug, Clone)]
pub struct JwksOptions {
    /// Time between background refreshes
    pub refresh_interval: Duration,
    /// Upper bound on a single fetch of the key set document
    pub request_timeout: Duration,
}

/// Shortest interval the background refresh will run at
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

impl JwksOptions {
    /// `refresh_interval`, raised to [`MIN_REFRESH_INTERVAL`] if shorter
    pub fn refresh_period(&self) -> Duration {
        self.refresh_interval.max(MIN_REFRESH_INTERVAL)
    }
}

impl Default for JwksOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Key source backed by a remote JWKS endpoint
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    options: JwksOptions,
    current: ArcSwap<KeySet>,
}

impl JwksCache {
    /// Fetch the key set for the first time
    ///
    /// Unlike later refreshes, a failure here is returned to the caller: a
    /// gateway that cannot obtain any keys cannot authenticate anyone.
    pub async fn fetch(url: impl Into<String>, options: JwksOptions) -> Result<Self, KeySourceError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(KeySourceError::Client)?;

        let keys = Self::download(&client, &url).await?;
        info!(url = %url, keys = keys.len(), "Loaded identity provider key set");

        Ok(Self {
            url,
            client,
            options,
            current: ArcSwap::from_pointee(keys),
        })
    }

    async fn download(client: &reqwest::Client, url: &str) -> Result<KeySet, KeySourceError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|source| KeySourceError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeySourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| KeySourceError::Fetch {
                url: url.to_string(),
                source,
            })?;

        KeySet::from_jwks_json(&body)
    }

    /// Fetch the key set again and swap it in
    ///
    /// Returns the number of keys in the new snapshot. On error the current
    /// snapshot is left untouched.
    pub async fn refresh(&self) -> Result<usize, KeySourceError> {
        let keys = Self::download(&self.client, &self.url).await?;
        let count = keys.len();
        self.current.store(Arc::new(keys));
        debug!(url = %self.url, keys = count, "Refreshed identity provider key set");
        Ok(count)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.current.load_full()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start refreshing in the background every `refresh_interval`
    ///
    /// The first refresh happens one full interval after this call. The task
    /// stops when the returned handle is dropped.
    pub fn spawn_refresh(self: &Arc<Self>) -> RefreshHandle {
        let cache = Arc::clone(self);
        let period = self.options.refresh_period();
        if period != self.options.refresh_interval {
            warn!(
                requested = ?self.options.refresh_interval,
                "Key set refresh interval too short, using {:?}",
                period
            );
        }

        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = cache.refresh().await {
                    warn!(url = %cache.url, "Key set refresh failed, keeping previous keys: {}", e);
                }
            }
        });

        RefreshHandle { task }
    }
}

impl KeySource for JwksCache {
    fn resolve_key(&self, kid: &str) -> Result<Arc<VerificationKey>, KeySourceError> {
        self.current.load().resolve_key(kid)
    }
}

/// Owns the background refresh task of a [`JwksCache`]
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
