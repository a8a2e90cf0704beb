use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::config::LocalConfig;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{InferenceBackend, TierKind};
use crate::error::GustError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// On-device inference through a local OpenAI-compatible server.
/// Fails fast with `BackendUnavailable` when the probe says it is not running.
pub struct LocalInferenceAdapter {
    http: Arc<HttpDispatch>,
    config: LocalConfig,
    available: OnceCell<bool>,
}

impl LocalInferenceAdapter {
    pub fn new(http: Arc<HttpDispatch>, config: LocalConfig) -> Self {
        Self {
            http,
            config,
            available: OnceCell::new(),
        }
    }

    async fn probe(&self) -> bool {
        if !self.config.enabled {
            tracing::info!("local backend disabled in config");
            return false;
        }
        let available = match self.config.probe_url.as_deref() {
            Some(url) => self.http.probe(url, PROBE_TIMEOUT).await,
            // Without a probe URL, assume present and let the first call decide.
            None => true,
        };
        tracing::info!(available, "local backend probed");
        available
    }
}

impl InferenceBackend for LocalInferenceAdapter {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { *self.available.get_or_init(|| self.probe()).await })
    }

    fn cached_availability(&self) -> Option<bool> {
        self.available.get().copied()
    }

    fn infer<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GustError>> {
        Box::pin(async move {
            if !self.is_available().await {
                return Err(GustError::BackendUnavailable {
                    backend: TierKind::Local,
                });
            }
            self.http
                .complete(
                    TierKind::Local,
                    &self.config.base_url,
                    None,
                    &self.config.model,
                    prompt,
                    Duration::from_millis(self.config.timeout_ms),
                )
                .await
        })
    }
}
