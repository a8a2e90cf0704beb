use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::config::RemoteConfig;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{InferenceBackend, TierKind};
use crate::error::GustError;

/// Last-resort network backend. Available whenever an API key is configured.
pub struct RemoteApiAdapter {
    http: Arc<HttpDispatch>,
    config: RemoteConfig,
}

impl RemoteApiAdapter {
    pub fn new(http: Arc<HttpDispatch>, config: RemoteConfig) -> Self {
        Self { http, config }
    }

    fn api_key(&self) -> Option<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }
}

impl InferenceBackend for RemoteApiAdapter {
    fn kind(&self) -> TierKind {
        TierKind::Remote
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        let available = self.api_key().is_some();
        Box::pin(async move { available })
    }

    fn cached_availability(&self) -> Option<bool> {
        Some(self.api_key().is_some())
    }

    fn infer<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GustError>> {
        Box::pin(async move {
            let key = self.api_key().ok_or(GustError::BackendUnavailable {
                backend: TierKind::Remote,
            })?;
            self.http
                .complete(
                    TierKind::Remote,
                    &self.config.base_url,
                    Some(key),
                    &self.config.model,
                    prompt,
                    Duration::from_millis(self.config.timeout_ms),
                )
                .await
        })
    }
}
