pub mod async_poll;
pub mod cli;
pub mod http;
pub mod local;
pub mod remote;
pub mod side_channel;

use std::fmt;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::GustError;
use crate::request::Request;

/// One candidate backend, attempted in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Local,
    OutOfBand,
    Remote,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::OutOfBand => "out_of_band",
            Self::Remote => "remote",
        }
    }

    /// Human-readable name for user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "on-device",
            Self::OutOfBand => "external assistant",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized result every tier produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Success(String),
    BackendUnavailable,
    Timeout { elapsed_ms: u64 },
    /// Plain-text failure detail, already safe to show to a user.
    ExternalError(String),
}

impl ResponseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Short status word for logs and the attempt ledger.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::BackendUnavailable => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::ExternalError(_) => "error",
        }
    }

    /// Convert into a caller-facing result, attributing failures to `tier`.
    pub fn into_result(self, tier: TierKind) -> Result<String, GustError> {
        match self {
            Self::Success(text) => Ok(text),
            Self::BackendUnavailable => Err(GustError::BackendUnavailable { backend: tier }),
            Self::Timeout { elapsed_ms } => Err(GustError::Timeout(elapsed_ms)),
            Self::ExternalError(message) => Err(GustError::Inference {
                backend: tier,
                message,
            }),
        }
    }
}

impl From<GustError> for ResponseOutcome {
    fn from(err: GustError) -> Self {
        match err {
            GustError::BackendUnavailable { .. } => Self::BackendUnavailable,
            GustError::Timeout(elapsed_ms) => Self::Timeout { elapsed_ms },
            GustError::Inference { message, .. } => Self::ExternalError(message),
            other => Self::ExternalError(other.user_message()),
        }
    }
}

impl From<Result<String, GustError>> for ResponseOutcome {
    fn from(result: Result<String, GustError>) -> Self {
        match result {
            Ok(text) => Self::Success(text),
            Err(e) => e.into(),
        }
    }
}

/// A backend with a plain request/response call.
/// No retries inside; fallback belongs to the orchestrator.
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Capability check, probed at most once per process and cached.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// The cached probe result, or None if never probed.
    fn cached_availability(&self) -> Option<bool>;

    fn infer<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GustError>>;
}

/// One step in the fallback chain: `Request -> ResponseOutcome`.
pub trait Tier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Cached availability if known. None means "not probed yet".
    fn availability(&self) -> Option<bool>;

    fn attempt<'a>(
        &'a self,
        req: &'a Request,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ResponseOutcome>;
}

/// Adapts any `InferenceBackend` into a `Tier`.
pub struct BackendTier<B> {
    backend: B,
}

impl<B: InferenceBackend> BackendTier<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: InferenceBackend> Tier for BackendTier<B> {
    fn kind(&self) -> TierKind {
        self.backend.kind()
    }

    fn availability(&self) -> Option<bool> {
        self.backend.cached_availability()
    }

    fn attempt<'a>(
        &'a self,
        req: &'a Request,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ResponseOutcome> {
        Box::pin(async move {
            let prompt = req.prompt();
            // The first availability probe can take seconds; cancel covers it too.
            let run = async {
                if !self.backend.is_available().await {
                    return ResponseOutcome::BackendUnavailable;
                }
                ResponseOutcome::from(self.backend.infer(&prompt).await)
            };
            tokio::select! {
                _ = cancel.cancelled() => GustError::Cancelled.into(),
                outcome = run => outcome,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::request::Capability;

    /// Backend whose availability probe hangs for a while.
    struct SlowProbe;

    impl InferenceBackend for SlowProbe {
        fn kind(&self) -> TierKind {
            TierKind::Local
        }

        fn is_available(&self) -> BoxFuture<'_, bool> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                true
            })
        }

        fn cached_availability(&self) -> Option<bool> {
            None
        }

        fn infer<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, Result<String, GustError>> {
            Box::pin(async { Ok("late answer".to_string()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_availability_probe_returns_promptly() {
        let tier = BackendTier::new(SlowProbe);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let req = Request::new("q", Capability::RawPrompt);
        let outcome = tier.attempt(&req, &cancel).await;

        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(
            outcome,
            ResponseOutcome::ExternalError(GustError::Cancelled.user_message())
        );
    }

    #[test]
    fn outcome_round_trips_failures_to_errors() {
        let err = ResponseOutcome::Timeout { elapsed_ms: 120_000 }
            .into_result(TierKind::OutOfBand)
            .unwrap_err();
        assert!(matches!(err, GustError::Timeout(120_000)));

        let err = ResponseOutcome::BackendUnavailable
            .into_result(TierKind::Local)
            .unwrap_err();
        assert!(matches!(
            err,
            GustError::BackendUnavailable {
                backend: TierKind::Local
            }
        ));
    }

    #[test]
    fn errors_normalize_to_plain_text() {
        let outcome: ResponseOutcome = GustError::ToolExitError {
            code: 2,
            stderr: "shortcut not found".into(),
        }
        .into();
        match outcome {
            ResponseOutcome::ExternalError(msg) => assert!(msg.contains("shortcut not found")),
            other => panic!("expected ExternalError, got {other:?}"),
        }
    }
}
