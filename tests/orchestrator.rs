//! Tier ordering, preference handling, and fallthrough.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use gust::config::{BackendPreference, BridgeConfig, CommandSpec, default_failure_signatures};
use gust::dispatch::async_poll::PollSettings;
use gust::dispatch::cli::OutOfBandBridge;
use gust::dispatch::side_channel::ProseHeuristic;
use gust::dispatch::{ResponseOutcome, Tier, TierKind};
use gust::error::GustError;
use gust::orchestrator::{OrchestratorPolicy, TierOrchestrator, TierSet};
use gust::request::{Capability, Request};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

/// Returns a fixed outcome and counts how often it was asked.
struct FakeTier {
    kind: TierKind,
    outcome: ResponseOutcome,
    calls: AtomicUsize,
}

impl FakeTier {
    fn new(kind: TierKind, outcome: ResponseOutcome) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tier for FakeTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    fn availability(&self) -> Option<bool> {
        Some(true)
    }

    fn attempt<'a>(
        &'a self,
        _req: &'a Request,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ResponseOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome.clone();
        Box::pin(async move { outcome })
    }
}

fn policy() -> OrchestratorPolicy {
    OrchestratorPolicy {
        local_token_ceiling: 4096,
        failure_signatures: default_failure_signatures(),
    }
}

fn orchestrator(
    local: &Arc<FakeTier>,
    oob: &Arc<FakeTier>,
    remote: &Arc<FakeTier>,
) -> TierOrchestrator {
    TierOrchestrator::new(
        TierSet {
            local: Some(local.clone() as Arc<dyn Tier>),
            out_of_band: Some(oob.clone() as Arc<dyn Tier>),
            remote: Some(remote.clone() as Arc<dyn Tier>),
        },
        policy(),
    )
}

fn success(text: &str) -> ResponseOutcome {
    ResponseOutcome::Success(text.to_string())
}

fn small_request() -> Request {
    Request::new("What is the capital of France?", Capability::AnswerQuestion)
}

fn oversized_request() -> Request {
    Request::new("Summarize this page.", Capability::Summarize)
        .with_context("lorem ipsum dolor sit amet ".repeat(1000))
}

// ---------------------------------------------------------------------------
// End to end with a real out-of-band tool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_falls_back_from_local_to_direct_capture() {
    let dir = std::env::temp_dir().join(format!("gust-orch-capture-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let local = FakeTier::new(TierKind::Local, ResponseOutcome::BackendUnavailable);
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let bridge = OutOfBandBridge::new(
        BridgeConfig {
            enabled: true,
            tool_timeout_ms: 10_000,
            transient_dir: Some(dir.clone()),
            capture: Some(CommandSpec::new(
                "/bin/sh",
                &["-c", r#"printf 'Paris is the capital of France.' > "$1""#, "sh", "{output}"],
            )),
            launch: None,
            side_channel: None,
        },
        Duration::from_secs(10),
        PollSettings {
            interval: Duration::from_millis(50),
            max_checks: 10,
            deadline: Duration::from_secs(2),
        },
        None,
        Arc::new(ProseHeuristic { min_chars: 20 }),
    );

    let orch = TierOrchestrator::new(
        TierSet {
            local: Some(local.clone() as Arc<dyn Tier>),
            out_of_band: Some(Arc::new(bridge) as Arc<dyn Tier>),
            remote: Some(remote.clone() as Arc<dyn Tier>),
        },
        policy(),
    );

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );

    assert_eq!(resolution.tier, Some(TierKind::OutOfBand));
    assert_eq!(local.calls(), 1);
    assert_eq!(remote.calls(), 0);
    assert_eq!(resolution.attempts.len(), 2);
    assert_eq!(resolution.attempts[0].tier, TierKind::Local);
    assert_eq!(resolution.attempts[0].status, "unavailable");
    // The local failure is in the ledger only; the caller sees the answer.
    assert_eq!(
        assert_ok!(resolution.into_result()),
        "Paris is the capital of France."
    );
}

// ---------------------------------------------------------------------------
// Preference and ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_success_short_circuits() {
    let local = FakeTier::new(TierKind::Local, success("local answer"));
    let oob = FakeTier::new(TierKind::OutOfBand, success("oob answer"));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.outcome, success("local answer"));
    assert_eq!((local.calls(), oob.calls(), remote.calls()), (1, 0, 0));
}

#[tokio::test]
async fn cloud_preferred_never_invokes_local() {
    let local = FakeTier::new(TierKind::Local, success("local answer"));
    let oob = FakeTier::new(TierKind::OutOfBand, success("The external assistant answered."));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(
            &small_request(),
            BackendPreference::CloudPreferred,
            &CancellationToken::new()
        )
        .await
    );
    assert_eq!(resolution.tier, Some(TierKind::OutOfBand));
    assert_eq!(local.calls(), 0);
}

#[tokio::test]
async fn oversized_content_skips_local() {
    let local = FakeTier::new(TierKind::Local, success("local answer"));
    let oob = FakeTier::new(TierKind::OutOfBand, success("A summary of the page."));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let req = oversized_request();
    assert!(req.estimated_tokens() > 4096);
    let resolution = assert_ok!(
        orch.resolve(&req, BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::OutOfBand));
    assert_eq!(local.calls(), 0);
}

#[tokio::test]
async fn local_only_returns_local_failure_without_fallback() {
    let local = FakeTier::new(
        TierKind::Local,
        ResponseOutcome::ExternalError("model crashed".to_string()),
    );
    let oob = FakeTier::new(TierKind::OutOfBand, success("oob answer"));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::LocalOnly, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::Local));
    assert_eq!(
        resolution.outcome,
        ResponseOutcome::ExternalError("model crashed".to_string())
    );
    assert_eq!((oob.calls(), remote.calls()), (0, 0));
}

#[tokio::test]
async fn local_only_oversized_makes_no_call() {
    let local = FakeTier::new(TierKind::Local, success("local answer"));
    let oob = FakeTier::new(TierKind::OutOfBand, success("oob answer"));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&oversized_request(), BackendPreference::LocalOnly, &CancellationToken::new())
            .await
    );
    assert!(matches!(resolution.outcome, ResponseOutcome::ExternalError(ref m) if m.contains("too large")));
    assert_eq!((local.calls(), oob.calls(), remote.calls()), (0, 0, 0));
}

// ---------------------------------------------------------------------------
// Fallthrough and final outcome
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oob_text_matching_failure_signature_falls_through() {
    let local = FakeTier::new(TierKind::Local, ResponseOutcome::BackendUnavailable);
    let oob = FakeTier::new(
        TierKind::OutOfBand,
        success("Error: The shortcut could not be run because it was not found."),
    );
    let remote = FakeTier::new(TierKind::Remote, success("Paris."));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::Remote));
    assert_eq!(resolution.outcome, success("Paris."));
    assert_eq!(resolution.attempts[1].status, "error");
}

#[tokio::test]
async fn oob_error_passes_through_unchanged_and_falls_through() {
    let local = FakeTier::new(TierKind::Local, ResponseOutcome::BackendUnavailable);
    let oob = FakeTier::new(
        TierKind::OutOfBand,
        ResponseOutcome::ExternalError("shortcut not found: Ask Assistant".to_string()),
    );
    let remote = FakeTier::new(TierKind::Remote, success("Paris."));
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::Remote));
    assert_eq!(resolution.attempts[1].tier, TierKind::OutOfBand);
    assert_eq!(
        resolution.attempts[1].detail.as_deref(),
        Some("shortcut not found: Ask Assistant")
    );
}

#[tokio::test]
async fn last_failure_is_the_only_outcome() {
    let local = FakeTier::new(TierKind::Local, ResponseOutcome::BackendUnavailable);
    let oob = FakeTier::new(TierKind::OutOfBand, ResponseOutcome::Timeout { elapsed_ms: 120_000 });
    let remote = FakeTier::new(
        TierKind::Remote,
        ResponseOutcome::ExternalError("rate limited, try again shortly".to_string()),
    );
    let orch = orchestrator(&local, &oob, &remote);

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::Remote));
    assert_eq!(resolution.attempts.len(), 3);
    assert_eq!((local.calls(), oob.calls(), remote.calls()), (1, 1, 1));

    let err = resolution.into_result().unwrap_err();
    assert!(err.user_message().contains("rate limited"));
}

#[tokio::test]
async fn unconfigured_tiers_are_skipped() {
    let oob = FakeTier::new(TierKind::OutOfBand, ResponseOutcome::BackendUnavailable);
    let orch = TierOrchestrator::new(
        TierSet {
            local: None,
            out_of_band: Some(oob.clone() as Arc<dyn Tier>),
            remote: None,
        },
        policy(),
    );

    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, Some(TierKind::OutOfBand));
    assert_eq!(resolution.outcome, ResponseOutcome::BackendUnavailable);
    assert_eq!(oob.calls(), 1);
}

#[tokio::test]
async fn nothing_configured_is_unavailable() {
    let orch = TierOrchestrator::new(TierSet::default(), policy());
    let resolution = assert_ok!(
        orch.resolve(&small_request(), BackendPreference::Auto, &CancellationToken::new())
            .await
    );
    assert_eq!(resolution.tier, None);
    assert_eq!(resolution.outcome, ResponseOutcome::BackendUnavailable);
    assert!(resolution.attempts.is_empty());
}

#[tokio::test]
async fn cancelled_before_start_makes_no_call() {
    let local = FakeTier::new(TierKind::Local, success("local answer"));
    let oob = FakeTier::new(TierKind::OutOfBand, success("oob answer"));
    let remote = FakeTier::new(TierKind::Remote, success("remote answer"));
    let orch = orchestrator(&local, &oob, &remote);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orch
        .resolve(&small_request(), BackendPreference::Auto, &cancel)
        .await;
    assert!(matches!(result, Err(GustError::Cancelled)));
    assert_eq!(local.calls(), 0);
}
