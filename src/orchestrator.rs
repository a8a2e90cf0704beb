use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::BackendPreference;
use crate::dispatch::{ResponseOutcome, Tier, TierKind};
use crate::error::GustError;
use crate::request::Request;

/// Longest failure detail kept in the attempt ledger.
const MAX_DETAIL_CHARS: usize = 300;

/// The configured backends. A `None` slot is never attempted.
#[derive(Clone, Default)]
pub struct TierSet {
    pub local: Option<Arc<dyn Tier>>,
    pub out_of_band: Option<Arc<dyn Tier>>,
    pub remote: Option<Arc<dyn Tier>>,
}

impl TierSet {
    pub fn get(&self, kind: TierKind) -> Option<&Arc<dyn Tier>> {
        match kind {
            TierKind::Local => self.local.as_ref(),
            TierKind::OutOfBand => self.out_of_band.as_ref(),
            TierKind::Remote => self.remote.as_ref(),
        }
    }
}

/// Order in which tiers are tried for one request.
///
/// Local is skipped when the preference is cloud-preferred or when the
/// prompt is over the local ceiling. A local-only preference never forces a
/// local call the ceiling says is doomed: the plan is then empty.
pub fn plan_tiers(
    preference: BackendPreference,
    estimated_tokens: usize,
    local_token_ceiling: usize,
) -> Vec<TierKind> {
    let mut plan = Vec::with_capacity(3);
    if preference != BackendPreference::CloudPreferred && estimated_tokens <= local_token_ceiling {
        plan.push(TierKind::Local);
    }
    if preference.allows_fallback() {
        plan.extend([TierKind::OutOfBand, TierKind::Remote]);
    }
    plan
}

/// One entry in the per-request ledger of tier attempts.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub tier: TierKind,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
}

/// Final, normalized result of one orchestrated request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: ResponseOutcome,
    /// Tier that produced `outcome`; None when no tier could be attempted.
    pub tier: Option<TierKind>,
    pub attempts: Vec<Attempt>,
    pub elapsed: Duration,
}

impl Resolution {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn into_result(self) -> Result<String, GustError> {
        match self.tier {
            Some(tier) => self.outcome.into_result(tier),
            None => match self.outcome {
                ResponseOutcome::Success(text) => Ok(text),
                ResponseOutcome::ExternalError(message) => Err(GustError::Config(message)),
                ResponseOutcome::Timeout { elapsed_ms } => Err(GustError::Timeout(elapsed_ms)),
                ResponseOutcome::BackendUnavailable => Err(GustError::Config(
                    "no backend is configured".to_string(),
                )),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    pub local_token_ceiling: usize,
    /// Lowercase phrases that mark out-of-band output as a tool failure.
    pub failure_signatures: Vec<String>,
}

/// Sequences tier attempts Local → OutOfBand → Remote and normalizes the result.
/// Attempts are strictly sequential; the first success ends the request.
pub struct TierOrchestrator {
    tiers: TierSet,
    policy: OrchestratorPolicy,
}

impl TierOrchestrator {
    pub fn new(tiers: TierSet, mut policy: OrchestratorPolicy) -> Self {
        policy.failure_signatures = policy
            .failure_signatures
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { tiers, policy }
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    pub fn policy(&self) -> &OrchestratorPolicy {
        &self.policy
    }

    /// Resolve `req` under `preference`. Errs only with `Cancelled`; every
    /// backend failure is carried in the returned `Resolution`.
    pub async fn resolve(
        &self,
        req: &Request,
        preference: BackendPreference,
        cancel: &CancellationToken,
    ) -> Result<Resolution, GustError> {
        let start = Instant::now();
        let tokens = req.estimated_tokens();
        let plan = plan_tiers(preference, tokens, self.policy.local_token_ceiling);

        tracing::info!(
            preference = preference.as_str(),
            tokens,
            ceiling = self.policy.local_token_ceiling,
            plan = ?plan,
            "resolving request"
        );

        if plan.is_empty() {
            return Ok(Resolution {
                outcome: ResponseOutcome::ExternalError(format!(
                    "the request is too large for the on-device model (about {tokens} tokens, limit {})",
                    self.policy.local_token_ceiling
                )),
                tier: Some(TierKind::Local),
                attempts: Vec::new(),
                elapsed: start.elapsed(),
            });
        }

        let mut attempts = Vec::new();
        let mut last: Option<(TierKind, ResponseOutcome)> = None;

        for kind in plan {
            let Some(tier) = self.tiers.get(kind) else {
                tracing::debug!(tier = %kind, "tier not configured, skipping");
                continue;
            };

            if cancel.is_cancelled() {
                return Err(GustError::Cancelled);
            }

            let tier_start = Instant::now();
            let raw = tier.attempt(req, cancel).await;
            if cancel.is_cancelled() {
                return Err(GustError::Cancelled);
            }
            let outcome = self.classify(kind, raw);

            attempts.push(Attempt {
                tier: kind,
                status: outcome.status(),
                detail: failure_detail(&outcome),
                latency_ms: tier_start.elapsed().as_millis() as u64,
            });

            if outcome.is_success() {
                tracing::info!(tier = %kind, elapsed_ms = start.elapsed().as_millis() as u64, "request resolved");
                return Ok(Resolution {
                    outcome,
                    tier: Some(kind),
                    attempts,
                    elapsed: start.elapsed(),
                });
            }

            tracing::info!(tier = %kind, status = outcome.status(), "tier failed, falling through");
            last = Some((kind, outcome));
        }

        let (tier, outcome) = match last {
            Some((kind, outcome)) => (Some(kind), outcome),
            None => (None, ResponseOutcome::BackendUnavailable),
        };
        Ok(Resolution {
            outcome,
            tier,
            attempts,
            elapsed: start.elapsed(),
        })
    }

    /// Out-of-band tools sometimes write their own error text into the result
    /// slot; such "successes" are failures. Real failures pass through as is.
    fn classify(&self, kind: TierKind, outcome: ResponseOutcome) -> ResponseOutcome {
        match outcome {
            ResponseOutcome::Success(text) if kind == TierKind::OutOfBand => {
                if text.trim().is_empty() {
                    return ResponseOutcome::ExternalError("the external tool returned nothing".to_string());
                }
                match self.failure_signature(&text) {
                    Some(sig) => {
                        tracing::warn!(signature = sig, "out-of-band result matches a failure signature");
                        ResponseOutcome::ExternalError(truncate(text.trim(), MAX_DETAIL_CHARS))
                    }
                    None => ResponseOutcome::Success(text),
                }
            }
            other => other,
        }
    }

    /// First signature found at the start of `text` (case-insensitive).
    fn failure_signature(&self, text: &str) -> Option<&str> {
        let head = text.trim_start().to_lowercase();
        self.policy
            .failure_signatures
            .iter()
            .find(|sig| head.starts_with(sig.as_str()))
            .map(|s| s.as_str())
    }
}

fn failure_detail(outcome: &ResponseOutcome) -> Option<String> {
    match outcome {
        ResponseOutcome::ExternalError(msg) => Some(truncate(msg, MAX_DETAIL_CHARS)),
        ResponseOutcome::Timeout { elapsed_ms } => Some(format!("after {elapsed_ms}ms")),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_under_ceiling_tries_everything_in_order() {
        assert_eq!(
            plan_tiers(BackendPreference::Auto, 100, 4096),
            vec![TierKind::Local, TierKind::OutOfBand, TierKind::Remote]
        );
    }

    #[test]
    fn oversized_content_skips_local() {
        assert_eq!(
            plan_tiers(BackendPreference::Auto, 5000, 4096),
            vec![TierKind::OutOfBand, TierKind::Remote]
        );
    }

    #[test]
    fn cloud_preferred_never_plans_local() {
        assert_eq!(
            plan_tiers(BackendPreference::CloudPreferred, 10, 4096),
            vec![TierKind::OutOfBand, TierKind::Remote]
        );
    }

    #[test]
    fn local_only_does_not_force_a_doomed_call() {
        assert_eq!(plan_tiers(BackendPreference::LocalOnly, 10, 4096), vec![TierKind::Local]);
        assert!(plan_tiers(BackendPreference::LocalOnly, 5000, 4096).is_empty());
    }

    #[test]
    fn ceiling_is_inclusive() {
        assert_eq!(plan_tiers(BackendPreference::Auto, 4096, 4096)[0], TierKind::Local);
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
