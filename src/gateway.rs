use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{BackendPreference, Config};
use crate::dispatch::cli::OutOfBandBridge;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::local::LocalInferenceAdapter;
use crate::dispatch::remote::RemoteApiAdapter;
use crate::dispatch::side_channel::{CommandSideChannel, ProseHeuristic, SideChannel};
use crate::dispatch::{BackendTier, Tier, TierKind};
use crate::error::GustError;
use crate::gate::RequestGate;
use crate::orchestrator::{OrchestratorPolicy, Resolution, TierOrchestrator, TierSet};
use crate::request::Request;
use crate::stream::StreamEmulator;

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub tier: TierKind,
    pub configured: bool,
    /// Cached availability; None until first probed.
    pub available: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub preference: BackendPreference,
    pub local_token_ceiling: usize,
    pub busy: bool,
    /// Id of the request holding the gate, if any.
    pub active_request_id: Option<u64>,
    pub active_for_ms: Option<u64>,
    pub backends: Vec<BackendStatus>,
}

/// Caller-facing entry point: gate → orchestrator → (optional) stream emulation.
pub struct Gateway {
    gate: RequestGate,
    orchestrator: TierOrchestrator,
    preference: RwLock<BackendPreference>,
    pacing: Duration,
}

impl Gateway {
    pub fn new(orchestrator: TierOrchestrator, preference: BackendPreference, pacing: Duration) -> Self {
        Self {
            gate: RequestGate::new(),
            orchestrator,
            preference: RwLock::new(preference),
            pacing,
        }
    }

    /// Wire up every configured backend from `config`.
    pub fn from_config(config: &Config) -> Self {
        let http = Arc::new(HttpDispatch::new());

        let local: Option<Arc<dyn Tier>> = if config.local.enabled {
            Some(Arc::new(BackendTier::new(LocalInferenceAdapter::new(
                http.clone(),
                config.local.clone(),
            ))) as Arc<dyn Tier>)
        } else {
            None
        };

        let out_of_band: Option<Arc<dyn Tier>> = if config.bridge.enabled {
            let channel = config
                .bridge
                .side_channel
                .clone()
                .map(|spec| Arc::new(CommandSideChannel::new(spec)) as Arc<dyn SideChannel>);
            let bridge = OutOfBandBridge::new(
                config.bridge.clone(),
                config.tool_timeout(),
                config.poll_settings(),
                channel,
                Arc::new(ProseHeuristic {
                    min_chars: config.poll.min_result_chars,
                }),
            );
            if !bridge.is_configured() {
                tracing::warn!("out-of-band bridge enabled but neither capture nor launch+side channel is usable");
            }
            Some(Arc::new(bridge) as Arc<dyn Tier>)
        } else {
            None
        };

        // Without a key the remote tier would only ever report unavailable and
        // hide the out-of-band failure; leave it out instead.
        let remote: Option<Arc<dyn Tier>> = if config.remote.api_key.is_some() {
            Some(Arc::new(BackendTier::new(RemoteApiAdapter::new(
                http,
                config.remote.clone(),
            ))) as Arc<dyn Tier>)
        } else {
            None
        };

        let orchestrator = TierOrchestrator::new(
            TierSet {
                local,
                out_of_band,
                remote,
            },
            OrchestratorPolicy {
                local_token_ceiling: config.local_token_ceiling,
                failure_signatures: config.failure_signatures.clone(),
            },
        );

        Self::new(orchestrator, config.preference, config.stream_pacing())
    }

    pub fn preference(&self) -> BackendPreference {
        *self.preference.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes effect from the next request; an in-flight one keeps the value it read.
    pub fn set_preference(&self, preference: BackendPreference) {
        *self.preference.write().unwrap_or_else(PoisonError::into_inner) = preference;
        tracing::info!(preference = preference.as_str(), "backend preference changed");
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Cancel the in-flight request. Returns false if nothing was running.
    pub fn cancel(&self) -> bool {
        self.gate.cancel_active()
    }

    pub async fn resolve(&self, req: &Request) -> Result<Resolution, GustError> {
        self.resolve_with(req, None, &CancellationToken::new()).await
    }

    /// Resolve under the gate. Errs with `Busy` when another request holds it
    /// and with `Cancelled` when `cancel` (or `Gateway::cancel`) fires first.
    /// Backend failures are reported in the `Resolution`, not as `Err`.
    pub async fn resolve_with(
        &self,
        req: &Request,
        preference: Option<BackendPreference>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, GustError> {
        let preference = preference.unwrap_or_else(|| self.preference());
        self.gate
            .submit(Some(cancel), |request_id, token| {
                let span = tracing::info_span!("request", request_id);
                async move {
                    let result = self.orchestrator.resolve(req, preference, &token).await;
                    if let Err(ref e) = result {
                        tracing::info!("request ended: {e}");
                    }
                    result
                }
                .instrument(span)
            })
            .await?
    }

    /// Resolve, then replay the answer as a paced stream. Any failure (gate,
    /// cancellation, or the final tier's error) is returned before streaming.
    pub async fn resolve_streaming(
        &self,
        req: &Request,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, String>, GustError> {
        let text = self.resolve_with(req, None, &cancel).await?.into_result()?;
        Ok(StreamEmulator::new(self.pacing).emit(text, cancel))
    }

    pub fn backends(&self) -> BackendReport {
        let tiers = self.orchestrator.tiers();
        let backends = [TierKind::Local, TierKind::OutOfBand, TierKind::Remote]
            .into_iter()
            .map(|kind| {
                let tier = tiers.get(kind);
                BackendStatus {
                    tier: kind,
                    configured: tier.is_some(),
                    available: tier.and_then(|t| t.availability()),
                }
            })
            .collect();

        let active_request_id = self.gate.active_request_id();
        BackendReport {
            preference: self.preference(),
            local_token_ceiling: self.orchestrator.policy().local_token_ceiling,
            busy: active_request_id.is_some(),
            active_request_id,
            active_for_ms: self.gate.active_for().map(|d| d.as_millis() as u64),
            backends,
        }
    }
}
