use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::side_channel::{ResultValidator, SideChannel};
use crate::error::GustError;

/// Timing for one side-channel watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Poll count after which the watch resolves `Timeout`.
    pub max_checks: u32,
    /// Wall-clock deadline, independent of the poll count.
    pub deadline: Duration,
}

/// Which timer delivered the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    Poll,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResolution {
    /// The channel changed to content the validator accepted.
    Found(String),
    Timeout,
}

/// What the waiter receives, exactly once per session.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub resolution: PollResolution,
    pub resolver: Resolver,
    /// Channel reads started before resolution.
    pub checks: u32,
    /// Reads that saw changed content the validator rejected.
    pub rejected: u32,
    pub elapsed: Duration,
}

/// State shared by the poll timer and the deadline timer of one watch.
///
/// Both timers call [`PollSession::resolve`]; a compare-and-set on `resolved`
/// lets only the first through. The winner stops both timers before the
/// waiter is notified, so a new request can start as soon as it hears back.
pub struct PollSession {
    baseline: String,
    settings: PollSettings,
    started: Instant,
    checks: AtomicU32,
    rejected: AtomicU32,
    resolved: AtomicBool,
    stop: CancellationToken,
    waiter: Mutex<Option<oneshot::Sender<PollReport>>>,
}

impl PollSession {
    pub fn new(baseline: String, settings: PollSettings) -> (Arc<Self>, oneshot::Receiver<PollReport>) {
        let (tx, rx) = oneshot::channel();
        let session = Arc::new(Self {
            baseline,
            settings,
            started: Instant::now(),
            checks: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            resolved: AtomicBool::new(false),
            stop: CancellationToken::new(),
            waiter: Mutex::new(Some(tx)),
        });
        (session, rx)
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// True once both timers have been told to stop.
    pub fn is_torn_down(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn record_check(&self) -> u32 {
        self.checks.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn differs_from_baseline(&self, content: &str) -> bool {
        content.trim_end() != self.baseline.trim_end()
    }

    /// Deliver `resolution` if nobody has yet. Returns false (and does
    /// nothing) for every call after the first.
    pub fn resolve(&self, resolution: PollResolution, resolver: Resolver) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.stop.cancel();

        let report = PollReport {
            resolution,
            resolver,
            checks: self.checks(),
            rejected: self.rejected.load(Ordering::Acquire),
            elapsed: self.started.elapsed(),
        };
        tracing::debug!(
            resolver = ?report.resolver,
            checks = report.checks,
            rejected = report.rejected,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "poll session resolved"
        );

        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = waiter {
            let _ = tx.send(report);
        }
        true
    }

    /// Stop both timers without delivering anything. Used when the caller
    /// cancels or drops the watch. No-op after a resolution.
    pub fn abandon(&self) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.stop.cancel();
        self.waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }
}

/// Aborts both timer tasks when the watch ends on any path, including drop.
struct TimerGuard {
    session: Arc<PollSession>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.session.abandon();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Watch `channel` until it changes from `baseline` to something `validator`
/// accepts, the poll count runs out, or the deadline passes. Returns
/// `Cancelled` if `cancel` fires first; the timers are stopped either way.
pub async fn watch(
    channel: Arc<dyn SideChannel>,
    validator: Arc<dyn ResultValidator>,
    baseline: String,
    settings: PollSettings,
    cancel: &CancellationToken,
) -> Result<PollReport, GustError> {
    let (session, rx) = PollSession::new(baseline, settings);

    let _timers = TimerGuard {
        session: session.clone(),
        handles: vec![
            tokio::spawn(poll_loop(session.clone(), channel, validator)),
            tokio::spawn(deadline_timer(session.clone())),
        ],
    };

    tokio::select! {
        report = rx => report.map_err(|_| GustError::Cancelled),
        _ = cancel.cancelled() => {
            session.abandon();
            tracing::info!(checks = session.checks(), "side-channel watch cancelled");
            Err(GustError::Cancelled)
        }
    }
}

async fn poll_loop(
    session: Arc<PollSession>,
    channel: Arc<dyn SideChannel>,
    validator: Arc<dyn ResultValidator>,
) {
    let interval = session.settings.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let check = session.record_check();
        let read = tokio::select! {
            _ = session.stop.cancelled() => return,
            read = channel.read() => read,
        };

        // The deadline may have won while this read was in flight.
        if session.is_resolved() {
            return;
        }

        match read {
            Ok(content) if session.differs_from_baseline(&content) => {
                if validator.accepts(&content) {
                    session.resolve(
                        PollResolution::Found(content.trim().to_string()),
                        Resolver::Poll,
                    );
                    return;
                }
                session.rejected.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(
                    check,
                    len = content.len(),
                    "side channel changed but does not look like a response"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(check, "side channel read failed: {e}"),
        }

        if check >= session.settings.max_checks {
            session.resolve(PollResolution::Timeout, Resolver::Poll);
            return;
        }
    }
}

async fn deadline_timer(session: Arc<PollSession>) {
    tokio::select! {
        _ = session.stop.cancelled() => {}
        _ = tokio::time::sleep(session.settings.deadline) => {
            if session.resolve(PollResolution::Timeout, Resolver::Deadline) {
                tracing::info!(checks = session.checks(), "side-channel deadline reached");
            }
        }
    }
}
