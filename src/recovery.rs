//! Session watchdog.
//!
//! One supervisor per active session polls the negotiator phase on a short
//! cadence and owns everything time-based about staying alive: spacing out
//! recovery attempts, bounding how long a vanished partner is waited for, and
//! heartbeating the server-side session so it is not reaped. The negotiator
//! itself never sleeps; all retry pacing lives here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::queue::MatchmakingBackend;
use crate::session::{NegotiatorHandle, SessionPhase};
use crate::signaling::{LinkStatus, SignalingClient};

pub struct RecoverySupervisor {
    backgrounded: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RecoverySupervisor {
    pub fn spawn(
        config: &Config,
        handle: NegotiatorHandle,
        signaling: Arc<SignalingClient>,
        backend: Arc<dyn MatchmakingBackend>,
    ) -> Self {
        let backgrounded = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_watchdog(WatchdogArgs {
            watchdog_interval: config.watchdog_interval,
            retry_delay: config.retry_delay,
            partner_wait: config.partner_wait,
            negotiation_timeout: config.negotiation_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_interval_hidden: config.heartbeat_interval_hidden,
            handle,
            signaling,
            backend,
            backgrounded: backgrounded.clone(),
        }));
        Self {
            backgrounded,
            task: Some(task),
        }
    }

    /// Switch the heartbeat to the faster hidden cadence while the consuming
    /// UI is backgrounded, so the server keeps the session alive even though
    /// the client may be throttled.
    pub fn set_backgrounded(&self, hidden: bool) {
        self.backgrounded.store(hidden, Ordering::SeqCst);
        tracing::debug!(target: "matchwire::recovery", hidden, "visibility changed");
    }

    pub fn is_backgrounded(&self) -> bool {
        self.backgrounded.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchdogArgs {
    watchdog_interval: Duration,
    retry_delay: Duration,
    partner_wait: Duration,
    negotiation_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_interval_hidden: Duration,
    handle: NegotiatorHandle,
    signaling: Arc<SignalingClient>,
    backend: Arc<dyn MatchmakingBackend>,
    backgrounded: Arc<AtomicBool>,
}

async fn run_watchdog(args: WatchdogArgs) {
    let session_id = args.handle.session().session_id.clone();
    let mut ticker = tokio::time::interval(args.watchdog_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut recovering_since: Option<Instant> = None;
    let mut last_recover: Option<Instant> = None;
    let mut last_heartbeat = Instant::now();
    let mut last_phase = args.handle.phase();
    let mut phase_since = Instant::now();

    loop {
        ticker.tick().await;

        let phase = args.handle.phase();
        if phase != last_phase {
            last_phase = phase;
            phase_since = Instant::now();
        }
        if phase.is_terminal() {
            tracing::debug!(
                target: "matchwire::recovery",
                session_id = %session_id,
                ?phase,
                "session over, watchdog stopping"
            );
            return;
        }

        // A rejected credential never comes back; end the session.
        if args.signaling.status() == LinkStatus::AuthFailed {
            args.handle.fail("relay credential rejected");
            return;
        }

        match phase {
            SessionPhase::Recovering => {
                let now = Instant::now();
                let since = *recovering_since.get_or_insert(now);
                if now.duration_since(since) >= args.partner_wait {
                    tracing::info!(
                        target: "matchwire::recovery",
                        session_id = %session_id,
                        waited_ms = now.duration_since(since).as_millis() as u64,
                        "partner did not return in time"
                    );
                    args.handle.fail("partner did not return in time");
                    continue;
                }
                // No relay channel means nothing to signal over; hold the
                // attempt until the transport pump reconnects.
                if !args.signaling.is_connected() {
                    continue;
                }
                let due = last_recover
                    .map_or(true, |t| now.duration_since(t) >= args.retry_delay);
                if due {
                    last_recover = Some(now);
                    tracing::debug!(
                        target: "matchwire::recovery",
                        session_id = %session_id,
                        attempt = args.handle.attempts() + 1,
                        "issuing recovery attempt"
                    );
                    args.handle.recover();
                }
            }
            SessionPhase::Connected => {
                recovering_since = None;
                last_recover = None;
                let cadence = if args.backgrounded.load(Ordering::SeqCst) {
                    args.heartbeat_interval_hidden
                } else {
                    args.heartbeat_interval
                };
                if last_heartbeat.elapsed() >= cadence {
                    last_heartbeat = Instant::now();
                    if let Err(err) = args.backend.heartbeat(&session_id).await {
                        tracing::warn!(
                            target: "matchwire::recovery",
                            session_id = %session_id,
                            error = %err,
                            "session heartbeat failed"
                        );
                    }
                }
            }
            SessionPhase::OfferPending
            | SessionPhase::AwaitingAnswer
            | SessionPhase::Answering
            | SessionPhase::Connecting => {
                recovering_since = None;
                // An attempt the partner never answers must not sit forever.
                if phase_since.elapsed() >= args.negotiation_timeout {
                    tracing::info!(
                        target: "matchwire::recovery",
                        session_id = %session_id,
                        ?phase,
                        "negotiation attempt stalled, retrying"
                    );
                    phase_since = Instant::now();
                    last_recover = Some(Instant::now());
                    args.handle.recover();
                }
            }
            _ => {
                recovering_since = None;
            }
        }
    }
}
