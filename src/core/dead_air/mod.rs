//! Dead-air monitoring.
//!
//! One task per call polls the shared call state. While nobody is speaking,
//! no audio is playing and no webhook is running, the silence clock runs;
//! once it passes the threshold the monitor asks the session to check in,
//! and after the last allowed check-in it asks the session to hang up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::coordinator::CallStateHandle;
use crate::core::errors::report_degraded;
use crate::core::session::epoch_ms;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeadAirConfig {
    pub poll_interval_ms: u64,
    pub silence_threshold_ms: u64,
    /// Threshold used after the caller asked the agent to hold on.
    pub hold_threshold_ms: u64,
    pub max_check_ins: u32,
    /// Spoken in turn; the last one repeats if there are more check-ins
    /// than messages.
    pub check_in_messages: Vec<String>,
    pub goodbye_message: String,
}

impl Default for DeadAirConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            silence_threshold_ms: 8000,
            hold_threshold_ms: 30_000,
            max_check_ins: 2,
            check_in_messages: vec![
                "Are you still there?".to_string(),
                "Hello? I'm still here if you need me.".to_string(),
            ],
            goodbye_message: "I haven't heard from you, so I'll end the call now. Goodbye!"
                .to_string(),
        }
    }
}

impl DeadAirConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn hold_threshold(&self) -> Duration {
        Duration::from_millis(self.hold_threshold_ms)
    }

    /// Message for the 1-based check-in `attempt`.
    pub fn check_in_message(&self, attempt: u32) -> String {
        let last = self.check_in_messages.len().saturating_sub(1);
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.check_in_messages
            .get(index)
            .cloned()
            .unwrap_or_else(|| "Are you still there?".to_string())
    }
}

/// What the session should do about the silence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadAirAction {
    CheckIn { attempt: u32, message: String },
    Terminate { message: String },
}

/// Counters the session and the monitor share.
#[derive(Debug, Default)]
pub struct DeadAirState {
    check_ins: AtomicU32,
    holding: AtomicBool,
    resets: AtomicU64,
    /// A turn is evaluating or generating on this worker.
    turn_active: AtomicBool,
}

impl DeadAirState {
    pub fn check_ins(&self) -> u32 {
        self.check_ins.load(Ordering::Acquire)
    }

    pub fn holding(&self) -> bool {
        self.holding.load(Ordering::Acquire)
    }

    pub fn set_holding(&self, holding: bool) {
        self.holding.store(holding, Ordering::Release);
    }

    /// The caller genuinely spoke: a new silence period starts from scratch.
    pub fn reset(&self) {
        self.check_ins.store(0, Ordering::Release);
        self.holding.store(false, Ordering::Release);
        self.resets.fetch_add(1, Ordering::AcqRel);
    }

    pub fn turn_active(&self) -> bool {
        self.turn_active.load(Ordering::Acquire)
    }

    pub fn set_turn_active(&self, active: bool) {
        self.turn_active.store(active, Ordering::Release);
    }

    fn resets(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }
}

pub struct DeadAirMonitor {
    shared: CallStateHandle,
    state: Arc<DeadAirState>,
    config: DeadAirConfig,
    /// Units this worker's audio pipeline still has in flight.
    local_audio: Option<watch::Receiver<usize>>,
}

impl DeadAirMonitor {
    pub fn new(shared: CallStateHandle, state: Arc<DeadAirState>, config: DeadAirConfig) -> Self {
        Self {
            shared,
            state,
            config,
            local_audio: None,
        }
    }

    /// Stay disarmed while local audio is in flight, whatever the shared
    /// store says or fails to say.
    pub fn with_local_audio(mut self, outstanding: watch::Receiver<usize>) -> Self {
        self.local_audio = Some(outstanding);
        self
    }

    fn locally_busy(&self) -> bool {
        self.state.turn_active()
            || self
                .local_audio
                .as_ref()
                .is_some_and(|outstanding| *outstanding.borrow() > 0)
    }

    /// Poll until cancelled, the session stops listening, or the call is
    /// told to terminate.
    pub async fn run(self, actions: mpsc::Sender<DeadAirAction>, cancel: CancellationToken) {
        let call_id = self.shared.call_id().to_string();
        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut silence_started: Option<Instant> = None;
        let mut resets_seen = self.state.resets();

        debug!(call_id = %call_id, "Dead-air monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            // A reset by the session restarts the silence period.
            let resets = self.state.resets();
            if resets != resets_seen {
                resets_seen = resets;
                silence_started = None;
            }
            let check_ins = self.state.check_ins();

            let quiet = if self.locally_busy() {
                false
            } else {
                match self.shared.activity().await {
                    Ok(activity) => activity.is_quiet(),
                    Err(e) => {
                        report_degraded(&call_id, e.kind(), &e);
                        true
                    }
                }
            };

            // The caller may have spoken while the store was being read.
            if self.state.resets() != resets_seen {
                resets_seen = self.state.resets();
                silence_started = None;
                continue;
            }

            if !quiet {
                if silence_started.take().is_some()
                    && let Err(e) = self.shared.clear_silence_start().await
                {
                    report_degraded(&call_id, e.kind(), &e);
                }
                continue;
            }

            let Some(started) = silence_started else {
                self.start_silence(&mut silence_started).await;
                continue;
            };

            let threshold = if self.state.holding() {
                self.config.hold_threshold()
            } else {
                self.config.silence_threshold()
            };
            if started.elapsed() < threshold {
                continue;
            }

            if check_ins >= self.config.max_check_ins {
                info!(call_id = %call_id, check_ins, "Silence limit reached");
                let _ = actions
                    .send(DeadAirAction::Terminate {
                        message: self.config.goodbye_message.clone(),
                    })
                    .await;
                break;
            }

            let attempt = check_ins + 1;
            if self
                .state
                .check_ins
                .compare_exchange(check_ins, attempt, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(call_id = %call_id, "Check-in counter reset mid-poll, restarting silence");
                silence_started = None;
                continue;
            }
            if let Err(e) = self.shared.set_check_ins(attempt).await {
                report_degraded(&call_id, e.kind(), &e);
            }
            info!(call_id = %call_id, attempt, "Checking in after silence");
            let action = DeadAirAction::CheckIn {
                attempt,
                message: self.config.check_in_message(attempt),
            };
            if actions.send(action).await.is_err() {
                break;
            }
            self.start_silence(&mut silence_started).await;
        }
        debug!(call_id = %call_id, "Dead-air monitor stopped");
    }

    async fn start_silence(&self, silence_started: &mut Option<Instant>) {
        *silence_started = Some(Instant::now());
        if let Err(e) = self.shared.record_silence_start(epoch_ms()).await {
            report_degraded(self.shared.call_id(), e.kind(), &e);
        }
    }
}
