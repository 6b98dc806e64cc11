//! Deciding that the remote app has finished answering.
//!
//! The page offers no completion event, so two signals are fused:
//!
//! - the busy indicator (a stop control present while generating and an
//!   enabled composer control once done), polled every `pollIntervalMs`;
//! - content stability: the last answer region unchanged for `idleMs`.
//!
//! The busy indicator wins once it has been seen busy. When it never shows
//! up within `busyGraceMs`, or cannot be read at all, stability decides.

use chatrelay_core::{ApiError, AutomationConfig, ErrorCode, Selectors};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::driver::PageDriver;
use crate::scripts;
use crate::snapshot::{read_answer, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyState {
    Busy,
    Idle,
    Unknown,
}

impl BusyState {
    fn parse(s: &str) -> Self {
        match s {
            "busy" => Self::Busy,
            "idle" => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    BusyIndicator,
    Stability,
}

/// Tracks how long the newest answer text has stayed unchanged.
#[derive(Debug)]
pub(crate) struct StabilityTracker {
    idle: Duration,
    last: String,
    changed_at: Instant,
}

impl StabilityTracker {
    pub fn new(idle: Duration, now: Instant) -> Self {
        Self {
            idle,
            last: String::new(),
            changed_at: now,
        }
    }

    /// Record a reading; true once non-empty text has been stable for the
    /// idle window.
    pub fn observe(&mut self, text: &str, now: Instant) -> bool {
        if text != self.last {
            self.last = text.to_string();
            self.changed_at = now;
        }
        !self.last.is_empty() && now.duration_since(self.changed_at) >= self.idle
    }
}

pub struct CompletionDetector {
    selectors: Selectors,
    automation: AutomationConfig,
}

impl CompletionDetector {
    pub fn new(selectors: Selectors, automation: AutomationConfig) -> Self {
        Self {
            selectors,
            automation,
        }
    }

    async fn busy_state(&self, page: &dyn PageDriver) -> BusyState {
        let args = vec![
            json!(self.selectors.busy_indicator),
            json!(self.selectors.ready_indicator),
        ];
        match page.evaluate(scripts::BUSY_STATE, args).await {
            Ok(v) => BusyState::parse(v.as_str().unwrap_or("")),
            Err(e) => {
                debug!(error = %e, "Busy indicator unreadable");
                BusyState::Unknown
            }
        }
    }

    async fn answer(&self, page: &dyn PageDriver) -> Snapshot {
        match read_answer(page, &self.selectors).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "Answer region unreadable");
                Snapshot::default()
            }
        }
    }

    /// Wait until the answer that follows `baseline` answer regions is
    /// complete. Fails with `response_timeout` within one poll interval of
    /// `completionTimeoutMs`.
    pub async fn wait(&self, page: &dyn PageDriver, baseline: u64) -> Result<CompletionSignal, ApiError> {
        let poll = Duration::from_millis(self.automation.poll_interval_ms.max(1));
        let timeout = Duration::from_millis(self.automation.completion_timeout_ms);
        let grace = Duration::from_millis(self.automation.busy_grace_ms);

        let start = Instant::now();
        let deadline = start + timeout;
        let mut seen_busy = false;
        let mut last_state = BusyState::Unknown;
        let mut stability = StabilityTracker::new(Duration::from_millis(self.automation.idle_ms), start);

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ApiError::new(
                    ErrorCode::ResponseTimeout,
                    "Response not completed in time",
                )
                .with_details(format!(
                    "waited {}ms; busy indicator {}; last state {:?}",
                    now.duration_since(start).as_millis(),
                    if seen_busy { "seen" } else { "never seen" },
                    last_state
                )));
            }

            let state = self.busy_state(page).await;
            if state != last_state {
                debug!(?state, elapsed_ms = now.duration_since(start).as_millis() as u64, "Busy state changed");
                last_state = state;
            }
            match state {
                BusyState::Busy => seen_busy = true,
                BusyState::Idle if seen_busy => {
                    info!(elapsed_ms = start.elapsed().as_millis() as u64, "Generation finished (busy indicator)");
                    return Ok(CompletionSignal::BusyIndicator);
                }
                _ => {}
            }

            let snapshot = self.answer(page).await;
            let settled = stability.observe(snapshot.text_after(baseline), Instant::now());
            let trust_stability = match state {
                BusyState::Unknown => true,
                BusyState::Idle => !seen_busy && now.duration_since(start) >= grace,
                BusyState::Busy => false,
            };
            if trust_stability && settled {
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "Generation finished (content stable)");
                return Ok(CompletionSignal::Stability);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll.min(remaining)).await;
        }
    }
}
