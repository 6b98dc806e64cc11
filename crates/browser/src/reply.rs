//! Reading the finished answer as plain text.

use chatrelay_core::{ApiError, AutomationConfig, Error, ErrorCode, Selectors};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::driver::PageDriver;
use crate::retry::{retry_until_success, RetryPolicy};
use crate::scripts;
use crate::snapshot::Snapshot;

pub struct ReplyExtractor {
    selectors: Selectors,
    automation: AutomationConfig,
}

impl ReplyExtractor {
    pub fn new(selectors: Selectors, automation: AutomationConfig) -> Self {
        Self {
            selectors,
            automation,
        }
    }

    /// Text of the answer following `baseline` answer regions, with UI
    /// chrome removed and scrollable code regions fenced. The render may
    /// trail the completion signal, so an empty region is retried with a
    /// linearly growing delay.
    pub async fn extract_final(&self, page: &dyn PageDriver, baseline: u64) -> Result<String, ApiError> {
        let policy = RetryPolicy::linear(
            self.automation.reply_retries,
            Duration::from_millis(self.automation.reply_retry_delay_ms),
        );
        let s = &self.selectors;

        let reply = retry_until_success(&policy, "capture reply", |attempt| async move {
            let value = page
                .evaluate(
                    scripts::EXTRACT_REPLY,
                    vec![
                        json!(s.answer_region),
                        json!(s.reply_chrome),
                        json!(s.code_scroller),
                    ],
                )
                .await?;
            let snapshot: Snapshot = serde_json::from_value(value)?;
            let text = snapshot.text_after(baseline).trim();
            if text.is_empty() {
                debug!(attempt, regions = snapshot.count, baseline, "No reply rendered yet");
                return Err(Error::Other("answer region is empty".into()));
            }
            Ok(text.to_string())
        })
        .await
        .map_err(|e| {
            if e.is(ErrorCode::SessionInitFailed) {
                return e;
            }
            ApiError::new(
                ErrorCode::CaptureReplyFailed,
                "Failed to capture reply after retries",
            )
            .with_details(e.message)
        })?;

        self.validate(&reply)?;
        info!(chars = reply.chars().count(), "Reply captured");
        Ok(reply)
    }

    /// Empty replies and replies carrying a degraded-answer marker are
    /// upstream failures, not answers.
    pub fn validate(&self, reply: &str) -> Result<(), ApiError> {
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidReply,
                "Empty or invalid reply captured",
            ));
        }
        if let Some(marker) = self
            .automation
            .invalid_reply_markers
            .iter()
            .find(|m| !m.is_empty() && trimmed.starts_with(m.as_str()))
        {
            let first_line: String = trimmed.lines().next().unwrap_or("").chars().take(200).collect();
            return Err(ApiError::new(
                ErrorCode::InvalidReply,
                "Empty or invalid reply captured",
            )
            .with_param(marker.clone())
            .with_details(first_line));
        }
        Ok(())
    }
}
