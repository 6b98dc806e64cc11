//! Committing a message history to the prompt input.

use chatrelay_core::{ApiError, AutomationConfig, Error, ErrorCode, Message, Selectors};
use std::time::Duration;
use tracing::info;

use crate::driver::PageDriver;
use crate::retry::{retry_until_success, RetryPolicy};

/// Flatten a history into one prompt, one `Label: content` line per turn.
/// The page has no multi-turn append under automation, so every submission
/// carries the whole conversation.
pub fn serialize_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct InputSubmitter {
    selectors: Selectors,
    automation: AutomationConfig,
}

impl InputSubmitter {
    pub fn new(selectors: Selectors, automation: AutomationConfig) -> Self {
        Self {
            selectors,
            automation,
        }
    }

    pub async fn submit(&self, page: &dyn PageDriver, history: &[Message]) -> Result<(), ApiError> {
        if history.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidMessages,
                "At least one message is required",
            ));
        }
        let payload = serialize_history(history);
        let prompt = &self.selectors.prompt_input;

        page.wait_for_visible(prompt, Duration::from_millis(self.automation.selector_timeout_ms))
            .await
            .map_err(|e| match e {
                Error::SelectorNotFound(_) => {
                    ApiError::new(ErrorCode::InputSurfaceMissing, "Prompt input not found")
                        .with_param(prompt.clone())
                }
                other => other.into(),
            })?;

        let policy = RetryPolicy::fixed(
            self.automation.input_retries,
            Duration::from_millis(self.automation.input_retry_delay_ms),
        );
        retry_until_success(&policy, "fill prompt input", |_| {
            page.set_input_value(prompt, &payload)
        })
        .await?;
        page.press_key("Enter").await?;

        info!(
            messages = history.len(),
            chars = payload.chars().count(),
            "Prompt submitted"
        );
        Ok(())
    }
}
