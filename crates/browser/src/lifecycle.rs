//! Positioning inside a conversation context and tearing it down again.
//!
//! ```text
//! Unpositioned -> Navigating -> Positioned(mode) -> Deleting -> Unpositioned
//! ```

use chatrelay_core::{
    ApiError, AutomationConfig, BrowserConfig, ChatMode, Error, ErrorCode, Selectors,
};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::{PageDriver, WaitPolicy};
use crate::retry::{retry_until_success, RetryPolicy};

/// Pause after the project page renders, before touching its list.
const PROJECT_SETTLE: Duration = Duration::from_millis(500);
/// Pause between rounds of bulk deletion.
const BULK_ROUND_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unpositioned,
    Navigating,
    Positioned(ChatMode),
    Deleting,
}

/// Result of a best-effort cleanup. Never turned into an error for the
/// caller; a failure only ends up in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    Skipped(String),
    Failed(String),
}

impl CleanupOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

pub struct ChatLifecycleManager {
    browser: BrowserConfig,
    selectors: Selectors,
    automation: AutomationConfig,
    state: Mutex<ContextState>,
}

impl ChatLifecycleManager {
    pub fn new(browser: BrowserConfig, selectors: Selectors, automation: AutomationConfig) -> Self {
        Self {
            browser,
            selectors,
            automation,
            state: Mutex::new(ContextState::Unpositioned),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ContextState::Unpositioned)
    }

    fn set_state(&self, next: ContextState) {
        if let Ok(mut state) = self.state.lock() {
            debug!(from = ?*state, to = ?next, "Chat context transition");
            *state = next;
        }
    }

    fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.automation.selector_timeout_ms)
    }

    /// Position the page inside a fresh conversation of `mode` with the
    /// prompt input focused. A no-op when already positioned there.
    pub async fn enter(&self, page: &dyn PageDriver, mode: ChatMode) -> Result<(), ApiError> {
        if self.state() == ContextState::Positioned(mode) {
            if page
                .is_visible(&self.selectors.prompt_input)
                .await
                .unwrap_or(false)
            {
                debug!(%mode, "Already positioned");
                return Ok(());
            }
            warn!(%mode, "Chat context drifted, entering again");
        }

        self.set_state(ContextState::Navigating);
        let result = match mode {
            ChatMode::Project => self.enter_project(page).await,
            ChatMode::Temporary => self.enter_temporary(page).await,
        };
        match result {
            Ok(()) => {
                info!(%mode, "Entered chat context");
                self.set_state(ContextState::Positioned(mode));
                Ok(())
            }
            Err(e) => {
                self.set_state(ContextState::Unpositioned);
                Err(e)
            }
        }
    }

    /// The current conversation received a submission; the next request
    /// needs a fresh one.
    pub fn mark_consumed(&self) {
        self.set_state(ContextState::Unpositioned);
    }

    async fn enter_project(&self, page: &dyn PageDriver) -> Result<(), ApiError> {
        let link = self.selectors.project_link(&self.browser.project_link);
        let prompt = &self.selectors.prompt_input;
        let timeout = self.selector_timeout();
        let policy = RetryPolicy::fixed(
            self.automation.enter_retries,
            Duration::from_millis(self.automation.enter_retry_delay_ms),
        );

        retry_until_success(&policy, "enter project chat", |attempt| {
            let link = &link;
            async move {
                debug!(attempt, link = %link, "Opening project chat");
                page.wait_for_visible(link, timeout).await.map_err(|e| match e {
                    Error::SelectorNotFound(_) => Error::Api(
                        ApiError::new(ErrorCode::ProjectLinkMissing, "Project chat link not found")
                            .with_param(self.browser.project_link.clone()),
                    ),
                    other => other,
                })?;
                page.click(link).await?;
                page.wait_for_visible(prompt, timeout).await?;
                page.focus(prompt).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e| context_failed("project", e))
    }

    async fn enter_temporary(&self, page: &dyn PageDriver) -> Result<(), ApiError> {
        self.open_temporary(page)
            .await
            .map_err(|e| context_failed("temporary", e))
    }

    async fn open_temporary(&self, page: &dyn PageDriver) -> Result<(), ApiError> {
        let s = &self.selectors;
        if page.is_visible(&s.temporary_close).await? {
            debug!("Temporary chat already open");
            return Ok(());
        }

        let timeout = self.selector_timeout();
        page.click(&s.home_link).await?;
        page.wait_for_visible(&s.header_actions, timeout).await?;
        page.wait_for_visible(&s.temporary_toggle, timeout).await?;
        page.click(&s.temporary_toggle).await?;

        let policy = RetryPolicy::fixed(5, Duration::from_millis(500));
        retry_until_success(&policy, "wait temporary chat input", |_| {
            page.wait_for_visible(&s.prompt_input, Duration::from_secs(5))
        })
        .await?;
        page.focus(&s.prompt_input).await?;
        Ok(())
    }

    /// Delete the conversation just used. With `from_root` the project page
    /// is loaded first so the conversation list is on screen.
    pub async fn delete_current(
        &self,
        page: &dyn PageDriver,
        mode: ChatMode,
        from_root: bool,
    ) -> CleanupOutcome {
        self.set_state(ContextState::Deleting);
        let result = match mode {
            ChatMode::Project => self.delete_project_chat(page, from_root).await,
            ChatMode::Temporary => self.delete_temporary_chat(page).await,
        };
        self.set_state(ContextState::Unpositioned);

        match result {
            Ok(outcome) => {
                match &outcome {
                    CleanupOutcome::Deleted => info!(%mode, "Conversation deleted"),
                    CleanupOutcome::Skipped(reason) => debug!(%mode, %reason, "Cleanup skipped"),
                    CleanupOutcome::Failed(_) => {}
                }
                outcome
            }
            Err(e) => {
                warn!(%mode, error = %e, "Deleting conversation failed (non-fatal)");
                CleanupOutcome::Failed(e.to_string())
            }
        }
    }

    async fn delete_project_chat(
        &self,
        page: &dyn PageDriver,
        from_root: bool,
    ) -> Result<CleanupOutcome, Error> {
        let s = &self.selectors;
        let timeout = self.selector_timeout();

        if from_root {
            page.navigate(
                &self.browser.project_url(),
                WaitPolicy::DomContentLoaded,
                Duration::from_millis(self.browser.navigation_timeout_ms),
            )
            .await?;
            page.wait_for_visible(&s.project_root, timeout).await?;
            tokio::time::sleep(PROJECT_SETTLE).await;
        }

        page.wait_for_visible(&s.conversation_item, timeout).await?;
        page.hover(&s.conversation_item).await?;
        tokio::time::sleep(Duration::from_millis(self.automation.menu_settle_ms)).await;

        let menu = s.conversation_menu();
        if !page.is_visible(&menu).await? {
            return Ok(CleanupOutcome::Skipped("conversation menu not rendered".into()));
        }
        page.click(&menu).await?;
        self.click_when_visible(page, &s.delete_menu_item).await?;
        self.click_when_visible(page, &s.delete_confirm).await?;
        Ok(CleanupOutcome::Deleted)
    }

    async fn delete_temporary_chat(&self, page: &dyn PageDriver) -> Result<CleanupOutcome, Error> {
        let s = &self.selectors;
        self.click_when_visible(page, &s.conversation_options).await?;
        self.click_when_visible(page, &s.delete_menu_item).await?;
        self.click_when_visible(page, &s.delete_confirm).await?;
        Ok(CleanupOutcome::Deleted)
    }

    async fn click_when_visible(&self, page: &dyn PageDriver, selector: &str) -> Result<(), Error> {
        page.wait_for_visible(selector, self.selector_timeout()).await?;
        page.click(selector).await
    }

    /// Delete up to `count` project conversations, reloading between
    /// rounds. Stops at the first round that deletes nothing. Returns how
    /// many were deleted.
    pub async fn delete_all(&self, page: &dyn PageDriver, count: usize) -> usize {
        let nav_timeout = Duration::from_millis(self.browser.navigation_timeout_ms);
        if let Err(e) = page
            .navigate(&self.browser.project_url(), WaitPolicy::DomContentLoaded, nav_timeout)
            .await
        {
            warn!(error = %e, "Bulk delete could not open the project page");
            return 0;
        }

        let mut deleted = 0;
        for round in 0..count {
            match self.delete_current(page, ChatMode::Project, false).await {
                CleanupOutcome::Deleted => deleted += 1,
                outcome => {
                    debug!(round, ?outcome, "Bulk delete stopping");
                    break;
                }
            }
            if let Err(e) = page.reload(WaitPolicy::DomContentLoaded, nav_timeout).await {
                warn!(error = %e, "Reload between deletions failed");
                break;
            }
            tokio::time::sleep(BULK_ROUND_PAUSE).await;
        }
        info!(deleted, "Bulk delete finished");
        deleted
    }
}

fn context_failed(context: &str, err: ApiError) -> ApiError {
    if err.is(ErrorCode::ProjectLinkMissing) || err.is(ErrorCode::SessionInitFailed) {
        return err;
    }
    let mut failed = ApiError::new(
        ErrorCode::EnterContextFailed,
        format!("Failed to enter {} chat", context),
    )
    .with_details(err.message);
    failed.param = err.param;
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPage;

    fn manager() -> ChatLifecycleManager {
        ChatLifecycleManager::new(
            BrowserConfig::default(),
            Selectors::default(),
            AutomationConfig::default(),
        )
    }

    fn project_link() -> String {
        let browser = BrowserConfig::default();
        Selectors::default().project_link(&browser.project_link)
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_project_then_idempotent() {
        let page = MockPage::ready();
        page.show(&project_link());
        let lifecycle = manager();

        lifecycle.enter(page.as_ref(), ChatMode::Project).await.unwrap();
        assert_eq!(lifecycle.state(), ContextState::Positioned(ChatMode::Project));
        assert_eq!(page.count("click:"), 1);
        assert_eq!(page.count("focus:#prompt-textarea"), 1);

        lifecycle.enter(page.as_ref(), ChatMode::Project).await.unwrap();
        assert_eq!(page.count("click:"), 1);
        assert_eq!(page.count("focus:"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_context_is_entered_again() {
        let page = MockPage::ready();
        page.show(&project_link());
        let lifecycle = manager();

        lifecycle.enter(page.as_ref(), ChatMode::Project).await.unwrap();
        lifecycle.mark_consumed();
        assert_eq!(lifecycle.state(), ContextState::Unpositioned);
        lifecycle.enter(page.as_ref(), ChatMode::Project).await.unwrap();
        assert_eq!(page.count("click:"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_project_link() {
        let page = MockPage::ready();
        let lifecycle = manager();

        let err = lifecycle
            .enter(page.as_ref(), ChatMode::Project)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::ProjectLinkMissing));
        assert!(err.message.contains("3 attempt"));
        assert_eq!(page.count("click:"), 0);
        assert_eq!(lifecycle.state(), ContextState::Unpositioned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_project_failure_is_enter_context_failed() {
        let page = MockPage::ready();
        let link = project_link();
        page.show(&link);
        page.fail_click(&link);
        let lifecycle = manager();

        let err = lifecycle
            .enter(page.as_ref(), ChatMode::Project)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::EnterContextFailed));
        assert_eq!(err.status, 502);
        assert!(err.details.unwrap().contains(&link));
        assert_eq!(page.count("click:"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_already_open_is_noop() {
        let page = MockPage::ready();
        let s = Selectors::default();
        page.show(&s.temporary_close);
        let lifecycle = manager();

        lifecycle
            .enter(page.as_ref(), ChatMode::Temporary)
            .await
            .unwrap();
        assert_eq!(page.count("click:"), 0);
        assert_eq!(lifecycle.state(), ContextState::Positioned(ChatMode::Temporary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_opens_via_header_toggle() {
        let page = MockPage::new();
        let s = Selectors::default();
        page.show(&s.home_link);
        page.show(&s.header_actions);
        page.show(&s.temporary_toggle);
        page.on_click_show(&s.temporary_toggle, &s.prompt_input);
        let lifecycle = manager();

        lifecycle
            .enter(page.as_ref(), ChatMode::Temporary)
            .await
            .unwrap();
        let clicks: Vec<String> = page
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("click:"))
            .collect();
        assert_eq!(
            clicks,
            vec![
                format!("click:{}", s.home_link),
                format!("click:{}", s.temporary_toggle)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_project_chat_from_root() {
        let page = MockPage::ready();
        let s = Selectors::default();
        for sel in [
            s.project_root.clone(),
            s.conversation_item.clone(),
            s.conversation_menu(),
            s.delete_menu_item.clone(),
            s.delete_confirm.clone(),
        ] {
            page.show(&sel);
        }
        let lifecycle = manager();

        let outcome = lifecycle
            .delete_current(page.as_ref(), ChatMode::Project, true)
            .await;
        assert_eq!(outcome, CleanupOutcome::Deleted);
        assert_eq!(
            page.count(&format!("navigate:{}", BrowserConfig::default().project_url())),
            1
        );
        assert_eq!(page.count(&format!("hover:{}", s.conversation_item)), 1);
        assert_eq!(page.count(&format!("click:{}", s.delete_confirm)), 1);
        assert_eq!(lifecycle.state(), ContextState::Unpositioned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_is_swallowed() {
        let page = MockPage::ready();
        let s = Selectors::default();
        page.show(&s.conversation_options);
        page.show(&s.delete_menu_item);
        let lifecycle = manager();

        let outcome = lifecycle
            .delete_current(page.as_ref(), ChatMode::Temporary, false)
            .await;
        match outcome {
            CleanupOutcome::Failed(reason) => assert!(reason.contains(&s.delete_confirm)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(lifecycle.state(), ContextState::Unpositioned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_all_stops_when_nothing_left() {
        let page = MockPage::ready();
        let s = Selectors::default();
        page.show(&s.conversation_item);
        page.show(&s.delete_menu_item);
        page.show(&s.delete_confirm);
        let lifecycle = manager();

        // no menu trigger rendered: first round is skipped
        assert_eq!(lifecycle.delete_all(page.as_ref(), 50).await, 0);
        assert_eq!(page.count("reload"), 0);

        page.show(&s.conversation_menu());
        assert_eq!(lifecycle.delete_all(page.as_ref(), 3).await, 3);
        assert_eq!(page.count("reload"), 3);
    }
}
