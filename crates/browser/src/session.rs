//! Browser session ownership.
//!
//! One process-wide session: a browser process plus one page. The manager
//! is the only component allowed to create or replace it; everyone else asks
//! for a ready page through [`SessionManager::ensure_ready`].

use chatrelay_core::{ApiError, BrowserConfig, Error, ErrorCode, Selectors};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::driver::{PageDriver, WaitPolicy};
use crate::identity::Identity;
use crate::launcher::BrowserLauncher;
use crate::scripts;

/// A live browser page, never handed out half-initialized.
pub struct Session {
    driver: Arc<dyn PageDriver>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn driver(&self) -> Arc<dyn PageDriver> {
        self.driver.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

enum SessionState {
    Uninitialized,
    Ready(Session),
    Closed,
}

pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    browser: BrowserConfig,
    selectors: Selectors,
    identity_path: PathBuf,
    identity: OnceCell<Identity>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        browser: BrowserConfig,
        selectors: Selectors,
        identity_path: PathBuf,
    ) -> Self {
        Self {
            launcher,
            browser,
            selectors,
            identity_path,
            identity: OnceCell::new(),
            state: Mutex::new(SessionState::Uninitialized),
        }
    }

    /// Return a usable page, recreating the session if the browser or page
    /// is gone. Cheap and side-effect free when already ready.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn PageDriver>, ApiError> {
        let mut state = self.state.lock().await;

        match &*state {
            SessionState::Ready(session) if session.driver.is_alive() => {
                return Ok(session.driver.clone());
            }
            SessionState::Ready(session) => {
                warn!(
                    created_at = %session.created_at,
                    "Browser session invalid, re-initializing"
                );
                let _ = session.driver.close().await;
            }
            SessionState::Closed => info!("Session was closed, starting a new one"),
            SessionState::Uninitialized => info!("Starting browser session"),
        }
        *state = SessionState::Uninitialized;

        let session = self.initialize().await.map_err(|e| {
            ApiError::new(
                ErrorCode::SessionInitFailed,
                "Browser session could not reach a ready state",
            )
            .with_details(e.to_string())
        })?;
        let driver = session.driver.clone();
        *state = SessionState::Ready(session);
        Ok(driver)
    }

    async fn initialize(&self) -> Result<Session, Error> {
        let driver = self.launcher.launch().await?;
        match self.prepare(driver.as_ref()).await {
            Ok(()) => {
                info!(url = %self.browser.chat_url, "Chat page ready");
                Ok(Session {
                    driver,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                let _ = driver.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, driver: &dyn PageDriver) -> Result<(), Error> {
        let identity = self.identity.get_or_init(|| {
            Identity::load(&self.identity_path, Some(self.browser.user_agent.clone()))
        });

        driver.add_init_script(scripts::HIDE_WEBDRIVER).await?;
        driver.set_cookies(&identity.cookies).await?;
        if let Some(ua) = &identity.user_agent {
            driver.set_user_agent(ua).await?;
        }
        if !self.browser.blocked_resources.is_empty() {
            driver.block_resources(&self.browser.blocked_resources).await?;
        }

        let nav_timeout = Duration::from_millis(self.browser.navigation_timeout_ms);
        match driver
            .navigate(&self.browser.chat_url, WaitPolicy::NetworkIdle, nav_timeout)
            .await
        {
            Ok(()) => {}
            // Long-polling pages may never go idle; the prompt check below decides.
            Err(Error::Timeout(msg)) => warn!(%msg, "Network never settled on the chat page"),
            Err(e) => return Err(e),
        }

        driver
            .wait_for_visible(
                &self.selectors.prompt_input,
                Duration::from_millis(self.browser.ready_timeout_ms),
            )
            .await
    }

    /// Whether a live session exists, without creating one.
    pub async fn is_ready(&self) -> bool {
        match &*self.state.lock().await {
            SessionState::Ready(session) => session.driver.is_alive(),
            _ => false,
        }
    }

    pub async fn reload(&self) -> Result<(), ApiError> {
        let driver = self.ensure_ready().await?;
        driver
            .reload(
                WaitPolicy::DomContentLoaded,
                Duration::from_millis(self.browser.navigation_timeout_ms),
            )
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Ready(session) = std::mem::replace(&mut *state, SessionState::Closed) {
            if let Err(e) = session.driver.close().await {
                warn!(error = %e, "Error while closing browser");
            }
            info!("Browser session closed");
        }
    }
}
