//! The operations handed to the HTTP layer and the CLI.
//!
//! One relay owns one browser session. Submissions are single-flight: a
//! second one while the first is still running (including its trailing
//! cleanup) is rejected with `session_busy`. Callers that want queueing do
//! it on their side, see [`ChatRelay::wait_idle`].

use chatrelay_core::{
    ApiError, ChatMode, CleanupPolicy, Config, ErrorCode, Message, Paths, Selectors,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::completion::{CompletionDetector, CompletionSignal};
use crate::driver::PageDriver;
use crate::launcher::{BrowserLauncher, ChromeLauncher};
use crate::lifecycle::{ChatLifecycleManager, CleanupOutcome};
use crate::reply::ReplyExtractor;
use crate::session::SessionManager;
use crate::snapshot::read_answer;
use crate::stream::{DeltaStream, DeltaStreamBridge, StreamEvent};
use crate::submit::InputSubmitter;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub reply_text: String,
    pub mode: ChatMode,
    pub signal: CompletionSignal,
    /// What happened to the conversation afterwards. Informational only.
    pub cleanup: CleanupOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub ready: bool,
}

pub struct ChatRelay {
    session: SessionManager,
    lifecycle: ChatLifecycleManager,
    submitter: InputSubmitter,
    detector: CompletionDetector,
    bridge: DeltaStreamBridge,
    extractor: ReplyExtractor,
    selectors: Selectors,
    cleanup: CleanupPolicy,
    default_mode: ChatMode,
    flight: Arc<Mutex<()>>,
}

impl ChatRelay {
    pub fn new(config: &Config, launcher: Arc<dyn BrowserLauncher>, identity_path: PathBuf) -> Self {
        let selectors = config.selectors.clone();
        let automation = config.automation.clone();
        Self {
            session: SessionManager::new(
                launcher,
                config.browser.clone(),
                selectors.clone(),
                identity_path,
            ),
            lifecycle: ChatLifecycleManager::new(
                config.browser.clone(),
                selectors.clone(),
                automation.clone(),
            ),
            submitter: InputSubmitter::new(selectors.clone(), automation.clone()),
            detector: CompletionDetector::new(selectors.clone(), automation.clone()),
            bridge: DeltaStreamBridge::new(selectors.clone(), automation.clone()),
            extractor: ReplyExtractor::new(selectors.clone(), automation.clone()),
            selectors,
            cleanup: automation.cleanup,
            default_mode: automation.default_mode,
            flight: Arc::new(Mutex::new(())),
        }
    }

    /// Relay driving a locally launched Chrome with the configured profile
    /// and saved cookies.
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        let launcher = ChromeLauncher::new(config.browser.clone(), paths.browser_profile_dir());
        Self::new(config, Arc::new(launcher), config.cookies_path(paths))
    }

    pub fn default_mode(&self) -> ChatMode {
        self.default_mode
    }

    fn begin(&self) -> Result<OwnedMutexGuard<()>, ApiError> {
        self.flight.clone().try_lock_owned().map_err(|_| {
            ApiError::new(
                ErrorCode::SessionBusy,
                "Another submission is still in flight on this session",
            )
        })
    }

    /// Resolves once no submission is in flight.
    pub async fn wait_idle(&self) {
        let _idle = self.flight.lock().await;
    }

    pub async fn ensure_ready(&self) -> Result<(), ApiError> {
        self.session.ensure_ready().await.map(|_| ())
    }

    /// Readiness probe; starts the session when there is none and nothing
    /// is in flight. A submission in flight owns the page, so the probe
    /// then only reports whether that page is still alive.
    pub async fn status(&self) -> RelayStatus {
        if self.flight.try_lock().is_err() {
            return RelayStatus {
                ready: self.session.is_ready().await,
            };
        }
        let ready = match self.session.ensure_ready().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Status check: session not ready");
                false
            }
        };
        RelayStatus { ready }
    }

    async fn answer_count(&self, page: &dyn PageDriver) -> u64 {
        match read_answer(page, &self.selectors).await {
            Ok(snapshot) => snapshot.count,
            Err(e) => {
                debug!(error = %e, "Could not count answer regions, assuming none");
                0
            }
        }
    }

    /// Submit `history` and wait for the full reply.
    pub async fn send_synchronous(
        &self,
        history: &[Message],
        mode: Option<ChatMode>,
    ) -> Result<ChatReply, ApiError> {
        let _flight = self.begin()?;
        let mode = mode.unwrap_or(self.default_mode);
        info!(%mode, messages = history.len(), "Synchronous submission");

        let page = self.session.ensure_ready().await?;
        let mut submitted = false;
        let result = self
            .run_synchronous(page.as_ref(), history, mode, &mut submitted)
            .await;
        let cleanup = self
            .cleanup_after(page.as_ref(), mode, result.is_ok(), submitted)
            .await;

        let (reply_text, signal) = result?;
        Ok(ChatReply {
            reply_text,
            mode,
            signal,
            cleanup,
        })
    }

    async fn run_synchronous(
        &self,
        page: &dyn PageDriver,
        history: &[Message],
        mode: ChatMode,
        submitted: &mut bool,
    ) -> Result<(String, CompletionSignal), ApiError> {
        self.lifecycle.enter(page, mode).await?;
        let baseline = self.answer_count(page).await;
        self.submitter.submit(page, history).await?;
        *submitted = true;
        self.lifecycle.mark_consumed();

        let signal = self.detector.wait(page, baseline).await?;
        let reply = self.extractor.extract_final(page, baseline).await?;
        Ok((reply, signal))
    }

    /// Submit `history` and stream the reply as deltas. The returned stream
    /// ends with exactly one terminal event; the session stays reserved
    /// until the conversation has been cleaned up after it.
    pub async fn open_stream(
        self: &Arc<Self>,
        history: &[Message],
        mode: Option<ChatMode>,
    ) -> Result<DeltaStream, ApiError> {
        let flight = self.begin()?;
        let mode = mode.unwrap_or(self.default_mode);
        info!(%mode, messages = history.len(), "Streaming submission");

        let page = self.session.ensure_ready().await?;
        self.lifecycle.enter(page.as_ref(), mode).await?;
        let baseline = self.answer_count(page.as_ref()).await;
        // installed before submitting so the first render is not missed
        let mut upstream = self.bridge.open(page.clone(), baseline).await?;
        if let Err(e) = self.submitter.submit(page.as_ref(), history).await {
            drop(upstream);
            return Err(e);
        }
        self.lifecycle.mark_consumed();

        let (tx, rx) = mpsc::channel(64);
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let _flight = flight;
            let mut text = String::new();
            let mut succeeded = false;
            while let Some(event) = upstream.next_event().await {
                let event = match event {
                    StreamEvent::Delta(delta) => {
                        text.push_str(&delta);
                        StreamEvent::Delta(delta)
                    }
                    StreamEvent::Done => match relay.extractor.validate(&text) {
                        Ok(()) => {
                            succeeded = true;
                            StreamEvent::Done
                        }
                        Err(e) => StreamEvent::Error(e),
                    },
                    StreamEvent::Error(e) => StreamEvent::Error(e),
                };
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    // consumer gone; keep draining so the bridge ends normally
                    debug!("Stream consumer dropped");
                }
                if terminal {
                    break;
                }
            }
            drop(tx);

            let outcome = relay
                .cleanup_after(page.as_ref(), mode, succeeded, true)
                .await;
            debug!(?outcome, "Stream cleanup finished");
        });

        Ok(DeltaStream::from_receiver(rx))
    }

    async fn cleanup_after(
        &self,
        page: &dyn PageDriver,
        mode: ChatMode,
        succeeded: bool,
        submitted: bool,
    ) -> CleanupOutcome {
        if !submitted {
            return CleanupOutcome::Skipped("nothing was submitted".into());
        }
        match self.cleanup {
            CleanupPolicy::Never => CleanupOutcome::Skipped("cleanup disabled".into()),
            CleanupPolicy::OnSuccess if !succeeded => {
                CleanupOutcome::Skipped("kept after a failed submission".into())
            }
            _ => {
                self.lifecycle
                    .delete_current(page, mode, mode == ChatMode::Project)
                    .await
            }
        }
    }

    /// Delete the current conversation of `mode`. Best-effort: the outcome
    /// is reported, never raised.
    pub async fn delete_current_context(&self, mode: ChatMode) -> CleanupOutcome {
        let Ok(_flight) = self.begin() else {
            return CleanupOutcome::Skipped("a submission is in flight".into());
        };
        match self.session.ensure_ready().await {
            Ok(page) => {
                self.lifecycle
                    .delete_current(page.as_ref(), mode, mode == ChatMode::Project)
                    .await
            }
            Err(e) => {
                warn!(error = %e, "Cleanup skipped, session unavailable");
                CleanupOutcome::Failed(e.to_string())
            }
        }
    }

    /// Delete up to `count` project conversations. Best-effort.
    pub async fn delete_all(&self, count: usize) -> usize {
        let Ok(_flight) = self.begin() else {
            warn!("Bulk delete skipped, a submission is in flight");
            return 0;
        };
        match self.session.ensure_ready().await {
            Ok(page) => self.lifecycle.delete_all(page.as_ref(), count).await,
            Err(e) => {
                warn!(error = %e, "Bulk delete skipped, session unavailable");
                0
            }
        }
    }

    pub async fn reload(&self) -> Result<(), ApiError> {
        let _flight = self.begin()?;
        self.session.reload().await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLauncher, MockPage};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::Instant;

    fn temporary_page() -> Arc<MockPage> {
        let page = MockPage::ready();
        let s = Selectors::default();
        page.show(&s.temporary_close);
        page.show(&s.conversation_options);
        page.show(&s.delete_menu_item);
        page.show(&s.delete_confirm);
        page
    }

    fn relay_for(page: Arc<MockPage>, config: &Config) -> Arc<ChatRelay> {
        Arc::new(ChatRelay::new(
            config,
            MockLauncher::new(page),
            PathBuf::from("/nonexistent/cookies.json"),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_happy_path() {
        let page = temporary_page();
        page.busy_timeline(vec![(0, "busy"), (500, "idle")]);
        page.answer_timeline(vec![(0, 0, ""), (300, 1, "4")]);
        let relay = relay_for(page.clone(), &Config::default());

        let start = Instant::now();
        let reply = relay
            .send_synchronous(&[Message::user("2+2?")], Some(ChatMode::Temporary))
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "4");
        assert_eq!(reply.signal, CompletionSignal::BusyIndicator);
        assert_eq!(reply.cleanup, CleanupOutcome::Deleted);
        assert!(start.elapsed() < Duration::from_millis(60_000));
        assert_eq!(page.input_value().as_deref(), Some("User: 2+2?"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_failure_keeps_reply() {
        let page = temporary_page();
        page.hide(&Selectors::default().delete_confirm);
        page.busy_timeline(vec![(0, "busy"), (500, "idle")]);
        page.answer_timeline(vec![(0, 0, ""), (300, 1, "4")]);
        let relay = relay_for(page.clone(), &Config::default());

        let reply = relay
            .send_synchronous(&[Message::user("2+2?")], Some(ChatMode::Temporary))
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "4");
        assert!(matches!(reply.cleanup, CleanupOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_success_policy_keeps_failed_conversation() {
        let page = temporary_page();
        page.busy_timeline(vec![(0, "busy"), (500, "idle")]);
        page.answer_timeline(vec![(0, 0, ""), (300, 1, "⚠️ Network error")]);
        let mut config = Config::default();
        config.automation.cleanup = CleanupPolicy::OnSuccess;
        let relay = relay_for(page.clone(), &config);

        let err = relay
            .send_synchronous(&[Message::user("hi")], Some(ChatMode::Temporary))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidReply));
        assert_eq!(page.count(&format!("click:{}", Selectors::default().delete_confirm)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submission_rejected_while_in_flight() {
        let page = temporary_page();
        page.busy_timeline(vec![(0, "busy"), (5_000, "idle")]);
        page.answer_timeline(vec![(0, 0, ""), (300, 1, "first")]);
        let relay = relay_for(page.clone(), &Config::default());

        let first = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .send_synchronous(&[Message::user("one")], Some(ChatMode::Temporary))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = relay
            .send_synchronous(&[Message::user("two")], Some(ChatMode::Temporary))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::SessionBusy));
        assert_eq!(err.status, 409);
        assert!(relay.open_stream(&[Message::user("three")], None).await.is_err());
        assert_eq!(
            relay.delete_current_context(ChatMode::Temporary).await,
            CleanupOutcome::Skipped("a submission is in flight".into())
        );

        let reply = first.await.unwrap().unwrap();
        assert_eq!(reply.reply_text, "first");
        assert_eq!(page.count("key:Enter"), 1);

        relay.wait_idle().await;
        page.busy_timeline(vec![(0, "busy"), (400, "idle")]);
        page.answer_timeline(vec![(0, 1, "first"), (300, 2, "second")]);
        let reply = relay
            .send_synchronous(&[Message::user("again")], Some(ChatMode::Temporary))
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_then_cleanup_then_release() {
        let page = temporary_page();
        page.answer_timeline(vec![(0, 0, ""), (100, 1, "Hel"), (250, 1, "Hello")]);
        let relay = relay_for(page.clone(), &Config::default());

        let stream = relay
            .open_stream(&[Message::user("greet")], Some(ChatMode::Temporary))
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        relay.wait_idle().await;
        assert_eq!(page.count(&format!("click:{}", Selectors::default().delete_confirm)), 1);
        assert_eq!(page.count("unbridge:"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_and_sync_text_agree_without_chrome() {
        let chrome = Selectors::default().reply_chrome[0].clone();
        let answer = "Run this:\npythonCopy code\nprint(1)";
        let page_for = || {
            let page = temporary_page();
            page.chrome_text(&chrome, "pythonCopy code");
            page.busy_timeline(vec![(0, "busy"), (500, "idle")]);
            page.answer_timeline(vec![(0, 0, ""), (300, 1, answer)]);
            page
        };

        let sync_page = page_for();
        let reply = relay_for(sync_page, &Config::default())
            .send_synchronous(&[Message::user("code?")], Some(ChatMode::Temporary))
            .await
            .unwrap();

        let stream_page = page_for();
        let relay = relay_for(stream_page.clone(), &Config::default());
        let events: Vec<StreamEvent> = relay
            .open_stream(&[Message::user("code?")], Some(ChatMode::Temporary))
            .await
            .unwrap()
            .collect()
            .await;
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(!reply.reply_text.contains("Copy code"));
        assert_eq!(streamed, reply.reply_text);
        assert_eq!(stream_page.bridge_chrome(), Selectors::default().reply_chrome);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_with_degraded_reply_ends_in_error() {
        let page = temporary_page();
        page.answer_timeline(vec![(0, 0, ""), (100, 1, "⚠️ Something went wrong")]);
        let relay = relay_for(page.clone(), &Config::default());

        let stream = relay
            .open_stream(&[Message::user("hi")], Some(ChatMode::Temporary))
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;
        match events.last() {
            Some(StreamEvent::Error(e)) => assert!(e.is(ErrorCode::InvalidReply)),
            other => panic!("expected invalid reply, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_current_context_never_raises() {
        let page = temporary_page();
        let launcher = MockLauncher::new(page);
        launcher.fail_next_launch();
        let relay = ChatRelay::new(
            &Config::default(),
            launcher,
            PathBuf::from("/nonexistent/cookies.json"),
        );
        assert!(matches!(
            relay.delete_current_context(ChatMode::Temporary).await,
            CleanupOutcome::Failed(_)
        ));
        assert_eq!(
            relay.delete_current_context(ChatMode::Temporary).await,
            CleanupOutcome::Deleted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_readiness() {
        let page = MockPage::new();
        let mut config = Config::default();
        config.browser.ready_timeout_ms = 500;
        let relay = relay_for(page.clone(), &config);
        assert_eq!(relay.status().await, RelayStatus { ready: false });

        page.show(&config.selectors.prompt_input);
        assert_eq!(relay.status().await, RelayStatus { ready: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_relaunch_under_a_submission() {
        let page = temporary_page();
        page.busy_timeline(vec![(0, "busy"), (5_000, "idle")]);
        page.answer_timeline(vec![(0, 0, ""), (300, 1, "slow")]);
        let launcher = MockLauncher::new(page.clone());
        let relay = Arc::new(ChatRelay::new(
            &Config::default(),
            launcher.clone(),
            PathBuf::from("/nonexistent/cookies.json"),
        ));

        let in_flight = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .send_synchronous(&[Message::user("one")], Some(ChatMode::Temporary))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launches(), 1);

        page.kill();
        assert_eq!(relay.status().await, RelayStatus { ready: false });
        assert_eq!(launcher.launches(), 1);
        in_flight.abort();
    }
}
