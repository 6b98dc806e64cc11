//! Scripted [`PageDriver`] for unit tests.
//!
//! Visibility is keyed by selector and time since the page was created.
//! The busy state, answer snapshots and extracted replies follow timelines
//! that restart whenever Enter is pressed, so a test can describe "what the
//! remote app renders after submission" in milliseconds.

use async_trait::async_trait;
use chatrelay_core::{Error, Result, Selectors};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::driver::{HostFunction, HostHandler, PageDriver, WaitPolicy};
use crate::identity::Cookie;
use crate::launcher::BrowserLauncher;
use crate::scripts;

struct MockState {
    alive: bool,
    created: Instant,
    submitted: Instant,
    calls: Vec<String>,
    visible: HashMap<String, Duration>,
    reveals: HashMap<String, Vec<String>>,
    failing_clicks: HashSet<String>,
    busy: Vec<(u64, &'static str)>,
    answers: Vec<(u64, u64, String)>,
    replies: VecDeque<String>,
    set_input_failures: u32,
    input_value: Option<String>,
    handlers: HashMap<String, HostHandler>,
    bridge_fails: bool,
    chrome: Vec<(String, String)>,
    bridge_chrome: Vec<String>,
}

pub(crate) struct MockPage {
    state: Mutex<MockState>,
}

impl MockPage {
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            state: Mutex::new(MockState {
                alive: true,
                created: now,
                submitted: now,
                calls: Vec::new(),
                visible: HashMap::new(),
                reveals: HashMap::new(),
                failing_clicks: HashSet::new(),
                busy: Vec::new(),
                answers: Vec::new(),
                replies: VecDeque::new(),
                set_input_failures: 0,
                input_value: None,
                handlers: HashMap::new(),
                bridge_fails: false,
                chrome: Vec::new(),
                bridge_chrome: Vec::new(),
            }),
        })
    }

    /// A page showing the prompt input, as after a successful load.
    pub fn ready() -> Arc<Self> {
        let page = Self::new();
        page.show(&Selectors::default().prompt_input);
        page
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn show(&self, selector: &str) {
        self.show_after(selector, 0);
    }

    /// Make `selector` visible once `ms` have passed since page creation.
    pub fn show_after(&self, selector: &str, ms: u64) {
        self.with(|s| {
            s.visible
                .insert(selector.to_string(), Duration::from_millis(ms))
        });
    }

    pub fn hide(&self, selector: &str) {
        self.with(|s| s.visible.remove(selector));
    }

    /// Clicking `selector` makes `target` visible.
    pub fn on_click_show(&self, selector: &str, target: &str) {
        self.with(|s| {
            s.reveals
                .entry(selector.to_string())
                .or_default()
                .push(target.to_string())
        });
    }

    pub fn fail_click(&self, selector: &str) {
        self.with(|s| s.failing_clicks.insert(selector.to_string()));
    }

    /// `(ms after Enter, "busy" | "idle" | "unknown")`. Restarts the clock.
    pub fn busy_timeline(&self, timeline: Vec<(u64, &'static str)>) {
        self.with(|s| {
            s.busy = timeline;
            s.submitted = Instant::now();
        });
    }

    /// `(ms after Enter, answer region count, text of the last region)`.
    /// Restarts the clock.
    pub fn answer_timeline(&self, timeline: Vec<(u64, u64, &str)>) {
        self.with(|s| {
            s.answers = timeline
                .into_iter()
                .map(|(ms, count, text)| (ms, count, text.to_string()))
                .collect();
            s.submitted = Instant::now();
        });
    }

    /// Replies handed out by successive extractions before falling back to
    /// the answer timeline.
    pub fn queue_replies(&self, replies: &[&str]) {
        self.with(|s| s.replies.extend(replies.iter().map(|r| r.to_string())));
    }

    pub fn fail_set_input(&self, times: u32) {
        self.with(|s| s.set_input_failures = times);
    }

    /// Elements matching `selector` render `text` inside the answer region.
    /// Reads that exclude `selector` drop it from the answer text.
    pub fn chrome_text(&self, selector: &str, text: &str) {
        self.with(|s| s.chrome.push((selector.to_string(), text.to_string())));
    }

    /// Chrome selectors handed to the last mutation bridge.
    pub fn bridge_chrome(&self) -> Vec<String> {
        self.with(|s| s.bridge_chrome.clone())
    }

    pub fn fail_bridge(&self) {
        self.with(|s| s.bridge_fails = true);
    }

    pub fn kill(&self) {
        self.with(|s| s.alive = false);
    }

    pub fn revive(&self) {
        self.with(|s| s.alive = true);
    }

    /// Deliver `payload` to the exposed host function `name`.
    pub fn push(&self, name: &str, payload: Value) {
        let handler = self.with(|s| s.handlers.get(name).cloned());
        if let Some(handler) = handler {
            handler(payload);
        }
    }

    pub fn host_functions(&self) -> Vec<String> {
        self.with(|s| s.handlers.keys().cloned().collect())
    }

    pub fn input_value(&self) -> Option<String> {
        self.with(|s| s.input_value.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    fn record(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }

    fn visible_now(&self, selector: &str) -> bool {
        self.with(|s| {
            s.visible
                .get(selector)
                .map(|after| s.created.elapsed() >= *after)
                .unwrap_or(false)
        })
    }

    fn busy_now(&self) -> &'static str {
        self.with(|s| {
            let t = s.submitted.elapsed().as_millis() as u64;
            s.busy
                .iter()
                .rev()
                .find(|(ms, _)| *ms <= t)
                .map(|(_, state)| *state)
                .unwrap_or("unknown")
        })
    }

    fn without_chrome(&self, text: String, excluded: &Value) -> String {
        let excluded: Vec<String> = serde_json::from_value(excluded.clone()).unwrap_or_default();
        let chrome = self.with(|s| s.chrome.clone());
        let text = chrome
            .iter()
            .filter(|(selector, _)| excluded.contains(selector))
            .fold(text, |text, (_, rendered)| text.replace(rendered.as_str(), ""));
        text.trim().to_string()
    }

    fn answer_now(&self) -> (u64, String) {
        self.with(|s| {
            let t = s.submitted.elapsed().as_millis() as u64;
            s.answers
                .iter()
                .rev()
                .find(|(ms, _, _)| *ms <= t)
                .map(|(_, count, text)| (*count, text.clone()))
                .unwrap_or((0, String::new()))
        })
    }
}

#[async_trait]
impl PageDriver for MockPage {
    fn is_alive(&self) -> bool {
        self.with(|s| s.alive)
    }

    async fn navigate(&self, url: &str, _wait: WaitPolicy, _timeout: Duration) -> Result<()> {
        self.record(format!("navigate:{}", url));
        Ok(())
    }

    async fn reload(&self, _wait: WaitPolicy, _timeout: Duration) -> Result<()> {
        self.record("reload".into());
        Ok(())
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return Err(Error::SessionClosed("page closed".into()));
            }
            if self.visible_now(selector) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::SelectorNotFound(selector.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        Ok(self.visible_now(selector))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.record(format!("click:{}", selector));
        let failing = self.with(|s| s.failing_clicks.contains(selector));
        if failing || !self.visible_now(selector) {
            return Err(Error::SelectorNotFound(selector.to_string()));
        }
        let revealed = self.with(|s| s.reveals.get(selector).cloned().unwrap_or_default());
        for target in revealed {
            self.show(&target);
        }
        Ok(())
    }

    async fn hover(&self, selector: &str) -> Result<()> {
        self.record(format!("hover:{}", selector));
        Ok(())
    }

    async fn focus(&self, selector: &str) -> Result<()> {
        self.record(format!("focus:{}", selector));
        Ok(())
    }

    async fn set_input_value(&self, selector: &str, text: &str) -> Result<()> {
        self.record(format!("set_input:{}", selector));
        let fail = self.with(|s| {
            if s.set_input_failures > 0 {
                s.set_input_failures -= 1;
                true
            } else {
                s.input_value = Some(text.to_string());
                false
            }
        });
        if fail {
            return Err(Error::Script("input not interactive yet".into()));
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(format!("key:{}", key));
        if key == "Enter" {
            self.with(|s| s.submitted = Instant::now());
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let excluded = args.get(1).cloned().unwrap_or(Value::Null);
        if script == scripts::BUSY_STATE {
            return Ok(json!(self.busy_now()));
        }
        if script == scripts::ANSWER_SNAPSHOT {
            let (count, text) = self.answer_now();
            let text = self.without_chrome(text, &excluded);
            return Ok(json!({ "count": count, "text": text }));
        }
        if script == scripts::EXTRACT_REPLY {
            let (count, text) = self.answer_now();
            let text = match self.with(|s| s.replies.pop_front()) {
                Some(reply) => reply,
                None => self.without_chrome(text, &excluded),
            };
            return Ok(json!({ "count": count, "text": text }));
        }
        Ok(Value::Null)
    }

    async fn add_init_script(&self, _source: &str) -> Result<()> {
        self.record("init_script".into());
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        self.record(format!("cookies:{}", cookies.len()));
        Ok(())
    }

    async fn set_user_agent(&self, _user_agent: &str) -> Result<()> {
        self.record("user_agent".into());
        Ok(())
    }

    async fn block_resources(&self, _patterns: &[String]) -> Result<()> {
        self.record("block_resources".into());
        Ok(())
    }

    async fn expose_host_function(&self, name: &str, handler: HostHandler) -> Result<HostFunction> {
        self.record(format!("expose:{}", name));
        self.with(|s| s.handlers.insert(name.to_string(), handler));
        Ok(HostFunction::new(name, None))
    }

    async fn register_mutation_bridge(
        &self,
        _root_selector: &str,
        chrome: &[String],
        binding: &str,
    ) -> Result<()> {
        self.record(format!("bridge:{}", binding));
        self.with(|s| s.bridge_chrome = chrome.to_vec());
        if self.with(|s| s.bridge_fails) {
            return Err(Error::Script("binding not callable".into()));
        }
        Ok(())
    }

    async fn remove_mutation_bridge(&self, binding: &str) -> Result<()> {
        self.record(format!("unbridge:{}", binding));
        self.with(|s| s.handlers.remove(binding));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close".into());
        self.with(|s| s.alive = false);
        Ok(())
    }
}

/// Hands out the same [`MockPage`], reviving it on every launch.
pub(crate) struct MockLauncher {
    page: Arc<MockPage>,
    launches: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockLauncher {
    pub fn new(page: Arc<MockPage>) -> Arc<Self> {
        Arc::new(Self {
            page,
            launches: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Other("browser binary crashed".into()));
        }
        self.page.revive();
        Ok(self.page.clone())
    }
}
