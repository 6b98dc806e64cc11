//! The page capability set every other component is built on.
//!
//! [`PageDriver`] is the seam between the automation logic and a real
//! browser: [`CdpPageDriver`] implements it over the DevTools protocol, and
//! tests substitute a scripted page.

use async_trait::async_trait;
use chatrelay_core::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cdp::{CdpClient, KeyStroke};
use crate::identity::Cookie;
use crate::scripts;

/// How long `wait_for_visible` sleeps between probes.
const VISIBILITY_POLL: Duration = Duration::from_millis(100);

/// Which navigation milestone `navigate` waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    DomContentLoaded,
    Load,
    /// At most two connections in flight for a short while.
    NetworkIdle,
}

impl WaitPolicy {
    fn lifecycle_event(&self) -> &'static str {
        match self {
            Self::DomContentLoaded => "DOMContentLoaded",
            Self::Load => "load",
            Self::NetworkIdle => "networkAlmostIdle",
        }
    }
}

/// Callback invoked with the payload of each page-side call to an exposed
/// host function.
pub type HostHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Registration of a host function. Dropping it stops dispatching calls.
pub struct HostFunction {
    name: String,
    task: Option<JoinHandle<()>>,
}

impl HostFunction {
    pub fn new(name: &str, task: Option<JoinHandle<()>>) -> Self {
        Self {
            name: name.to_string(),
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for HostFunction {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Browser process running and page connection open.
    fn is_alive(&self) -> bool;

    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()>;

    async fn reload(&self, wait: WaitPolicy, timeout: Duration) -> Result<()>;

    /// Wait until `selector` is rendered; `Error::SelectorNotFound` on timeout.
    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Non-waiting probe: is `selector` currently rendered.
    async fn is_visible(&self, selector: &str) -> Result<bool>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn hover(&self, selector: &str) -> Result<()>;

    async fn focus(&self, selector: &str) -> Result<()>;

    /// Replace the value of an input through the native setter + `input` event.
    async fn set_input_value(&self, selector: &str, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    /// Call the function expression `script` with JSON `args`.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    async fn add_init_script(&self, source: &str) -> Result<()>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    async fn block_resources(&self, patterns: &[String]) -> Result<()>;

    /// Make `window[name](payload)` available to page code; each call is
    /// delivered to `handler` with the payload parsed as JSON when possible.
    async fn expose_host_function(&self, name: &str, handler: HostHandler) -> Result<HostFunction>;

    /// Push `{count, text}` of the last `root_selector` match, without the
    /// elements matching `chrome`, to the host function `binding` whenever
    /// the document mutates.
    async fn register_mutation_bridge(
        &self,
        root_selector: &str,
        chrome: &[String],
        binding: &str,
    ) -> Result<()>;

    async fn remove_mutation_bridge(&self, binding: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// [`PageDriver`] over a CDP page-target connection.
pub struct CdpPageDriver {
    cdp: CdpClient,
    process: std::sync::Mutex<Option<Child>>,
    slow_mo: Duration,
}

impl CdpPageDriver {
    pub fn new(cdp: CdpClient, process: Option<Child>, slow_mo: Duration) -> Self {
        Self {
            cdp,
            process: std::sync::Mutex::new(process),
            slow_mo,
        }
    }

    async fn pace(&self) {
        if !self.slow_mo.is_zero() {
            tokio::time::sleep(self.slow_mo).await;
        }
    }

    async fn element_center(&self, selector: &str) -> Result<Option<(f64, f64)>> {
        let v = self
            .evaluate(scripts::ELEMENT_CENTER, vec![json!(selector)])
            .await?;
        if v.is_null() {
            return Err(Error::SelectorNotFound(selector.to_string()));
        }
        if v.get("empty").and_then(|e| e.as_bool()).unwrap_or(false) {
            return Ok(None);
        }
        let x = v.get("x").and_then(|x| x.as_f64()).unwrap_or(0.0);
        let y = v.get("y").and_then(|y| y.as_f64()).unwrap_or(0.0);
        Ok(Some((x, y)))
    }

    async fn wait_lifecycle(
        &self,
        mut events: tokio::sync::mpsc::Receiver<Value>,
        frame_id: Option<String>,
        wait: WaitPolicy,
        timeout: Duration,
    ) -> Result<()> {
        let target = wait.lifecycle_event();
        let wait_fut = async {
            while let Some(ev) = events.recv().await {
                let name = ev.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let frame = ev.get("frameId").and_then(|v| v.as_str());
                let same_frame = match (&frame_id, frame) {
                    (Some(expected), Some(got)) => expected == got,
                    _ => true,
                };
                if same_frame && name == target {
                    return Ok(());
                }
            }
            Err(Error::SessionClosed("page closed while navigating".into()))
        };
        match tokio::time::timeout(timeout, wait_fut).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!(
                "no '{}' lifecycle event within {}ms",
                target,
                timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl PageDriver for CdpPageDriver {
    fn is_alive(&self) -> bool {
        if self.cdp.is_closed() {
            return false;
        }
        match self.process.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => true,
            },
            Err(_) => false,
        }
    }

    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()> {
        let events = self.cdp.subscribe_event("Page.lifecycleEvent").await;
        let frame_id = self.cdp.navigate(url).await?;
        debug!(url, ?wait, "Navigation started");
        self.wait_lifecycle(events, frame_id, wait, timeout).await
    }

    async fn reload(&self, wait: WaitPolicy, timeout: Duration) -> Result<()> {
        let events = self.cdp.subscribe_event("Page.lifecycleEvent").await;
        self.cdp.reload().await?;
        self.wait_lifecycle(events, None, wait, timeout).await
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_visible(selector).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::SelectorNotFound(selector.to_string()));
            }
            tokio::time::sleep(VISIBILITY_POLL).await;
        }
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        let v = self
            .evaluate(scripts::IS_VISIBLE, vec![json!(selector)])
            .await?;
        Ok(v.as_bool().unwrap_or(false))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.pace().await;
        match self.element_center(selector).await? {
            Some((x, y)) => {
                self.cdp.click_at(x, y).await?;
            }
            None => {
                let clicked = self.evaluate(scripts::DOM_CLICK, vec![json!(selector)]).await?;
                if !clicked.as_bool().unwrap_or(false) {
                    return Err(Error::SelectorNotFound(selector.to_string()));
                }
            }
        }
        debug!(selector, "Clicked");
        Ok(())
    }

    async fn hover(&self, selector: &str) -> Result<()> {
        self.pace().await;
        if let Some((x, y)) = self.element_center(selector).await? {
            self.cdp.move_mouse(x, y).await?;
        }
        Ok(())
    }

    async fn focus(&self, selector: &str) -> Result<()> {
        let focused = self.evaluate(scripts::FOCUS, vec![json!(selector)]).await?;
        if !focused.as_bool().unwrap_or(false) {
            return Err(Error::SelectorNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn set_input_value(&self, selector: &str, text: &str) -> Result<()> {
        self.pace().await;
        let ok = self
            .evaluate(scripts::SET_INPUT_VALUE, vec![json!(selector), json!(text)])
            .await?;
        if !ok.as_bool().unwrap_or(false) {
            return Err(Error::SelectorNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.pace().await;
        self.cdp.press(&KeyStroke::named(key)).await
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let args = args
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.cdp.evaluate_js(&format!("({})({})", script, args)).await
    }

    async fn add_init_script(&self, source: &str) -> Result<()> {
        self.cdp.add_script_on_new_document(source).await
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.cdp
            .set_cookies(cookies.iter().map(Cookie::to_cdp).collect())
            .await
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.cdp.set_user_agent(user_agent).await
    }

    async fn block_resources(&self, patterns: &[String]) -> Result<()> {
        self.cdp.set_blocked_urls(patterns).await
    }

    async fn expose_host_function(&self, name: &str, handler: HostHandler) -> Result<HostFunction> {
        let mut events = self.cdp.subscribe_event("Runtime.bindingCalled").await;
        self.cdp.add_binding(name).await?;
        let binding = name.to_string();
        let task = tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                if ev.get("name").and_then(|v| v.as_str()) != Some(binding.as_str()) {
                    continue;
                }
                let raw = ev.get("payload").and_then(|v| v.as_str()).unwrap_or("");
                let payload =
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                handler(payload);
            }
        });
        Ok(HostFunction::new(name, Some(task)))
    }

    async fn register_mutation_bridge(
        &self,
        root_selector: &str,
        chrome: &[String],
        binding: &str,
    ) -> Result<()> {
        self.evaluate(
            scripts::INSTALL_MUTATION_BRIDGE,
            vec![json!(root_selector), json!(chrome), json!(binding)],
        )
        .await?;
        Ok(())
    }

    async fn remove_mutation_bridge(&self, binding: &str) -> Result<()> {
        self.evaluate(scripts::REMOVE_MUTATION_BRIDGE, vec![json!(binding)])
            .await?;
        if let Err(e) = self.cdp.remove_binding(binding).await {
            debug!(binding, error = %e, "Runtime.removeBinding failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.cdp.close_browser().await {
            debug!("CDP Browser.close failed (may already be closed): {}", e);
        }
        let child = self.process.lock().ok().and_then(|mut g| g.take());
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill browser process");
            }
        }
        Ok(())
    }
}
