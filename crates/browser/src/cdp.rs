//! DevTools protocol transport: one WebSocket to a page target, commands
//! matched to replies by id, events fanned out to subscribers.

use chatrelay_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = std::result::Result<Value, String>;

/// One inbound protocol message.
#[derive(Debug, PartialEq)]
enum Frame {
    Reply { id: u64, outcome: Reply },
    Event { method: String, params: Value },
}

fn parse_frame(text: &str) -> Option<Frame> {
    let v: Value = serde_json::from_str(text).ok()?;
    if let Some(id) = v.get("id").and_then(Value::as_u64) {
        let outcome = match v.get("error") {
            Some(err) => Err(err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string())),
            None => Ok(v.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(Frame::Reply { id, outcome });
    }
    let method = v.get("method").and_then(Value::as_str)?.to_string();
    let params = v.get("params").cloned().unwrap_or(Value::Null);
    Some(Frame::Event { method, params })
}

/// Waiting callers and event subscribers. Once `closed`, nothing new is
/// accepted and every waiter has been dropped.
#[derive(Default)]
struct Router {
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    listeners: HashMap<String, Vec<mpsc::Sender<Value>>>,
    closed: bool,
}

impl Router {
    fn route(&mut self, frame: Frame) {
        match frame {
            Frame::Reply { id, outcome } => {
                if let Some(waiter) = self.pending.remove(&id) {
                    let _ = waiter.send(outcome);
                }
            }
            Frame::Event { method, params } => {
                if let Some(subscribers) = self.listeners.get_mut(&method) {
                    subscribers.retain(|tx| !tx.is_closed());
                    for tx in subscribers.iter() {
                        let _ = tx.try_send(params.clone());
                    }
                }
            }
        }
    }

    fn shut(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.listeners.clear();
    }
}

fn lock(router: &Mutex<Router>) -> MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
enum Mouse {
    Moved,
    Pressed,
    Released,
}

impl Mouse {
    fn params(self, x: f64, y: f64) -> Value {
        let (kind, button, clicks) = match self {
            Self::Moved => ("mouseMoved", "none", 0),
            Self::Pressed => ("mousePressed", "left", 1),
            Self::Released => ("mouseReleased", "left", 1),
        };
        json!({ "type": kind, "x": x, "y": y, "button": button, "clickCount": clicks })
    }
}

/// A named key as the Input domain wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStroke {
    key: String,
    code: String,
    virtual_code: Option<i32>,
}

impl KeyStroke {
    pub fn named(key: &str) -> Self {
        let virtual_code = match key {
            "Enter" => Some(13),
            "Escape" => Some(27),
            "Tab" => Some(9),
            "Backspace" => Some(8),
            _ => None,
        };
        Self {
            key: key.to_string(),
            code: key.to_string(),
            virtual_code,
        }
    }

    fn params(&self, down: bool) -> Value {
        let mut params = json!({
            "type": if down { "keyDown" } else { "keyUp" },
            "key": self.key,
            "code": self.code,
        });
        if let Some(vk) = self.virtual_code {
            params["windowsVirtualKeyCode"] = json!(vk);
            params["nativeVirtualKeyCode"] = json!(vk);
        }
        // Enter only submits a form when the keydown carries its text
        if down && self.key == "Enter" {
            params["text"] = json!("\r");
        }
        params
    }
}

pub struct CdpClient {
    outbox: mpsc::Sender<String>,
    router: Arc<Mutex<Router>>,
    seq: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let (socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| Error::Cdp(format!("cannot reach DevTools endpoint {}: {}", ws_url, e)))?;
        let (mut sink, mut source) = socket.split();
        let (outbox, mut queued) = mpsc::channel::<String>(256);
        let router = Arc::new(Mutex::new(Router::default()));

        let writer_router = router.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = queued.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "DevTools socket write failed");
                    lock(&writer_router).shut();
                    break;
                }
            }
        });

        let reader_router = router.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(frame) = parse_frame(&text) {
                            lock(&reader_router).route(frame);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("DevTools socket closed by the browser");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "DevTools socket read failed");
                        break;
                    }
                    Ok(_) => {}
                }
            }
            lock(&reader_router).shut();
        });

        Ok(Self {
            outbox,
            router,
            seq: AtomicU64::new(1),
            tasks: vec![writer, reader],
        })
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.router).closed || self.outbox.is_closed()
    }

    /// Send one command and wait for its reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let reply = {
            let mut router = lock(&self.router);
            if router.closed {
                return Err(Error::SessionClosed(format!("connection gone before '{}'", method)));
            }
            let (tx, rx) = oneshot::channel();
            router.pending.insert(id, tx);
            rx
        };

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        if self.outbox.send(frame).await.is_err() {
            lock(&self.router).pending.remove(&id);
            return Err(Error::SessionClosed(format!("connection gone while sending '{}'", method)));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, reply).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::Cdp(format!("{} failed: {}", method, message))),
            Ok(Err(_)) => Err(Error::SessionClosed(format!("connection dropped during '{}'", method))),
            Err(_) => {
                lock(&self.router).pending.remove(&id);
                Err(Error::Cdp(format!(
                    "'{}' unanswered after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    async fn call_unit(&self, method: &str, params: Value) -> Result<()> {
        self.call(method, params).await.map(|_| ())
    }

    /// Params of every later `method` event. The receiver ends when the
    /// connection does.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let mut router = lock(&self.router);
        if !router.closed {
            router.listeners.entry(method.to_string()).or_default().push(tx);
        }
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.call_unit(&format!("{}.enable", domain), json!({})).await
    }

    /// Emit `Page.lifecycleEvent` (DOMContentLoaded, load, networkIdle...).
    pub async fn enable_lifecycle_events(&self) -> Result<()> {
        self.call_unit("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await
    }

    /// Start a navigation; returns the id of the frame being navigated.
    pub async fn navigate(&self, url: &str) -> Result<Option<String>> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(err) = result.get("errorText").and_then(Value::as_str) {
            return Err(Error::Cdp(format!("navigation to {} failed: {}", url, err)));
        }
        Ok(result.get("frameId").and_then(Value::as_str).map(str::to_string))
    }

    pub async fn reload(&self) -> Result<()> {
        self.call_unit("Page.reload", json!({ "ignoreCache": false })).await
    }

    /// Evaluate `expression`, awaiting a returned promise. A thrown
    /// exception becomes [`Error::Script`].
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            return Err(Error::Script(text.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    pub async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.call_unit("Input.dispatchMouseEvent", Mouse::Moved.params(x, y))
            .await
    }

    /// Move, press and release the left button at `(x, y)`.
    pub async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        for step in [Mouse::Moved, Mouse::Pressed, Mouse::Released] {
            self.call_unit("Input.dispatchMouseEvent", step.params(x, y))
                .await?;
        }
        Ok(())
    }

    pub async fn press(&self, stroke: &KeyStroke) -> Result<()> {
        self.call_unit("Input.dispatchKeyEvent", stroke.params(true)).await?;
        self.call_unit("Input.dispatchKeyEvent", stroke.params(false)).await
    }

    pub async fn set_cookies(&self, cookies: Vec<Value>) -> Result<()> {
        self.call_unit("Network.setCookies", json!({ "cookies": cookies }))
            .await
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.call_unit("Network.setUserAgentOverride", json!({ "userAgent": user_agent }))
            .await
    }

    /// Drop requests whose URL matches one of `patterns` (`*` wildcards).
    pub async fn set_blocked_urls(&self, patterns: &[String]) -> Result<()> {
        self.call_unit("Network.setBlockedURLs", json!({ "urls": patterns }))
            .await
    }

    /// Run `source` in every new document before the page's own scripts.
    pub async fn add_script_on_new_document(&self, source: &str) -> Result<()> {
        self.call_unit("Page.addScriptToEvaluateOnNewDocument", json!({ "source": source }))
            .await
    }

    /// Expose `window[name](payload)`; calls arrive as `Runtime.bindingCalled`.
    pub async fn add_binding(&self, name: &str) -> Result<()> {
        self.call_unit("Runtime.addBinding", json!({ "name": name })).await
    }

    pub async fn remove_binding(&self, name: &str) -> Result<()> {
        self.call_unit("Runtime.removeBinding", json!({ "name": name })).await
    }

    pub async fn close_browser(&self) -> Result<()> {
        self.call_unit("Browser.close", json!({})).await
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
