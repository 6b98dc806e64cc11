//! Browser process launch and CDP page discovery.
//!
//! Starts a Chromium-family browser with remote debugging enabled, waits
//! for its DevTools endpoint and connects to the first page target.

use async_trait::async_trait;
use chatrelay_core::{BrowserConfig, Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cdp::CdpClient;
use crate::driver::{CdpPageDriver, PageDriver};

const DEVTOOLS_POLL: Duration = Duration::from_millis(200);
const PAGE_TARGET_ATTEMPTS: u32 = 10;
const PAGE_TARGET_DELAY: Duration = Duration::from_millis(300);

/// Produces a fresh page. The session manager calls this whenever the
/// previous page is gone.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>>;
}

pub struct ChromeLauncher {
    config: BrowserConfig,
    profile_dir: PathBuf,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig, profile_dir: PathBuf) -> Self {
        Self {
            config,
            profile_dir,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn PageDriver>> {
        let browser_path = match &self.config.browser_path {
            Some(path) => path.clone(),
            None => find_browser_binary().ok_or_else(|| {
                Error::Config("no Chrome, Chromium or Edge installation found; set browser.browserPath".into())
            })?,
        };

        std::fs::create_dir_all(&self.profile_dir)?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(&self.config, debug_port, &self.profile_dir);

        info!(
            port = debug_port,
            headless = self.config.headless,
            browser = %browser_path,
            "Launching browser"
        );

        let child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("cannot start {}: {}", browser_path, e)))?;

        let devtools = DevTools::new(debug_port);
        devtools
            .wait_ready(Duration::from_millis(self.config.launch_timeout_ms))
            .await?;
        let page_ws_url = devtools.page_target().await?;
        let cdp = CdpClient::connect(&page_ws_url).await?;
        for domain in ["Page", "Runtime", "Network"] {
            cdp.enable_domain(domain).await?;
        }
        cdp.enable_lifecycle_events().await?;

        info!(ws_url = %page_ws_url, "Attached to page target");

        Ok(Arc::new(CdpPageDriver::new(
            cdp,
            Some(child),
            Duration::from_millis(self.config.slow_mo_ms),
        )))
    }
}

fn build_browser_args(config: &BrowserConfig, debug_port: u16, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--disable-gpu".to_string(),
        "--disable-software-rasterizer".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--no-zygote".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        "--password-store=basic".to_string(),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
        args.push("--window-size=1280,900".to_string());
    } else {
        args.push("--start-maximized".to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

#[cfg(target_os = "macos")]
const BROWSER_CANDIDATES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

#[cfg(target_os = "windows")]
const BROWSER_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "microsoft-edge",
    "microsoft-edge-stable",
];

/// First installed Chromium-family browser: absolute candidates must
/// exist, bare names are looked up on `PATH`.
pub fn find_browser_binary() -> Option<String> {
    BROWSER_CANDIDATES
        .iter()
        .find(|candidate| {
            let path = Path::new(candidate);
            if path.is_absolute() {
                path.exists()
            } else {
                which::which(candidate).is_ok()
            }
        })
        .map(|candidate| candidate.to_string())
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// The HTTP side of a browser's remote-debugging port.
struct DevTools {
    base: String,
    http: reqwest::Client,
}

impl DevTools {
    fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{}", port),
            http: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        let resp = self.http.get(format!("{}{}", self.base, path)).send().await.ok()?;
        resp.json().await.ok()
    }

    /// Poll `/json/version` until the endpoint answers or `timeout` passes.
    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let version = self.get_json("/json/version").await;
            if let Some(browser) = version.as_ref().and_then(|v| v.get("Browser")).and_then(Value::as_str) {
                debug!(browser, "DevTools endpoint up");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "DevTools endpoint {} silent after {}ms",
                    self.base,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(DEVTOOLS_POLL).await;
        }
    }

    /// WebSocket URL of the first page target. The initial tab can show up
    /// a moment after the endpoint itself.
    async fn page_target(&self) -> Result<String> {
        for attempt in 0..PAGE_TARGET_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PAGE_TARGET_DELAY).await;
            }
            let targets = match self.get_json("/json/list").await {
                Some(Value::Array(targets)) => targets,
                _ => continue,
            };
            if let Some(ws_url) = first_page_ws_url(&targets) {
                return Ok(ws_url);
            }
            debug!(attempt, targets = targets.len(), "No page target yet");
        }
        Err(Error::Cdp(format!("{} lists no page target", self.base)))
    }
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(Value::as_str))
        .map(str::to_string)
}
