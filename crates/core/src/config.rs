use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::ChatMode;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    /// Path of the project conversation link, e.g. `/g/g-p-.../project`.
    #[serde(default = "default_project_link")]
    pub project_link: String,
    #[serde(default)]
    pub headless: bool,
    /// Pause inserted before every page action, like puppeteer's slowMo.
    #[serde(default = "default_slow_mo_ms")]
    pub slow_mo_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// URL patterns dropped by the page (images, fonts, media).
    #[serde(default = "default_blocked_resources")]
    pub blocked_resources: Vec<String>,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    /// How long session init waits for the prompt input after navigating home.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Explicit browser binary; discovered on PATH when unset.
    #[serde(default)]
    pub browser_path: Option<String>,
    /// Saved login; defaults to `~/.chatrelay/cookies.json`.
    #[serde(default)]
    pub cookies_path: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_chat_url() -> String {
    "https://chatgpt.com/".to_string()
}

fn default_project_link() -> String {
    "/g/g-p-6879204074488191b4d06d1b76b5696f-game/project".to_string()
}

fn default_slow_mo_ms() -> u64 {
    5
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36".to_string()
}

fn default_blocked_resources() -> Vec<String> {
    [
        "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.ico", "*.woff", "*.woff2", "*.ttf",
        "*.otf", "*.mp4", "*.webm", "*.mp3", "*.wav",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_launch_timeout_ms() -> u64 {
    15_000
}

fn default_navigation_timeout_ms() -> u64 {
    120_000
}

fn default_ready_timeout_ms() -> u64 {
    60_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chat_url: default_chat_url(),
            project_link: default_project_link(),
            headless: false,
            slow_mo_ms: default_slow_mo_ms(),
            user_agent: default_user_agent(),
            blocked_resources: default_blocked_resources(),
            launch_timeout_ms: default_launch_timeout_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            browser_path: None,
            cookies_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserConfig {
    /// Absolute URL of the project conversation.
    pub fn project_url(&self) -> String {
        format!("{}{}", self.chat_url.trim_end_matches('/'), self.project_link)
    }
}

/// When the conversation created by a request is deleted afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Always,
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default)]
    pub default_mode: ChatMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Quiet period after which unchanged content counts as settled.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// How long the busy indicator may take to appear before the detector
    /// stops trusting it and falls back to content stability.
    #[serde(default = "default_busy_grace_ms")]
    pub busy_grace_ms: u64,
    #[serde(default = "default_reply_retries")]
    pub reply_retries: u32,
    #[serde(default = "default_reply_retry_delay_ms")]
    pub reply_retry_delay_ms: u64,
    #[serde(default = "default_enter_retries")]
    pub enter_retries: u32,
    #[serde(default = "default_enter_retry_delay_ms")]
    pub enter_retry_delay_ms: u64,
    #[serde(default = "default_input_retries")]
    pub input_retries: u32,
    #[serde(default = "default_input_retry_delay_ms")]
    pub input_retry_delay_ms: u64,
    /// Bounded wait for selectors during navigation and input.
    #[serde(default = "default_selector_timeout_ms")]
    pub selector_timeout_ms: u64,
    #[serde(default = "default_menu_settle_ms")]
    pub menu_settle_ms: u64,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Replies starting with one of these are upstream failures, not answers.
    #[serde(default = "default_invalid_reply_markers")]
    pub invalid_reply_markers: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    300
}

fn default_idle_ms() -> u64 {
    1200
}

fn default_completion_timeout_ms() -> u64 {
    60_000
}

fn default_busy_grace_ms() -> u64 {
    3000
}

fn default_reply_retries() -> u32 {
    5
}

fn default_reply_retry_delay_ms() -> u64 {
    300
}

fn default_enter_retries() -> u32 {
    3
}

fn default_enter_retry_delay_ms() -> u64 {
    2000
}

fn default_input_retries() -> u32 {
    3
}

fn default_input_retry_delay_ms() -> u64 {
    300
}

fn default_selector_timeout_ms() -> u64 {
    30_000
}

fn default_menu_settle_ms() -> u64 {
    200
}

fn default_invalid_reply_markers() -> Vec<String> {
    vec!["⚠️".to_string()]
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            default_mode: ChatMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_ms: default_idle_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            busy_grace_ms: default_busy_grace_ms(),
            reply_retries: default_reply_retries(),
            reply_retry_delay_ms: default_reply_retry_delay_ms(),
            enter_retries: default_enter_retries(),
            enter_retry_delay_ms: default_enter_retry_delay_ms(),
            input_retries: default_input_retries(),
            input_retry_delay_ms: default_input_retry_delay_ms(),
            selector_timeout_ms: default_selector_timeout_ms(),
            menu_settle_ms: default_menu_settle_ms(),
            cleanup: CleanupPolicy::default(),
            invalid_reply_markers: default_invalid_reply_markers(),
        }
    }
}

/// Every CSS selector the automation touches. When the remote UI drifts,
/// this table is the only thing that should need editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selectors {
    pub prompt_input: String,
    /// Rendered answer blocks; the last match is the current answer.
    pub answer_region: String,
    /// Present only while an answer is being generated.
    pub busy_indicator: String,
    /// Present and enabled once generation has ended.
    pub ready_indicator: String,
    pub home_link: String,
    pub header_actions: String,
    pub temporary_toggle: String,
    /// Only rendered while a temporary chat is open.
    pub temporary_close: String,
    pub project_root: String,
    pub conversation_item: String,
    /// Menu trigger, relative to `conversation_item`.
    pub conversation_menu_button: String,
    pub conversation_options: String,
    pub delete_menu_item: String,
    pub delete_confirm: String,
    /// Toolbars and copy/regenerate controls stripped from replies.
    pub reply_chrome: Vec<String>,
    /// Scrollable code-like regions re-wrapped as fenced blocks.
    pub code_scroller: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            prompt_input: "#prompt-textarea".to_string(),
            answer_region: "div.markdown".to_string(),
            busy_indicator: r#"[data-testid="stop-button"]"#.to_string(),
            ready_indicator: r#"[data-testid="composer-speech-button"]"#.to_string(),
            home_link: r#"a[href="/"]"#.to_string(),
            header_actions: "#conversation-header-actions".to_string(),
            temporary_toggle: r#"#conversation-header-actions button[aria-label*="Temporary"]"#
                .to_string(),
            temporary_close: r#"[data-testid="close-temporary-chat-button"]"#.to_string(),
            project_root: "#thread div.mt-8.mb-14.contain-inline-size".to_string(),
            conversation_item: ".group.relative.flex.flex-col.gap-1.p-3".to_string(),
            conversation_menu_button: "button svg.icon".to_string(),
            conversation_options: r#"[data-testid="conversation-options-button"]"#.to_string(),
            delete_menu_item: r#"[data-testid="delete-chat-menu-item"]"#.to_string(),
            delete_confirm: r#"[data-testid="delete-conversation-confirm-button"]"#.to_string(),
            reply_chrome: vec![
                ".flex.items-center.text-token-text-secondary.px-4.py-2.text-xs.font-sans.justify-between.h-9.bg-token-sidebar-surface-primary.select-none.rounded-t-2xl".to_string(),
                ".flex.gap-1.items-center.select-none.py-1".to_string(),
                ".flex.items-center.gap-1.py-1.select-none".to_string(),
            ],
            code_scroller: ".overflow-y-auto.p-4".to_string(),
        }
    }
}

impl Selectors {
    pub fn project_link(&self, link: &str) -> String {
        format!(r#"a[href="{}"]"#, link)
    }

    pub fn conversation_menu(&self) -> String {
        format!("{} {}", self.conversation_item, self.conversation_menu_button)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Overall deadline for one request, on top of the core's own timeouts.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_upstream_timeout_ms() -> u64 {
    90_000
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.browser.chat_url)
            .map_err(|e| Error::Config(format!("invalid chatUrl '{}': {}", self.browser.chat_url, e)))?;
        if !self.browser.project_link.starts_with('/') {
            return Err(Error::Config(format!(
                "projectLink must be a path starting with '/': {}",
                self.browser.project_link
            )));
        }
        if self.automation.poll_interval_ms == 0 {
            return Err(Error::Config("automation.pollIntervalMs must be > 0".into()));
        }
        Ok(())
    }

    /// Apply the process environment on top of the file configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("COOKIES_PATH") {
            self.browser.cookies_path = Some(v);
        }
        if let Some(v) = get("CHAT_URL") {
            self.browser.chat_url = v;
        }
        if let Some(v) = get("PROJECT_LINK") {
            self.browser.project_link = v;
        }
        if let Some(v) = get("HEADLESS") {
            self.browser.headless = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("SLOW_MO") {
            match v.trim().parse() {
                Ok(ms) => self.browser.slow_mo_ms = ms,
                Err(_) => warn!(value = %v, "Ignoring non-numeric SLOW_MO"),
            }
        }
        if let Some(v) = get("PORT") {
            match v.trim().parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => warn!(value = %v, "Ignoring invalid PORT"),
            }
        }
        if let Some(v) = get("UPSTREAM_TIMEOUT_MS") {
            match v.trim().parse() {
                Ok(ms) => self.gateway.upstream_timeout_ms = ms,
                Err(_) => warn!(value = %v, "Ignoring invalid UPSTREAM_TIMEOUT_MS"),
            }
        }
    }

    pub fn cookies_path(&self, paths: &Paths) -> PathBuf {
        self.browser
            .cookies_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.cookies_file())
    }
}
