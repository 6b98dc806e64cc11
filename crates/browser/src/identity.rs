//! Saved login: the cookie bundle exported from a logged-in browser.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

/// One cookie in the usual browser-export shape (puppeteer / DevTools).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Seconds since epoch; negative or absent for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

impl Cookie {
    /// `Network.CookieParam` for `Network.setCookies`.
    pub fn to_cdp(&self) -> Value {
        let mut v = json!({
            "name": self.name,
            "value": self.value,
            "httpOnly": self.http_only,
            "secure": self.secure,
        });
        if let Some(domain) = &self.domain {
            v["domain"] = json!(domain);
        }
        if let Some(path) = &self.path {
            v["path"] = json!(path);
        }
        if let Some(expires) = self.expires.filter(|e| *e > 0.0) {
            v["expires"] = json!(expires);
        }
        if let Some(same_site) = self.same_site.as_deref().and_then(normalize_same_site) {
            v["sameSite"] = json!(same_site);
        }
        v
    }
}

fn normalize_same_site(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => Some("Strict"),
        "lax" => Some("Lax"),
        "none" | "no_restriction" => Some("None"),
        _ => None,
    }
}

/// Identity injected into a fresh page.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub cookies: Vec<Cookie>,
    pub user_agent: Option<String>,
}

impl Identity {
    /// Read the cookie bundle at `path`. A missing or malformed file is not
    /// an error: the session simply starts logged out.
    pub fn load(path: &Path, user_agent: Option<String>) -> Self {
        let cookies = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<Cookie>>(&raw) {
                Ok(cookies) => {
                    info!(path = %path.display(), count = cookies.len(), "Loaded saved cookies");
                    cookies
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cookie file unreadable, continuing without login");
                    Vec::new()
                }
            },
            Err(_) => {
                warn!(path = %path.display(), "Cookie file not found, continuing without login");
                Vec::new()
            }
        };
        Self { cookies, user_agent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load(&dir.path().join("cookies.json"), None);
        assert!(id.cookies.is_empty());
    }

    #[test]
    fn test_load_malformed_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Identity::load(&path, None).cookies.is_empty());
    }

    #[test]
    fn test_puppeteer_export_to_cdp() {
        let raw = r#"[{
            "name": "__Secure-next-auth.session-token",
            "value": "abc",
            "domain": ".chatgpt.com",
            "path": "/",
            "expires": -1,
            "size": 10,
            "httpOnly": true,
            "secure": true,
            "session": true,
            "sameSite": "lax"
        }]"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, raw).unwrap();
        let id = Identity::load(&path, Some("UA".into()));
        assert_eq!(id.cookies.len(), 1);
        let cdp = id.cookies[0].to_cdp();
        assert_eq!(cdp["domain"], ".chatgpt.com");
        assert_eq!(cdp["sameSite"], "Lax");
        assert_eq!(cdp["httpOnly"], true);
        assert!(cdp.get("expires").is_none());
    }
}
