use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".chatrelay"))
            .unwrap_or_else(|| PathBuf::from(".chatrelay"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Saved login (cookie bundle) used when `browser.cookiesPath` is unset.
    pub fn cookies_file(&self) -> PathBuf {
        self.base.join("cookies.json")
    }

    /// Chrome user-data directory for the automated profile.
    pub fn browser_profile_dir(&self) -> PathBuf {
        self.base.join("browser").join("profile")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths::with_base(PathBuf::from("/tmp/relay"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/relay/config.json"));
        assert_eq!(paths.cookies_file(), PathBuf::from("/tmp/relay/cookies.json"));
        assert_eq!(
            paths.browser_profile_dir(),
            PathBuf::from("/tmp/relay/browser/profile")
        );
    }
}
