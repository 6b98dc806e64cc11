pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use config::{AutomationConfig, BrowserConfig, CleanupPolicy, Config, GatewayConfig, Selectors};
pub use error::{ApiError, Error, ErrorCode, ErrorType, Result};
pub use message::{ChatMode, Message, Role};
pub use paths::Paths;
