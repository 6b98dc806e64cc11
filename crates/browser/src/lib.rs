//! Browser automation core: a recoverable CDP session against a chat web
//! app, completion detection, and snapshot-to-delta streaming.
//!
//! Layering, leaves first: [`driver`] (page capabilities) <- [`session`]
//! <- [`lifecycle`] <- [`submit`] <- [`completion`] / [`stream`] <-
//! [`reply`], tied together by [`relay`].

pub mod cdp;
pub mod completion;
pub mod driver;
pub mod identity;
pub mod launcher;
pub mod lifecycle;
pub mod relay;
pub mod reply;
pub mod retry;
pub mod scripts;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod submit;

#[cfg(test)]
pub(crate) mod mock;

pub use completion::{CompletionDetector, CompletionSignal};
pub use driver::{CdpPageDriver, PageDriver, WaitPolicy};
pub use launcher::{BrowserLauncher, ChromeLauncher};
pub use lifecycle::{ChatLifecycleManager, CleanupOutcome, ContextState};
pub use relay::{ChatRelay, ChatReply, RelayStatus};
pub use retry::{retry_until_success, RetryPolicy};
pub use session::SessionManager;
pub use stream::{DeltaStream, DeltaStreamBridge, StreamEvent};
