//! Incremental text from full-text snapshots.
//!
//! Two producers feed one snapshot channel: a page-side MutationObserver
//! pushing through an exposed host function, and a poller reading the
//! answer region on a timer. A single consumer turns the snapshots into
//! deltas and ends the stream after an idle window without new content.

use chatrelay_core::{ApiError, AutomationConfig, Error, ErrorCode, Selectors};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::driver::{HostHandler, PageDriver};
use crate::snapshot::{read_answer, Snapshot};

static BRIDGE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(ApiError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

/// What one snapshot did to the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Identical to the previous snapshot.
    Duplicate,
    /// Text past the cursor.
    Delta(String),
    /// New text that reaches no further than the cursor (a shrink, or an
    /// in-place rewrite of text that was already sent).
    Held,
}

/// Per-submission cursor over the snapshot history.
///
/// The cursor is the byte length of `basis`, the last snapshot that
/// produced a delta. A snapshot extending `basis` yields its suffix; one
/// that rewrote earlier text resumes at the cursor, so growth after a
/// re-render is never dropped.
#[derive(Debug, Default)]
pub struct StreamState {
    basis: String,
    emitted: String,
    last_seen: String,
    terminal: bool,
}

/// Largest char boundary of `text` at or below `index`.
fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes delivered so far.
    pub fn emitted_len(&self) -> usize {
        self.emitted.len()
    }

    /// Concatenation of every delta delivered so far.
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn finish(&mut self) {
        self.terminal = true;
    }

    pub fn push(&mut self, text: &str) -> Advance {
        if self.terminal || text == self.last_seen {
            return Advance::Duplicate;
        }
        self.last_seen = text.to_string();

        let start = match text.strip_prefix(self.basis.as_str()) {
            Some(_) => self.basis.len(),
            None => {
                warn!(
                    cursor = self.basis.len(),
                    snapshot = text.len(),
                    "Snapshot rewrote emitted text, resuming at the cursor"
                );
                floor_char_boundary(text, self.basis.len())
            }
        };
        if start >= text.len() {
            return Advance::Held;
        }

        let delta = text[start..].to_string();
        self.emitted.push_str(&delta);
        self.basis = text.to_string();
        Advance::Delta(delta)
    }
}

/// Consume snapshots until the idle window passes after the last new
/// content, or `timeout` passes overall. Deltas go to `events`; the
/// terminal event is returned to the caller.
pub(crate) async fn drive(
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
    events: &mpsc::Sender<StreamEvent>,
    baseline: u64,
    idle: Duration,
    timeout: Duration,
) -> StreamEvent {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut state = StreamState::new();
    // armed by the first new content
    let mut idle_deadline: Option<Instant> = None;

    let terminal = loop {
        let wake = idle_deadline.map_or(deadline, |d| d.min(deadline));
        tokio::select! {
            received = snapshots.recv() => {
                let Some(snapshot) = received else {
                    break if state.emitted_len() > 0 {
                        StreamEvent::Done
                    } else {
                        StreamEvent::Error(ApiError::new(
                            ErrorCode::StreamBridgeFailed,
                            "Snapshot producers stopped before any content arrived",
                        ))
                    };
                };
                match state.push(snapshot.text_after(baseline)) {
                    Advance::Duplicate => {}
                    Advance::Held => idle_deadline = Some(Instant::now() + idle),
                    Advance::Delta(delta) => {
                        idle_deadline = Some(Instant::now() + idle);
                        if events.send(StreamEvent::Delta(delta)).await.is_err() {
                            debug!("Stream consumer went away");
                            break StreamEvent::Done;
                        }
                    }
                }
            }
            _ = events.closed() => {
                debug!("Stream consumer went away");
                break StreamEvent::Done;
            }
            _ = tokio::time::sleep_until(wake) => {
                if idle_deadline.is_some_and(|d| Instant::now() >= d) {
                    break StreamEvent::Done;
                }
                break StreamEvent::Error(
                    ApiError::new(ErrorCode::ResponseTimeout, "Response not completed in time")
                        .with_details(format!(
                            "stream open {}ms, {} bytes delivered",
                            start.elapsed().as_millis(),
                            state.emitted_len()
                        )),
                );
            }
        }
    };

    state.finish();
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        bytes = state.emitted_len(),
        terminal = ?terminal,
        "Delta stream finished"
    );
    terminal
}

async fn poll_snapshots(
    page: Arc<dyn PageDriver>,
    selectors: Selectors,
    interval: Duration,
    tx: mpsc::UnboundedSender<Snapshot>,
) {
    loop {
        match read_answer(page.as_ref(), &selectors).await {
            Ok(snapshot) => {
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
            Err(e) if !page.is_alive() => {
                debug!(error = %e, "Page gone, snapshot poller stopping");
                break;
            }
            Err(e) => debug!(error = %e, "Snapshot poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

fn bridge_failed(err: Error) -> ApiError {
    ApiError::new(
        ErrorCode::StreamBridgeFailed,
        "Could not install the snapshot bridge",
    )
    .with_details(err.to_string())
}

/// Ordered events for one submission, ending with exactly one terminal
/// event. Usable as a [`futures::Stream`].
pub struct DeltaStream {
    events: mpsc::Receiver<StreamEvent>,
}

impl DeltaStream {
    pub fn from_receiver(events: mpsc::Receiver<StreamEvent>) -> Self {
        Self { events }
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Stream for DeltaStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.poll_recv(cx)
    }
}

pub struct DeltaStreamBridge {
    selectors: Selectors,
    automation: AutomationConfig,
}

impl DeltaStreamBridge {
    pub fn new(selectors: Selectors, automation: AutomationConfig) -> Self {
        Self {
            selectors,
            automation,
        }
    }

    /// Start observing the answer that follows `baseline` answer regions.
    /// Producers are torn down before the terminal event is delivered.
    pub async fn open(&self, page: Arc<dyn PageDriver>, baseline: u64) -> Result<DeltaStream, ApiError> {
        let binding = format!(
            "__chatrelaySnapshot{}",
            BRIDGE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let (snap_tx, snap_rx) = mpsc::unbounded_channel();

        let push_tx = snap_tx.clone();
        let handler: HostHandler = Arc::new(move |payload| match Snapshot::from_value(payload) {
            Some(snapshot) => {
                let _ = push_tx.send(snapshot);
            }
            None => debug!("Ignoring malformed snapshot payload"),
        });
        let host = page
            .expose_host_function(&binding, handler)
            .await
            .map_err(bridge_failed)?;
        if let Err(e) = page
            .register_mutation_bridge(
                &self.selectors.answer_region,
                &self.selectors.reply_chrome,
                &binding,
            )
            .await
        {
            drop(host);
            return Err(bridge_failed(e));
        }
        debug!(binding = %binding, baseline, "Snapshot bridge installed");

        let poller = tokio::spawn(poll_snapshots(
            page.clone(),
            self.selectors.clone(),
            Duration::from_millis(self.automation.poll_interval_ms.max(1)),
            snap_tx,
        ));

        let idle = Duration::from_millis(self.automation.idle_ms);
        let timeout = Duration::from_millis(self.automation.completion_timeout_ms);
        let (ev_tx, ev_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let terminal = drive(snap_rx, &ev_tx, baseline, idle, timeout).await;

            poller.abort();
            drop(host);
            if let Err(e) = page.remove_mutation_bridge(&binding).await {
                debug!(binding = %binding, error = %e, "Removing snapshot bridge failed");
            }

            let _ = ev_tx.send(terminal).await;
        });

        Ok(DeltaStream::from_receiver(ev_rx))
    }
}
