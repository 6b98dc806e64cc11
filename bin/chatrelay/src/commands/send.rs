use chatrelay_browser::{ChatRelay, StreamEvent};
use chatrelay_core::{ApiError, ChatMode, Message};
use std::io::Write;
use std::sync::Arc;

/// Render an [`ApiError`] for the terminal: code, message and details.
pub(crate) fn describe(e: ApiError) -> anyhow::Error {
    let code = e.code.map(|c| c.as_str()).unwrap_or("error");
    match e.details {
        Some(details) => anyhow::anyhow!("{}: {} ({})", code, e.message, details),
        None => anyhow::anyhow!("{}: {}", code, e.message),
    }
}

pub async fn run(message: &str, mode: Option<ChatMode>, stream: bool) -> anyhow::Result<()> {
    let (_config, relay) = super::load_relay()?;
    let history = [Message::user(message)];

    let result = if stream {
        stream_reply(&relay, &history, mode).await
    } else {
        relay
            .send_synchronous(&history, mode)
            .await
            .map(|reply| {
                tracing::debug!(signal = ?reply.signal, cleanup = ?reply.cleanup, "Reply received");
                println!("{}", reply.reply_text);
            })
            .map_err(describe)
    };

    // a streamed submission is cleaned up after its last event
    relay.wait_idle().await;
    relay.close().await;
    result
}

async fn stream_reply(relay: &Arc<ChatRelay>, history: &[Message], mode: Option<ChatMode>) -> anyhow::Result<()> {
    let mut events = relay.open_stream(history, mode).await.map_err(describe)?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next_event().await {
        match event {
            StreamEvent::Delta(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            StreamEvent::Done => {
                println!();
                return Ok(());
            }
            StreamEvent::Error(e) => {
                println!();
                return Err(describe(e));
            }
        }
    }
    anyhow::bail!("stream ended without a terminal event")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::ErrorCode;

    #[test]
    fn test_describe() {
        let e = ApiError::new(ErrorCode::ResponseTimeout, "Response not completed in time")
            .with_details("busy indicator never seen");
        assert_eq!(
            describe(e).to_string(),
            "response_timeout: Response not completed in time (busy indicator never seen)"
        );
        assert_eq!(describe(ApiError::internal("boom")).to_string(), "error: boom");
    }
}
