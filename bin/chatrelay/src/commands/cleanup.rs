use chatrelay_browser::CleanupOutcome;
use chatrelay_core::ChatMode;
use tracing::warn;

pub async fn run(mode: Option<ChatMode>, count: Option<usize>) -> anyhow::Result<()> {
    let (_config, relay) = super::load_relay()?;
    let mode = mode.unwrap_or(relay.default_mode());

    match (mode, count) {
        (ChatMode::Project, Some(count)) => {
            let deleted = relay.delete_all(count).await;
            println!("✓ Deleted {} of up to {} project conversation(s)", deleted, count);
        }
        (ChatMode::Temporary, Some(_)) => {
            warn!("--count only applies to project conversations, deleting the current one");
            report(relay.delete_current_context(mode).await);
        }
        (_, None) => report(relay.delete_current_context(mode).await),
    }

    relay.close().await;
    Ok(())
}

fn report(outcome: CleanupOutcome) {
    match outcome {
        CleanupOutcome::Deleted => println!("✓ Conversation deleted"),
        CleanupOutcome::Skipped(reason) => println!("- Nothing deleted: {}", reason),
        CleanupOutcome::Failed(reason) => println!("✗ Delete failed: {}", reason),
    }
}
