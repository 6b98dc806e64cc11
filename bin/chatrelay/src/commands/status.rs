use chatrelay_core::Paths;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let (config, relay) = super::load_relay()?;

    println!("chatrelay status");
    println!("================");
    println!();

    let config_path = paths.config_file();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    let cookies_path = config.cookies_path(&paths);
    println!(
        "Cookies:   {} {}",
        cookies_path.display(),
        if cookies_path.exists() { "✓" } else { "✗ (not logged in)" }
    );
    println!("Chat URL:  {}", config.browser.chat_url);
    println!("Mode:      {}", config.automation.default_mode);
    println!();

    let status = relay.status().await;
    println!(
        "Session:   {}",
        if status.ready { "✓ ready" } else { "✗ not ready (run with --verbose for details)" }
    );
    relay.close().await;
    Ok(())
}
