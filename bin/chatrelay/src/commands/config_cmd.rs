use chatrelay_core::{Config, Paths};

/// Show the effective configuration (file plus environment) as JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", paths.config_file().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    if write_default(&paths, force)? {
        println!("✓ Default config written: {}", paths.config_file().display());
    } else {
        println!(
            "Config already exists: {} (use --force to overwrite)",
            paths.config_file().display()
        );
    }
    Ok(())
}

/// Write the default config unless one exists. Returns whether it wrote.
fn write_default(paths: &Paths, force: bool) -> anyhow::Result<bool> {
    let path = paths.config_file();
    if path.exists() && !force {
        return Ok(false);
    }
    Config::default().save(&path)?;
    Ok(true)
}
