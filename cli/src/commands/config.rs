//! Config command - show or initialize settings.

use anyhow::Result;
use podforward_core::{Settings, SettingsStore};

pub fn show(store: &SettingsStore, settings: &Settings, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(settings)?);
        return Ok(());
    }

    println!("Configuration ({})", store.path().display());
    println!("{}", "-".repeat(40));
    println!("Default namespace:     {}", settings.default_namespace);
    println!("Bind address:          {}", settings.bind_address);
    println!("Stream reply timeout:  {} ms", settings.stream_reply_timeout_ms);
    println!("Error stream grace:    {} ms", settings.error_stream_grace_ms);
    println!("Close grace:           {} ms", settings.close_grace_ms);
    match settings.worker_threads {
        Some(threads) => println!("Worker threads:        {}", threads),
        None => println!("Worker threads:        (one per core)"),
    }
    println!("Log level:             {}", settings.log_level);
    Ok(())
}

/// Write defaults unless a config file already exists.
pub async fn init(store: &SettingsStore) -> Result<()> {
    if tokio::fs::try_exists(store.path()).await? {
        println!("Config already exists at {}", store.path().display());
        return Ok(());
    }
    store.save(&Settings::default()).await?;
    println!("Wrote default config to {}", store.path().display());
    Ok(())
}
