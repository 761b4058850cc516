//! `dialoguard serve` — Start the HTTP API server.

use std::path::Path;

use super::load_config;

pub async fn run(config_path: Option<&Path>, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        return Err("No API key configured. Set DIALOGUARD_API_KEY or add api_key to the config file.".into());
    }

    println!("Dialoguard Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.model);
    println!("   Store:     {}", config.store.backend);

    dialoguard_gateway::start(config).await?;

    Ok(())
}
