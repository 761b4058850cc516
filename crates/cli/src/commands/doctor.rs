//! `dialoguard doctor` — Diagnose configuration and storage.

use std::path::Path;

use dialoguard_progress::TopicCatalog;

use super::{config_location, load_config};

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Dialoguard Doctor — System Diagnostics");
    println!("======================================\n");

    let mut issues = 0;

    let location = config_location(config_path);
    if !location.exists() {
        println!("  ⚠️  No config file at {} — using defaults", location.display());
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  1 issue found. Fix the config before continuing.");
            return Ok(());
        }
    };

    if config.has_api_key() {
        println!("  ✅ API key configured for {}", config.base_url);
    } else {
        println!("  ❌ No API key — set DIALOGUARD_API_KEY or api_key in the config");
        issues += 1;
    }

    match config.instructions.topics_source() {
        Ok(source) => {
            let catalog = TopicCatalog::parse(&source);
            if catalog.is_empty() && config.progress.enabled {
                println!("  ⚠️  Progress tracking enabled but no topics found");
                issues += 1;
            } else {
                println!("  ✅ {} trackable topic(s)", catalog.len());
            }
        }
        Err(e) => {
            println!("  ❌ Topic document unreadable: {e}");
            issues += 1;
        }
    }

    if !config.safety.enabled {
        println!("  ⚠️  Safety detection disabled");
        issues += 1;
    } else if config.safety.keywords.is_empty() {
        println!("  ⚠️  No safety keywords — pre-flight scanning is inactive");
        issues += 1;
    } else {
        println!("  ✅ {} safety keyword(s)", config.safety.keywords.len());
    }

    if config.safety.enabled && config.safety.recipients.is_empty() {
        println!("  ⚠️  No safety recipients — emergencies will only be logged");
        issues += 1;
    }

    match config.notifications.webhook_url.as_deref() {
        Some(url) => println!(
            "  ✅ Webhook notifier: {url}{}",
            if config.notifications.secret.is_some() { " (signed)" } else { "" }
        ),
        None => println!("  ✅ Log-only notifier"),
    }

    match dialoguard_store::open_store(&config.store).await {
        Ok(store) => println!("  ✅ Store '{}' opened", store.name()),
        Err(e) => {
            println!("  ❌ Store '{}' failed to open: {e}", config.store.backend);
            issues += 1;
        }
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
