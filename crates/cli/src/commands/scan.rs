//! `dialoguard scan` — Run the pre-flight keyword scan on a text.

use std::path::Path;

use dialoguard_safety::KeywordScanner;

use super::load_config;

pub fn run(config_path: Option<&Path>, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    let scanner = KeywordScanner::from_config(&config.safety);

    if scanner.is_empty() {
        println!("No safety keywords configured; nothing to scan for.");
        return Ok(());
    }

    let (verdict, matches) = scanner.verdict(text);
    if matches.is_empty() {
        println!("safe: no keyword matched");
        return Ok(());
    }

    println!(
        "{}: {} match(es){}",
        verdict.danger_level,
        matches.len(),
        if verdict.blocks() { ", would block the conversation" } else { "" }
    );
    for m in &matches {
        let category = m.category.as_deref().map(|c| format!(" ({c})")).unwrap_or_default();
        println!("  {:<10} \"{}\"{category} at {}..{}: \"{}\"", m.level.as_str(), m.phrase, m.start, m.end, &text[m.start..m.end]);
    }

    Ok(())
}
