//! `dialoguard topics` — List the trackable topics in a configuration document.

use std::path::Path;

use dialoguard_progress::TopicCatalog;

pub fn run(file: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let document =
        std::fs::read_to_string(file).map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
    let catalog = TopicCatalog::parse(&document);

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    let Some(strategy) = catalog.strategy() else {
        println!("No trackable topics found in {}.", file.display());
        println!("Add inline markers like [TOPIC: Sleep | sleep, rest] or a TRACKABLE_TOPICS section.");
        return Ok(());
    };

    println!("{} topic(s) from {} ({strategy:?})", catalog.len(), file.display());
    println!();
    let width = catalog.topics().iter().map(|t| t.id.len()).max().unwrap_or(0);
    for topic in catalog.topics() {
        if topic.keywords.is_empty() {
            println!("  {:width$}  {}", topic.id, topic.title);
        } else {
            println!("  {:width$}  {}  [{}]", topic.id, topic.title, topic.keywords.join(", "));
        }
    }

    Ok(())
}
