//! `dialoguard validate` — Check an upstream reply against the envelope schema.

use std::path::Path;

pub fn run(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(file).map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
    let outcome = dialoguard_protocol::validate(&text);

    match outcome.envelope.filter(|_| outcome.valid) {
        Some(envelope) => {
            println!("valid response envelope");
            println!("  text blocks: {}", envelope.content.text_blocks.len());
            println!("  form:        {}", if envelope.content.form.is_some() { "yes" } else { "no" });
            println!("  safety:      {}", envelope.safety.level());
            if let Some(topic) = envelope.progress.as_ref().and_then(|p| p.current_topic.as_deref()) {
                println!("  asks about:  {topic}");
            }
            Ok(())
        }
        None => {
            println!("invalid response envelope:");
            for error in &outcome.errors {
                println!("  - {error}");
            }
            Err(format!("{} problem(s) found", outcome.errors.len()).into())
        }
    }
}
