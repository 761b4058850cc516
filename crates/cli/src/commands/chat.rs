//! `dialoguard chat` — One message through the full turn pipeline.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use dialoguard_agent::{StreamEvent, TurnPipeline, TurnRequest, TurnResponse};
use dialoguard_core::ConversationId;

use super::load_config;

pub struct ChatOptions {
    pub stream: bool,
    pub conversation: Option<String>,
    pub user: String,
    pub language: Option<String>,
}

pub async fn run(
    config_path: Option<&Path>,
    message: String,
    options: ChatOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for API key early — give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    DIALOGUARD_API_KEY=sk-...   (preferred)");
        eprintln!("    OPENAI_API_KEY=sk-...");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", super::config_location(config_path).display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let pipeline = Arc::new(TurnPipeline::from_config(&config).await?);

    let mut request = TurnRequest::new(options.user, message);
    request.conversation_id = options.conversation.as_deref().map(ConversationId::from);
    request.language = options.language;

    let result = if options.stream {
        stream_turn(&pipeline, request).await
    } else {
        pipeline.handle_turn(request).await.map(|response| print_response(&response))
    };

    // Surface the user-facing message; detail is already in the log
    result.map_err(|e| e.user_message().into())
}

fn print_response(response: &TurnResponse) {
    println!("{}", response.text);
    println!();
    println!("  conversation: {}", response.conversation_id);
    if response.safety.is_unsafe() {
        println!(
            "  safety:       {}{}",
            response.safety.danger_level,
            if response.blocked { " (conversation blocked)" } else { "" }
        );
    }
    if let Some(progress) = &response.progress {
        println!("  progress:     {:.0}% ({}/{})", progress.percentage, progress.covered, progress.total);
    }
    if let Some(usage) = &response.usage {
        println!("  tokens:       {} over {} attempt(s)", usage.total_tokens, response.attempts);
    }
}

async fn stream_turn(pipeline: &Arc<TurnPipeline>, request: TurnRequest) -> dialoguard_core::Result<()> {
    let mut events = pipeline.handle_turn_streaming(request).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Chunk { content } => {
                print!("{content}");
                let _ = stdout.flush();
            }
            StreamEvent::Done {
                conversation_id,
                valid,
                usage,
                ..
            } => {
                println!();
                println!();
                println!("  conversation: {conversation_id}");
                if !valid {
                    println!("  note:         the reply did not match the response schema");
                }
                if let Some(usage) = usage {
                    println!("  tokens:       {}", usage.total_tokens);
                }
            }
            StreamEvent::Safety {
                danger_level,
                blocked,
                message,
            } => {
                println!("  safety:       {danger_level}{}", if blocked { " (conversation blocked)" } else { "" });
                if let Some(message) = message {
                    println!();
                    println!("{message}");
                }
            }
            StreamEvent::Progress { progress } => {
                println!("  progress:     {:.0}% ({}/{})", progress.percentage, progress.covered, progress.total);
            }
            StreamEvent::Error { message, partial_saved } => {
                println!();
                eprintln!("  {message}{}", if partial_saved { " (partial reply saved)" } else { "" });
            }
        }
    }

    Ok(())
}
