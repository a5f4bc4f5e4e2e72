//! Interactive chat application for asking questions about the textbook.
//!
//! This binary provides a streaming REPL interface to the textbook question
//! answering backend.
//!
//! # Usage
//!
//! ```bash
//! # Basic usage with default settings
//! lectern-chat
//!
//! # Point at a different backend
//! lectern-chat --api-url http://textbook.example:8000
//!
//! # Disable colors (useful for piping output)
//! lectern-chat --no-color
//! ```
//!
//! # Commands
//!
//! While chatting, you can use slash commands:
//! - `/help` - Show available commands
//! - `/clear` - Start a new conversation
//! - `/retry` - Ask the last question again
//! - `/select <text>` - Ask the next question about a passage
//! - `/health` - Check the backend
//! - `/quit` - Exit the application

use std::sync::{Arc, Mutex};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use lectern::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatController, ChatEvent, PlainTextRenderer, Renderer,
    help_text, parse_command,
};
use lectern::selection::{SelectionRect, SelectionSource, evaluate_selection};
use lectern::observability::snapshot;
use lectern::utils::SystemClock;
use lectern::{
    ErrorNotice, FileStore, Lectern, RateLimiter, RetryPolicy, SessionStore, register_biometrics,
    with_retry,
};

/// A passage typed at the prompt, standing in for a selection in the document.
#[derive(Default)]
struct TypedPassage {
    text: Mutex<Option<String>>,
}

impl TypedPassage {
    fn set(&self, text: String) {
        *self.text.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
    }
}

impl SelectionSource for TypedPassage {
    fn selected_text(&self) -> Option<String> {
        self.text.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn first_range_rect(&self) -> Option<SelectionRect> {
        None
    }

    fn remove_all_ranges(&self) {
        *self.text.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Main entry point for the lectern-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = ChatArgs::from_command_line_relaxed("lectern-chat [OPTIONS]");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let collector = biometrics::Collector::new();
    register_biometrics(&collector);

    let config = ChatConfig::load(&args)?;
    let state_dir = config.resolved_state_dir();
    tracing::info!(state_dir = %state_dir.display(), "using state directory");
    let store = Arc::new(FileStore::new(state_dir));

    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        Arc::new(SystemClock),
        config.rate_limit,
    ));
    let _sweeper = limiter.spawn_sweeper();

    let client = Lectern::with_options(config.api_url.clone(), Some(config.timeout()))?;
    let mut controller = ChatController::with_config(
        Arc::new(client.clone()),
        SessionStore::new(store),
        Arc::clone(&limiter),
        &config,
    );
    let mut renderer = PlainTextRenderer::with_color(config.use_color);
    let passage = TypedPassage::default();
    let mut rl = DefaultEditor::new()?;

    // Ctrl+C while an answer streams cancels it.
    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })?;

    println!("Textbook Chat (backend: {})", client.base_url());
    println!("Type /help for commands, /quit to exit\n");
    for message in controller.messages() {
        renderer.print_message(&message);
    }

    loop {
        // Drop interrupts that arrived while idle.
        while interrupt_rx.try_recv().is_ok() {}

        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Clear => {
                            controller.clear_history();
                            passage.remove_all_ranges();
                            renderer.print_info("Conversation cleared.");
                        }
                        ChatCommand::Retry => {
                            let mut events = controller.subscribe();
                            match controller.retry().await {
                                Ok(()) if controller.is_loading() => {
                                    println!("Assistant:");
                                    stream_answer(
                                        &mut controller,
                                        &mut events,
                                        &mut interrupt_rx,
                                        &mut renderer,
                                    )
                                    .await;
                                }
                                Ok(()) => renderer.print_info("Nothing to retry."),
                                Err(_) => print_refusal(&controller, &mut renderer),
                            }
                        }
                        ChatCommand::Select(text) => {
                            passage.set(text);
                            let selection = evaluate_selection(&passage, &config.selection);
                            if selection.has_selection() {
                                if selection.truncated {
                                    renderer.print_info(&format!(
                                        "Passage shortened to {} characters.",
                                        config.selection.max_length
                                    ));
                                }
                                renderer.print_selection(&selection.text);
                                controller.set_selected_text(Some(selection.text));
                            } else {
                                passage.remove_all_ranges();
                                renderer.print_error(&format!(
                                    "Passage must be at least {} characters.",
                                    config.selection.min_length
                                ));
                            }
                        }
                        ChatCommand::Unselect => {
                            passage.remove_all_ranges();
                            controller.set_selected_text(None);
                            renderer.print_info("Passage cleared.");
                        }
                        ChatCommand::Health => {
                            match with_retry(&RetryPolicy::default(), || client.health()).await {
                                Ok(health) if health.is_healthy() => {
                                    renderer.print_info(&format!("Backend is {}.", health.status))
                                }
                                Ok(health) => renderer.print_info(&format!(
                                    "Backend is {} (unhealthy: {}).",
                                    health.status,
                                    health.unhealthy_services().join(", ")
                                )),
                                Err(err) => {
                                    renderer.print_notice(&ErrorNotice::for_error(&err, 0))
                                }
                            }
                        }
                        ChatCommand::Stats => {
                            print_stats(&controller, &collector);
                        }
                        ChatCommand::Limits => {
                            print_limits(&limiter);
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                        }
                    }
                    continue;
                }

                let mut events = controller.subscribe();
                if controller.submit_query(line).await.is_err() {
                    print_refusal(&controller, &mut renderer);
                    continue;
                }
                println!("Assistant:");
                stream_answer(&mut controller, &mut events, &mut interrupt_rx, &mut renderer)
                    .await;
                if controller.selected_text().is_none() {
                    passage.remove_all_ranges();
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    Ok(())
}

/// Renders the answer in flight until it completes, fails or is interrupted.
async fn stream_answer(
    controller: &mut ChatController,
    events: &mut tokio::sync::broadcast::Receiver<ChatEvent>,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
    renderer: &mut PlainTextRenderer,
) {
    loop {
        tokio::select! {
            _ = interrupts.recv() => {
                if controller.cancel() {
                    renderer.print_interrupted();
                }
                return;
            }
            event = events.recv() => match event {
                Ok(ChatEvent::Chunk(text)) => renderer.print_chunk(&text),
                Ok(ChatEvent::MessageAppended(message)) if message.is_assistant() => {
                    renderer.finish_answer(&message);
                }
                Ok(ChatEvent::Completed(_)) | Ok(ChatEvent::HistoryCleared { .. }) => return,
                Ok(ChatEvent::Failed(err)) => {
                    let notice = controller
                        .error_notice()
                        .unwrap_or_else(|| ErrorNotice::for_error(&err, 0));
                    renderer.print_notice(&notice);
                    return;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "renderer fell behind the answer stream");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

fn print_refusal(controller: &ChatController, renderer: &mut PlainTextRenderer) {
    match controller.error_notice() {
        Some(notice) => renderer.print_notice(&notice),
        None => renderer.print_error("The question could not be sent."),
    }
}

fn print_stats(controller: &ChatController, collector: &biometrics::Collector) {
    let session = controller.session();
    let questions = session.messages.iter().filter(|m| m.is_user()).count();
    println!("    Session Statistics:");
    println!("      Session: {}", session.session_id);
    println!("      Messages: {}", session.messages.len());
    println!("      Questions: {}", questions);
    println!("      History sent per question: {}", controller.history_context());
    match controller.selected_text() {
        Some(text) => println!("      Selected passage: {} characters", text.chars().count()),
        None => println!("      Selected passage: (none)"),
    }
    println!("    Metrics:");
    for line in snapshot(collector) {
        println!("      {}", line);
    }
}

fn print_limits(limiter: &RateLimiter) {
    let status = limiter.status();
    let config = limiter.config();
    println!("    Rate Limit:");
    println!(
        "      {} of {} queries used in the last {} seconds",
        limiter.queries_in_window(),
        config.max_queries,
        config.window_secs
    );
    if status.limited {
        println!("      Limited: wait {} seconds", status.wait_seconds);
    } else {
        println!("      Remaining: {}", status.remaining);
    }
}
