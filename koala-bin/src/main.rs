use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use koala_core::{
    Collaborators, Orchestrator, Submission,
    collab::{CharBudgetTrimmer, ConversationStore, InMemoryStore, UsageTally},
    config::Settings,
    model::{Chat, Message, Role},
    submit::TitleStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "koala streaming chat client", long_about = None)]
struct Cli {
    /// Settings file (JSON or TOML); built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream one reply (prints deltas live; Ctrl-C stops generation)
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Index into the configured model list")]
        model: Option<usize>,
        #[arg(long, help = "Optional system prompt")]
        system: Option<String>,
        #[arg(long, help = "Generate a chat title after the reply")]
        title: bool,
    },
    /// List configured models
    Models,
}

/// Echoes newly merged assistant text to stdout on every commit.
struct EchoStore {
    inner: InMemoryStore,
    printed: Mutex<usize>,
}

impl EchoStore {
    fn new(chats: Vec<Chat>) -> Self {
        Self { inner: InMemoryStore::new(chats), printed: Mutex::new(0) }
    }
}

impl ConversationStore for EchoStore {
    fn snapshot(&self) -> Vec<Chat> {
        self.inner.snapshot()
    }

    fn commit(&self, chats: Vec<Chat>) {
        if let Some(last) = chats.first().and_then(|c| c.messages.last())
            && last.role == Role::Assistant
        {
            let mut printed = self.printed.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(fresh) = last.content.get(*printed..) {
                print!("{fresh}");
                io::stdout().flush().ok();
                *printed = last.content.len();
            }
        }
        self.inner.commit(chats);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    match cli.command {
        Commands::Models => {
            for (i, m) in settings.models.iter().enumerate() {
                println!(
                    "{i}: {} ({}) endpoint={} context={} max_tokens={}",
                    m.name, m.model, m.endpoint, m.model_max_context, m.model_max_tokens
                );
            }
        }
        Commands::Chat { message, model, system, title } => {
            let mut config = settings.default_chat_config.clone();
            if let Some(index) = model {
                config.model_selection = index;
            }
            config.model = settings.model(config.model_selection)?.model.clone();

            let mut chat = Chat::new(config);
            if let Some(system) = system {
                chat.messages.push(Message::system(system));
            }
            chat.messages.push(Message::user(message));

            let settings = Arc::new(Settings { auto_title: settings.auto_title || title, ..settings });
            let store = Arc::new(EchoStore::new(vec![chat]));
            let tally = Arc::new(UsageTally::new());
            let orch = Orchestrator::from_settings(
                settings.clone(),
                Collaborators {
                    store: store.clone(),
                    trimmer: Arc::new(CharBudgetTrimmer),
                    usage: Some(tally.clone()),
                    challenge: None,
                },
            )?;

            let handle = orch.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.stop();
                }
            });

            match orch.submit(0).await {
                Ok(Submission::Completed(done)) => {
                    println!();
                    eprintln!(
                        "[{}; ~{} tokens]",
                        done.disposition.as_str(),
                        done.usage.total()
                    );
                    match done.title {
                        TitleStatus::Generated(t) => eprintln!("[title: {t}]"),
                        TitleStatus::Failed(msg) => eprintln!("[{msg}]"),
                        TitleStatus::Skipped => {}
                    }
                }
                Ok(Submission::Rejected(reason)) => eprintln!("[rejected: {reason:?}]"),
                Err(e) => {
                    println!();
                    return Err(e.into());
                }
            }
            if settings.count_total_tokens {
                eprintln!("[estimated cost: {:.6}]", tally.cost(&settings.models));
            }
        }
    }

    Ok(())
}
