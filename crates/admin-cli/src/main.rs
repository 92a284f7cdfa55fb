#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use clap::{Parser, Subcommand};
use kiss_core::config::Config;

/// kissctl -- operate a running kiss-api / luca-api deployment.
#[derive(Parser)]
#[command(name = "kissctl", version, about)]
struct Cli {
    /// Base URL for the messaging gateway's admin surface.
    #[arg(short = 'u', long, global = true)]
    api_url: Option<String>,

    /// Admin bearer token. Defaults to the value in `~/.kiss/config.toml` or
    /// `KISS_ADMIN_TOKEN`.
    #[arg(short = 't', long, global = true)]
    admin_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depth stats (default when no subcommand is given).
    Stats,

    /// Blocklist management.
    Blocklist {
        #[command(subcommand)]
        command: BlocklistCommands,
    },

    /// Clear the conversation history cache.
    CacheClear,

    /// Pause or resume a named queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Dead letter queue inspection and recovery.
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
enum BlocklistCommands {
    /// Block a contact from receiving outbound messages.
    Add { contact: String },
    /// Remove a contact from the blocklist.
    Remove { contact: String },
    /// Check whether a contact is blocked.
    Check { contact: String },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Stop a queue from dispatching new jobs.
    Pause { queue: String },
    /// Resume a paused queue.
    Resume { queue: String },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered jobs.
    List {
        #[arg(short = 'n', long, default_value_t = 100)]
        page_size: usize,
    },
    /// Re-enqueue one dead-lettered job.
    Retry { id: String },
    /// Re-enqueue every dead-lettered job.
    RetryAll,
    /// Discard one dead-lettered job without retrying it.
    Discard { id: String },
    /// Discard every dead-lettered job. Requires a confirmation token to
    /// guard against an accidental bulk wipe.
    ClearAll {
        #[arg(short = 'y', long = "confirm")]
        confirmation_token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();
    kiss_telemetry::logging::init_logging("kissctl", &config.general.log_level);

    let api_url = cli
        .api_url
        .unwrap_or_else(|| std::env::var("KISS_API_ADDR").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()));
    let api_url = normalize_base_url(&api_url);

    let admin_token = cli.admin_token.or(config.admin.token);

    match cli.command {
        None | Some(Commands::Stats) => {
            commands::stats::run(&api_url, &admin_token).await?;
        }
        Some(Commands::Blocklist { command }) => match command {
            BlocklistCommands::Add { contact } => commands::blocklist::add(&api_url, &admin_token, &contact).await?,
            BlocklistCommands::Remove { contact } => commands::blocklist::remove(&api_url, &admin_token, &contact).await?,
            BlocklistCommands::Check { contact } => commands::blocklist::check(&api_url, &admin_token, &contact).await?,
        },
        Some(Commands::CacheClear) => {
            commands::cache::clear(&api_url, &admin_token).await?;
        }
        Some(Commands::Queue { command }) => match command {
            QueueCommands::Pause { queue } => commands::queue::pause(&api_url, &admin_token, &queue).await?,
            QueueCommands::Resume { queue } => commands::queue::resume(&api_url, &admin_token, &queue).await?,
        },
        Some(Commands::Dlq { command }) => match command {
            DlqCommands::List { page_size } => commands::dlq::list(&api_url, &admin_token, page_size).await?,
            DlqCommands::Retry { id } => commands::dlq::retry(&api_url, &admin_token, &id).await?,
            DlqCommands::RetryAll => commands::dlq::retry_all(&api_url, &admin_token).await?,
            DlqCommands::Discard { id } => commands::dlq::discard(&api_url, &admin_token, &id).await?,
            DlqCommands::ClearAll { confirmation_token } => {
                commands::dlq::clear_all(&api_url, &admin_token, &confirmation_token).await?
            }
        },
    }

    Ok(())
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
