use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::admin::AdminCommands;
use commands::api::ApiArgs;
use commands::campaigns::CampaignCommands;
use commands::contacts::ContactCommands;
use commands::conversations::ConversationCommands;
use commands::webhook::WebhookCommands;

#[derive(Parser)]
#[command(name = "engage", version, about = "Engage CRM command line: campaigns, inbox and bootstrap administration")]
struct Cli {
    /// API base URL
    #[arg(long, env = "ENGAGE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Log in with email and password; the token is stored in the user config dir
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "ENGAGE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Revoke and forget the stored login token
    Logout,
    /// Show the authenticated profile
    Me,
    /// Broadcast campaigns
    Campaign {
        #[command(subcommand)]
        command: CampaignCommands,
    },
    /// Shared inbox
    Conversation {
        #[command(subcommand)]
        command: ConversationCommands,
    },
    /// Contact book
    Contact {
        #[command(subcommand)]
        command: ContactCommands,
    },
    /// Webhook signing and replay
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    /// Bootstrap organizations, profiles and API keys directly in the database
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Raw authenticated API request
    Api(ApiArgs),
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url.trim_end_matches('/').to_string();

    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url).await,
        Commands::Login { email, password } => commands::auth::login(&api_url, &email, password).await,
        Commands::Logout => commands::auth::logout(&api_url).await,
        Commands::Me => commands::auth::me(&api_url).await,
        Commands::Campaign { command } => commands::campaigns::run(&api_url, command).await,
        Commands::Conversation { command } => commands::conversations::run(&api_url, command).await,
        Commands::Contact { command } => commands::contacts::run(&api_url, command).await,
        Commands::Webhook { command } => commands::webhook::run(&api_url, command).await,
        Commands::Admin { command } => commands::admin::run(command).await,
        Commands::Api(args) => commands::api::run(&api_url, args).await,
    };

    tracing::debug!(exit_code = code, "command finished");
    std::process::exit(code);
}
