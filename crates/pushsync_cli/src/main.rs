//! pushsync CLI
//!
//! Command-line tools for inspecting and driving a pushsync client state
//! directory against an in-process fake Mobile API.
//!
//! # Commands
//!
//! - `show` - Display the installation and user entities
//! - `set` - Edit an attribute locally (marks it dirty)
//! - `register` - Register a push service token
//! - `sync` - Register if needed, then sync installation and user
//! - `personalize` / `depersonalize` - Bind or unbind a user identity
//! - `primary` - Mark an installation as primary
//! - `deliver` / `fetch` - Put a message in the server inbox, then fetch it
//! - `api-state` - Dump the fake API state

mod commands;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pushsync command-line client tools.
#[derive(Parser)]
#[command(name = "pushsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the client state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Application code sent with every request
    #[arg(global = true, long, default_value = session::DEFAULT_APP_CODE)]
    app_code: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the installation and user entities
    Show {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Edit an attribute locally
    Set {
        /// Entity (installation, user)
        entity: String,

        /// Attribute wire name, e.g. firstName
        key: String,

        /// JSON value; bare words are taken as strings
        value: String,
    },

    /// Register a push service token
    Register {
        /// Device token from the push service
        token: String,
    },

    /// Register if needed, then sync installation and user
    Sync,

    /// Bind the user to an identity
    Personalize {
        /// External user id
        #[arg(long)]
        external_id: Option<String>,

        /// Email address (repeatable)
        #[arg(long)]
        email: Vec<String>,

        /// Phone number (repeatable)
        #[arg(long)]
        phone: Vec<String>,

        /// Depersonalize a different identity first
        #[arg(short, long)]
        force: bool,
    },

    /// Unbind the user from its identity
    Depersonalize,

    /// Mark an installation as primary
    Primary {
        /// Push registration id; defaults to this installation
        registration: Option<String>,

        /// Clear the flag instead of setting it
        #[arg(long)]
        off: bool,
    },

    /// Put a message in the fake server inbox
    Deliver {
        /// Message id
        message_id: String,

        /// Message body
        body: String,
    },

    /// Fetch messages from the server
    Fetch,

    /// Dump the fake API state
    ApiState,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("pushsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.path.ok_or("State directory path required")?;
    let session = session::Session::open(&path, &cli.app_code)?;
    let result = run(&session, cli.command).await;
    session.close().await?;
    println!("{}", result?);

    Ok(())
}

async fn run(
    session: &session::Session,
    command: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match command {
        Commands::Show { format } => commands::show::run(session, &format),
        Commands::Set { entity, key, value } => commands::set::run(session, &entity, &key, &value),
        Commands::Register { token } => commands::sync::register(session, &token).await,
        Commands::Sync => commands::sync::run(session).await,
        Commands::Personalize {
            external_id,
            email,
            phone,
            force,
        } => commands::identity::personalize(session, external_id, email, phone, force).await,
        Commands::Depersonalize => commands::identity::depersonalize(session).await,
        Commands::Primary { registration, off } => {
            commands::identity::primary(session, registration, !off).await
        }
        Commands::Deliver { message_id, body } => {
            Ok(commands::messages::deliver(session, &message_id, &body))
        }
        Commands::Fetch => commands::messages::fetch(session).await,
        Commands::ApiState => Ok(serde_json::to_string_pretty(&session.api().state())?),
        Commands::Version => Ok(String::new()),
    }
}
