//! TeamLink terminal front-end for collaboration sessions.
//!
//! `teamlink serve` runs the in-memory relay; `teamlink create` and
//! `teamlink join` enter a session and turn stdin into chat.

mod repl;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use teamlink_collab::{CollabClient, CollabConfig, RelayConfig, RelayServer};

/// TeamLink - real-time collaboration sessions
#[derive(Parser, Debug)]
#[command(name = "teamlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Relay URL (overrides TEAMLINK_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Display name (overrides TEAMLINK_USER_NAME)
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Largest roster a session may reach
        #[arg(long, default_value_t = 50)]
        max_participants: usize,
    },

    /// Create a session and enter it
    Create {
        /// Session name
        name: String,

        /// Document URIs shared in the session
        #[arg(short, long = "document")]
        documents: Vec<String>,
    },

    /// Join an existing session
    Join {
        /// Session id printed by `create`
        session_id: String,
    },
}

impl Cli {
    fn client_config(&self) -> anyhow::Result<CollabConfig> {
        let mut config = CollabConfig::load().context("failed to load configuration")?;
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(name) = &self.name {
            config.user_name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { bind, max_participants } => {
            info!("Starting TeamLink relay...");
            let relay = RelayServer::new(RelayConfig {
                bind_addr: bind.clone(),
                max_participants: *max_participants,
                ..RelayConfig::default()
            });
            relay.run().await?;
        }

        Command::Create { name, documents } => {
            let client = CollabClient::new(cli.client_config()?);
            let session = client
                .create_session(name.as_str(), documents.clone())
                .await
                .context("failed to create session")?;
            println!("Created session \"{}\"", session.name);
            println!("Share this id to invite others: {}", session.id);
            repl::run(&client).await?;
        }

        Command::Join { session_id } => {
            let client = CollabClient::new(cli.client_config()?);
            if !client.join_session(session_id).await {
                anyhow::bail!("could not join session {session_id}");
            }
            println!("Joined session {session_id}");
            repl::run(&client).await?;
        }
    }

    Ok(())
}
