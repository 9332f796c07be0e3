//! Javelin node: runs a broadcast server or client from `javelin.toml` and
//! manages the server's user list.

mod config;
mod node;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use javelin_socket::UserAuthenticator;
use javelin_users::UserStore;
use secrecy::SecretString;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use node::Node;

/// Authenticated broadcast pub/sub over WebSocket.
#[derive(Parser)]
#[command(name = "javelin", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "javelin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the socket selected by `mode` and keep it running until Ctrl-C.
    Run,
    /// Manage the users accepted by the server.
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
}

#[derive(Subcommand)]
enum UsersAction {
    /// Add a user, or change the password of an existing one.
    Add { username: String, password: String },
    /// Remove a user.
    Remove { username: String },
    /// List all users.
    List,
    /// Remove every user.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,javelin=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Run => {
            info!(mode = ?config.mode, "starting javelin node");
            let node = Node::from_config(&config)?;
            node.run_until(shutdown_signal()).await
        }
        Command::Users { action } => manage_users(&config, action),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

fn manage_users(config: &NodeConfig, action: UsersAction) -> anyhow::Result<()> {
    let path = &config.server.users_file;
    let store = UserStore::open(path)
        .with_context(|| format!("failed to open user file {}", path.display()))?;

    match action {
        UsersAction::Add { username, password } => {
            let existed = store.exists_user(&username);
            store.save_user(&username, &SecretString::from(password))?;
            if existed {
                println!("Updated password of {username}.");
            } else {
                println!("Added {username}.");
            }
        }
        UsersAction::Remove { username } => {
            if store.exists_user(&username) {
                store.delete_user(&username)?;
                println!("Removed {username}.");
            } else {
                println!("No user named {username}.");
            }
        }
        UsersAction::List => {
            let users = store.find_all_users();
            for username in &users {
                println!("{username}");
            }
            println!("{} user(s).", store.count_users());
        }
        UsersAction::Clear => {
            let count = store.count_users();
            store.delete_all_users()?;
            println!("Removed {count} user(s).");
        }
    }
    Ok(())
}
