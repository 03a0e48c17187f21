pub mod client;
pub mod commands;
pub mod config;
pub mod utils;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "relayctl - Command-line client for the FlowRelay API")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in human-readable text format")]
    pub text: bool,

    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[arg(long, global = true, help = "Server URL (overrides the saved server)")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Authentication and session management")]
    Auth {
        #[command(subcommand)]
        cmd: commands::auth::AuthCommands,
    },

    #[command(about = "Manage sync pairings")]
    Pairing {
        #[command(subcommand)]
        cmd: commands::pairing::PairingCommands,
    },

    #[command(about = "Upload a package to a pairing (inline or chunked)")]
    Push(commands::sync::PushArgs),

    #[command(about = "Download the latest completed package from a pairing")]
    Pull(commands::sync::PullArgs),

    #[command(about = "List conflicts recorded for a pairing")]
    Conflicts(commands::sync::ConflictArgs),

    #[command(about = "Generate a workflow definition from a prompt")]
    Generate(commands::generate::GenerateArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let server = cli.server;

    match cli.command {
        Commands::Auth { cmd } => commands::auth::handle(cmd, server, output_format).await,
        Commands::Pairing { cmd } => commands::pairing::handle(cmd, server, output_format).await,
        Commands::Push(args) => commands::sync::push(args, server, output_format).await,
        Commands::Pull(args) => commands::sync::pull(args, server, output_format).await,
        Commands::Conflicts(args) => commands::sync::conflicts(args, server, output_format).await,
        Commands::Generate(args) => commands::generate::handle(args, server, output_format).await,
    }
}
