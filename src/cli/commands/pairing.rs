use clap::Subcommand;
use serde_json::json;

use crate::cli::client::ApiClient;
use crate::cli::config::load_cli_config;
use crate::cli::utils::{field, output_collection, output_success};
use crate::cli::OutputFormat;

#[derive(Subcommand)]
pub enum PairingCommands {
    #[command(about = "Create a pairing between two endpoints")]
    Create {
        #[arg(help = "Pairing name (unique per account)")]
        name: String,
        #[arg(long, help = "Label of the source endpoint")]
        source: String,
        #[arg(long, help = "Label of the target endpoint")]
        target: String,
    },

    #[command(about = "List your pairings")]
    List,
}

pub async fn handle(cmd: PairingCommands, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cli_config()?;
    let client = ApiClient::authenticated(&config, server.as_deref())?;

    match cmd {
        PairingCommands::Create { name, source, target } => {
            let pairing = client
                .post(
                    "/api/sync",
                    &[("action", "create_pairing")],
                    &json!({ "name": name, "source_label": source, "target_label": target }),
                )
                .await?;
            output_success(
                &output_format,
                &format!("Created pairing '{}' ({})", field(&pairing, "name"), field(&pairing, "id")),
                Some(json!({ "pairing": pairing })),
            )
        }
        PairingCommands::List => {
            let pairings = client.get("/api/sync", &[("action", "pairings")]).await?;
            let items = pairings.as_array().cloned().unwrap_or_default();
            output_collection(&output_format, "pairings", &items, "No pairings yet", |p| {
                format!(
                    "{}  {:<24} {} -> {}",
                    field(p, "id"),
                    field(p, "name"),
                    field(p, "source_label"),
                    field(p, "target_label")
                )
            })
        }
    }
}
