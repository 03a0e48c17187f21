use clap::Subcommand;
use serde_json::{json, Value};

use crate::cli::client::{ApiClient, NO_QUERY};
use crate::cli::config::{load_cli_config, save_cli_config, CliConfig};
use crate::cli::utils::{field, output_success, output_value, password_or_prompt};
use crate::cli::OutputFormat;

#[derive(Subcommand)]
pub enum AuthCommands {
    #[command(about = "Login to server")]
    Login {
        #[arg(help = "Email")]
        email: String,
        #[arg(long, help = "Password (will prompt if not provided)")]
        password: Option<String>,
    },

    #[command(about = "Register a new account and log in")]
    Register {
        #[arg(help = "Email")]
        email: String,
        #[arg(long, help = "Password (will prompt if not provided)")]
        password: Option<String>,
        #[arg(long, help = "Display name")]
        display_name: Option<String>,
    },

    #[command(about = "Revoke the current session")]
    Logout,

    #[command(about = "Show current user, tier and usage")]
    Whoami,
}

pub async fn handle(cmd: AuthCommands, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let mut config = load_cli_config()?;
    if let Some(url) = &server {
        config.server_url = url.clone();
    }

    match cmd {
        AuthCommands::Login { email, password } => {
            let password = password_or_prompt(password)?;
            let client = ApiClient::new(&config, None)?;
            let issued = client
                .post("/auth/login", NO_QUERY, &json!({ "email": email, "password": password }))
                .await?;
            remember_session(&mut config, &issued)?;
            output_success(
                &output_format,
                &format!("Logged in as {}", field(&issued["user"], "email")),
                Some(json!({ "expires_at": issued["expires_at"] })),
            )
        }
        AuthCommands::Register {
            email,
            password,
            display_name,
        } => {
            let password = password_or_prompt(password)?;
            let client = ApiClient::new(&config, None)?;
            let issued = client
                .post(
                    "/auth/register",
                    NO_QUERY,
                    &json!({ "email": email, "password": password, "display_name": display_name }),
                )
                .await?;
            remember_session(&mut config, &issued)?;
            output_success(
                &output_format,
                &format!("Registered {}", field(&issued["user"], "email")),
                Some(json!({ "user_id": issued["user"]["id"] })),
            )
        }
        AuthCommands::Logout => {
            if config.token.is_some() {
                let client = ApiClient::new(&config, None)?;
                // The local session is dropped even when the server call fails
                if let Err(e) = client.delete("/api/auth/session").await {
                    tracing::warn!("Server-side logout failed: {}", e);
                }
            }
            config.clear_session();
            save_cli_config(&config)?;
            output_success(&output_format, "Logged out", None)
        }
        AuthCommands::Whoami => {
            let client = ApiClient::authenticated(&config, None)?;
            let me = client.get("/api/auth/whoami", NO_QUERY).await?;
            match output_format {
                OutputFormat::Json => output_value(&me),
                OutputFormat::Text => {
                    println!("User:  {} ({})", field(&me["user"], "email"), field(&me["user"], "id"));
                    println!("Tier:  {}", me["tier"].as_str().unwrap_or("free"));
                    if let Some(metrics) = me["usage"]["metrics"].as_object() {
                        for (metric, usage) in metrics {
                            let limit = usage["limit"].as_i64().map_or("unlimited".to_string(), |l| l.to_string());
                            println!("{:<14} {} / {}", metric, usage["used"], limit);
                        }
                    }
                    Ok(())
                }
            }
        }
    }
}

fn remember_session(config: &mut CliConfig, issued: &Value) -> anyhow::Result<()> {
    let token = issued["token"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Server response did not include a token"))?;
    config.token = Some(token.to_string());
    config.email = issued["user"]["email"].as_str().map(str::to_string);
    config.token_expires_at = serde_json::from_value(issued["expires_at"].clone()).ok();
    save_cli_config(config)
}
