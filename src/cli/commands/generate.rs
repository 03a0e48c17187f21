use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde_json::{json, Value};

use crate::cli::client::{ApiClient, NO_QUERY};
use crate::cli::config::load_cli_config;
use crate::cli::utils::output_value;
use crate::cli::OutputFormat;

#[derive(Args)]
pub struct GenerateArgs {
    #[arg(help = "What the workflow should do")]
    pub prompt: String,
    #[arg(long, help = "Existing workflow JSON to refine")]
    pub existing: Option<PathBuf>,
    #[arg(long, short, help = "Write the workflow to this file")]
    pub output: Option<PathBuf>,
}

pub async fn handle(args: GenerateArgs, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cli_config()?;
    let client = ApiClient::authenticated(&config, server.as_deref())?;

    let existing: Option<Value> = match &args.existing {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Some(serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?)
        }
        None => None,
    };

    let generated = client
        .post("/api/ai/workflows", NO_QUERY, &json!({ "prompt": args.prompt, "existing": existing }))
        .await?;

    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_vec_pretty(&generated["workflow"])?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    match output_format {
        OutputFormat::Json => output_value(&generated),
        OutputFormat::Text => {
            let workflow = &generated["workflow"];
            println!(
                "Workflow: {}",
                workflow["name"].as_str().unwrap_or("(unnamed)")
            );
            if let Some(steps) = workflow["steps"].as_array() {
                for step in steps {
                    println!("  - {} ({})", step["id"].as_str().unwrap_or("?"), step["type"].as_str().unwrap_or("?"));
                }
            }
            println!(
                "Model: {}  tokens: {} in / {} out",
                generated["model"].as_str().unwrap_or("-"),
                generated["usage"]["input_tokens"],
                generated["usage"]["output_tokens"]
            );
            Ok(())
        }
    }
}
