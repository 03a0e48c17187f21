// push / pull / conflicts against the relay endpoint

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Args;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};

use crate::cli::client::ApiClient;
use crate::cli::config::load_cli_config;
use crate::cli::utils::{field, output_collection, output_success};
use crate::cli::OutputFormat;
use crate::relay::chunking;
use crate::relay::codec::{decode_payload, encode_payload};
use crate::relay::Direction;

const SYNC_PATH: &str = "/api/sync";

#[derive(Args)]
pub struct PushArgs {
    #[arg(help = "Pairing id")]
    pub pairing: String,
    #[arg(help = "File to upload")]
    pub file: PathBuf,
    #[arg(long, default_value = "inbound", help = "inbound or outbound")]
    pub direction: String,
    #[arg(long, help = "JSON file to send as the manifest (defaults to file name and size)")]
    pub manifest: Option<PathBuf>,
    #[arg(long, default_value_t = 512 * 1024, help = "Largest file sent inline, in bytes")]
    pub inline_threshold: usize,
    #[arg(long, default_value_t = 1024 * 1024, help = "Chunk size for large files, in bytes")]
    pub chunk_size: usize,
    #[arg(long, default_value_t = 4, help = "Concurrent chunk transfers")]
    pub concurrency: usize,
}

#[derive(Args)]
pub struct PullArgs {
    #[arg(help = "Pairing id")]
    pub pairing: String,
    #[arg(long, default_value = "inbound", help = "inbound or outbound")]
    pub direction: String,
    #[arg(long, short, help = "Where to write the payload (or the manifest, if there is no payload)")]
    pub output: Option<PathBuf>,
    #[arg(long, default_value_t = 4, help = "Concurrent chunk transfers")]
    pub concurrency: usize,
}

#[derive(Args)]
pub struct ConflictArgs {
    #[arg(help = "Pairing id")]
    pub pairing: String,
    #[arg(long, help = "Only show unresolved conflicts")]
    pub unresolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPlan {
    Inline,
    Chunked { chunks: usize },
}

fn plan_upload(size: usize, inline_threshold: usize, chunk_size: usize) -> UploadPlan {
    if size <= inline_threshold {
        UploadPlan::Inline
    } else {
        UploadPlan::Chunked {
            chunks: size.div_ceil(chunk_size.max(1)),
        }
    }
}

fn parse_direction(raw: &str) -> anyhow::Result<Direction> {
    Direction::parse(raw).ok_or_else(|| anyhow!("direction must be 'inbound' or 'outbound', got '{}'", raw))
}

fn default_manifest(path: &Path, size: usize) -> Value {
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    json!({ "file_name": file_name, "size": size })
}

pub async fn push(args: PushArgs, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cli_config()?;
    let client = ApiClient::authenticated(&config, server.as_deref())?;
    let direction = parse_direction(&args.direction)?;

    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let manifest = match &args.manifest {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?
        }
        None => default_manifest(&args.file, bytes.len()),
    };

    let entry = match plan_upload(bytes.len(), args.inline_threshold, args.chunk_size) {
        UploadPlan::Inline => {
            let data = (!bytes.is_empty()).then(|| encode_payload(&bytes));
            client
                .post(
                    SYNC_PATH,
                    &[("action", "upload")],
                    &json!({
                        "pairing_id": args.pairing,
                        "direction": direction,
                        "manifest": manifest,
                        "data": data,
                    }),
                )
                .await?
        }
        UploadPlan::Chunked { chunks } => {
            let entry = client
                .post(
                    SYNC_PATH,
                    &[("action", "begin")],
                    &json!({
                        "pairing_id": args.pairing,
                        "direction": direction,
                        "manifest": manifest,
                        "expected_chunks": chunks,
                    }),
                )
                .await?;
            let entry_id = entry["id"]
                .as_str()
                .ok_or_else(|| anyhow!("begin response did not include an entry id"))?
                .to_string();

            let client = &client;
            let entry_id_ref = entry_id.as_str();
            stream::iter(chunking::split(&bytes, args.chunk_size))
                .map(|(index, part)| async move {
                    tracing::debug!("uploading chunk {} ({} bytes)", index, part.len());
                    client
                        .post(
                            SYNC_PATH,
                            &[("action", "upload_chunk")],
                            &json!({ "entry_id": entry_id_ref, "index": index, "data": encode_payload(part) }),
                        )
                        .await
                })
                .buffer_unordered(args.concurrency.max(1))
                .try_collect::<Vec<_>>()
                .await?;

            client
                .post(
                    SYNC_PATH,
                    &[("action", "complete")],
                    &json!({ "entry_id": entry_id, "total_chunks": chunks }),
                )
                .await?
        }
    };

    output_success(
        &output_format,
        &format!(
            "Uploaded {} bytes as entry {} ({})",
            bytes.len(),
            field(&entry, "id"),
            field(&entry, "transfer_mode")
        ),
        Some(json!({ "entry": entry })),
    )
}

pub async fn pull(args: PullArgs, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cli_config()?;
    let client = ApiClient::authenticated(&config, server.as_deref())?;
    let direction = parse_direction(&args.direction)?;

    let latest = client
        .get(
            SYNC_PATH,
            &[
                ("action", "latest"),
                ("pairing_id", args.pairing.as_str()),
                ("direction", direction.as_str()),
            ],
        )
        .await?;
    let entry_id = latest["id"]
        .as_str()
        .ok_or_else(|| anyhow!("latest response did not include an entry id"))?
        .to_string();

    let payload = match latest["transfer_mode"].as_str() {
        Some("inline") => {
            let blob = client
                .get(SYNC_PATH, &[("action", "blob"), ("entry_id", entry_id.as_str())])
                .await?;
            Some(decode_payload("data", field(&blob, "data"))?)
        }
        Some("chunked") => {
            let total = latest["chunk_count"]
                .as_u64()
                .ok_or_else(|| anyhow!("chunked entry without chunk_count"))? as u32;
            let client = &client;
            let entry_id_ref = entry_id.as_str();
            let parts = stream::iter(0..total)
                .map(|index| async move {
                    let index_param = index.to_string();
                    let chunk = client
                        .get(
                            SYNC_PATH,
                            &[
                                ("action", "chunk"),
                                ("entry_id", entry_id_ref),
                                ("index", index_param.as_str()),
                            ],
                        )
                        .await?;
                    let data = decode_payload("data", field(&chunk, "data"))?;
                    Ok::<_, anyhow::Error>((index, data))
                })
                .buffer_unordered(args.concurrency.max(1))
                .try_collect::<Vec<_>>()
                .await?;
            Some(chunking::reassemble(parts, total)?)
        }
        _ => None,
    };

    let size = payload.as_ref().map_or(0, Vec::len);
    if let Some(path) = &args.output {
        let bytes = match &payload {
            Some(bytes) => bytes.clone(),
            None => serde_json::to_vec_pretty(&latest["manifest"])?,
        };
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    output_success(
        &output_format,
        &format!(
            "Fetched entry {} ({}, {} bytes)",
            entry_id,
            field(&latest, "transfer_mode"),
            size
        ),
        Some(json!({ "entry": latest, "size": size })),
    )
}

pub async fn conflicts(args: ConflictArgs, server: Option<String>, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cli_config()?;
    let client = ApiClient::authenticated(&config, server.as_deref())?;

    let unresolved = if args.unresolved { "true" } else { "false" };
    let conflicts = client
        .get(
            SYNC_PATH,
            &[
                ("action", "conflicts"),
                ("pairing_id", args.pairing.as_str()),
                ("unresolved", unresolved),
            ],
        )
        .await?;
    let items = conflicts.as_array().cloned().unwrap_or_default();

    output_collection(&output_format, "conflicts", &items, "No conflicts", |c| {
        format!(
            "{}  {:<32} local={} remote={} resolution={}",
            field(c, "id"),
            field(c, "item_key"),
            field(c, "local_version"),
            field(c, "remote_version"),
            field(c, "resolution")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_files_go_inline() {
        assert_eq!(plan_upload(0, 512, 256), UploadPlan::Inline);
        assert_eq!(plan_upload(512, 512, 256), UploadPlan::Inline);
        assert_eq!(plan_upload(513, 512, 256), UploadPlan::Chunked { chunks: 3 });
        assert_eq!(plan_upload(1024, 512, 256), UploadPlan::Chunked { chunks: 4 });
    }

    #[test]
    fn chunk_plan_matches_split() {
        let data = vec![7u8; 1000];
        let UploadPlan::Chunked { chunks } = plan_upload(data.len(), 100, 300) else {
            panic!("expected chunked plan");
        };
        assert_eq!(chunking::split(&data, 300).len(), chunks);
    }

    #[test]
    fn default_manifest_names_the_file() {
        let manifest = default_manifest(Path::new("/tmp/flows/export.json"), 42);
        assert_eq!(manifest["file_name"], "export.json");
        assert_eq!(manifest["size"], 42);
    }

    #[test]
    fn direction_is_validated() {
        assert_eq!(parse_direction("outbound").unwrap(), Direction::Outbound);
        assert!(parse_direction("up").is_err());
    }
}
