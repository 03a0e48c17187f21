use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::usage_service::{Metric, UsageError, UsageService};
use crate::clients::anthropic::{CompletionProvider, ProviderError};
use crate::database::DatabaseError;

pub const MAX_PROMPT_LENGTH: usize = 4000;

const SYSTEM_PROMPT: &str = r#"You design automation workflows. Reply with a single JSON object and nothing else.

Shape:
{
  "name": "short human readable name",
  "description": "one sentence",
  "trigger": { "type": "schedule | webhook | event | manual", "config": { } },
  "steps": [
    { "id": "unique_step_id", "type": "action kind", "name": "label", "config": { }, "next": ["id of a following step"] }
  ]
}

Rules: step ids are unique, every id in "next" names another step, a step never lists itself in "next", and the last steps have an empty "next"."#;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Prompt(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    InvalidWorkflow(String),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WorkflowGeneration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    pub model: String,
    pub workflow: Value,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCounts {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Validated workflow plus what it cost
#[derive(Debug, Clone, Serialize)]
pub struct Synthesis {
    pub workflow: Value,
    pub model: String,
    pub usage: TokenCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedWorkflow {
    pub generation_id: Uuid,
    #[serde(flatten)]
    pub synthesis: Synthesis,
}

fn validate_prompt(prompt: &str) -> Result<&str, WorkflowError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(WorkflowError::Prompt("Prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(WorkflowError::Prompt(format!(
            "Prompt must be at most {} characters",
            MAX_PROMPT_LENGTH
        )));
    }
    Ok(prompt)
}

fn user_message(prompt: &str, existing: Option<&Value>) -> String {
    match existing {
        Some(workflow) => format!(
            "Refine this existing workflow:\n```json\n{}\n```\n\nRequested change: {}",
            serde_json::to_string_pretty(workflow).unwrap_or_else(|_| workflow.to_string()),
            prompt
        ),
        None => format!("Create a workflow for: {}", prompt),
    }
}

/// Pull the workflow object out of a model reply. A fenced ```json block
/// wins; otherwise the outermost braces are used.
pub fn extract_json(reply: &str) -> Result<Value, WorkflowError> {
    let candidate = fenced_block(reply).or_else(|| {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        (end > start).then(|| &reply[start..=end])
    });

    let candidate = candidate.ok_or_else(|| WorkflowError::InvalidWorkflow("reply contains no JSON object".to_string()))?;
    let value: Value = serde_json::from_str(candidate.trim())
        .map_err(|e| WorkflowError::InvalidWorkflow(format!("reply is not valid JSON: {}", e)))?;

    if !value.is_object() {
        return Err(WorkflowError::InvalidWorkflow("reply is not a JSON object".to_string()));
    }
    Ok(value)
}

fn fenced_block(reply: &str) -> Option<&str> {
    let start = reply.find("```json")? + "```json".len();
    let rest = &reply[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// Structural checks on a synthesized workflow
pub fn validate_workflow(workflow: &Value) -> Result<(), WorkflowError> {
    let invalid = |msg: &str| WorkflowError::InvalidWorkflow(msg.to_string());

    let name = workflow["name"].as_str().unwrap_or("").trim();
    if name.is_empty() {
        return Err(invalid("workflow name is missing"));
    }

    let trigger_type = workflow["trigger"]["type"].as_str().unwrap_or("").trim();
    if trigger_type.is_empty() {
        return Err(invalid("trigger.type is missing"));
    }

    let steps = match workflow["steps"].as_array() {
        Some(steps) if !steps.is_empty() => steps,
        _ => return Err(invalid("workflow has no steps")),
    };

    let mut ids = HashSet::new();
    for step in steps {
        let id = step["id"].as_str().unwrap_or("").trim();
        if id.is_empty() {
            return Err(invalid("every step needs an id"));
        }
        if !ids.insert(id) {
            return Err(WorkflowError::InvalidWorkflow(format!("duplicate step id '{}'", id)));
        }
    }

    for step in steps {
        let id = step["id"].as_str().unwrap_or("").trim();
        let next = match &step["next"] {
            Value::Null => continue,
            Value::Array(next) => next,
            _ => return Err(WorkflowError::InvalidWorkflow(format!("step '{}' has a non-list next", id))),
        };
        for target in next {
            let target = target.as_str().unwrap_or("").trim();
            if target == id {
                return Err(WorkflowError::InvalidWorkflow(format!("step '{}' points at itself", id)));
            }
            if !ids.contains(target) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "step '{}' points at unknown step '{}'",
                    id, target
                )));
            }
        }
    }

    Ok(())
}

/// Ask the provider for a workflow and validate what comes back
pub async fn synthesize(
    provider: &dyn CompletionProvider,
    prompt: &str,
    existing: Option<&Value>,
) -> Result<Synthesis, WorkflowError> {
    let prompt = validate_prompt(prompt)?;
    let completion = provider.complete(SYSTEM_PROMPT, &user_message(prompt, existing)).await?;

    let workflow = extract_json(&completion.text)?;
    validate_workflow(&workflow)?;

    Ok(Synthesis {
        workflow,
        model: completion.model,
        usage: TokenCounts {
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        },
    })
}

pub struct WorkflowService {
    pool: PgPool,
    usage: UsageService,
    provider: Arc<dyn CompletionProvider>,
}

impl WorkflowService {
    pub fn new(pool: PgPool, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            usage: UsageService::new(pool.clone()),
            pool,
            provider,
        }
    }

    /// Quota check, synthesis, metering and storage, in that order
    pub async fn generate(
        &self,
        user_id: Uuid,
        prompt: &str,
        existing: Option<&Value>,
    ) -> Result<GeneratedWorkflow, WorkflowError> {
        validate_prompt(prompt)?;
        self.usage.check_quota(user_id, Metric::AiGeneration).await?;

        let synthesis = synthesize(self.provider.as_ref(), prompt, existing).await?;
        self.usage.record_usage(user_id, Metric::AiGeneration, 1).await?;

        let generation_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO workflow_generations (id, user_id, prompt, model, workflow, input_tokens, output_tokens)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(generation_id)
        .bind(user_id)
        .bind(prompt.trim())
        .bind(&synthesis.model)
        .bind(&synthesis.workflow)
        .bind(synthesis.usage.input_tokens as i32)
        .bind(synthesis.usage.output_tokens as i32)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        info!("Generated workflow {} for user {} with {}", generation_id, user_id, synthesis.model);
        Ok(GeneratedWorkflow {
            generation_id,
            synthesis,
        })
    }

    pub async fn list(&self, user_id: Uuid, limit: i64) -> Result<Vec<WorkflowGeneration>, WorkflowError> {
        let generations = sqlx::query_as::<_, WorkflowGeneration>(
            "SELECT id, user_id, prompt, model, workflow, input_tokens, output_tokens, created_at
             FROM workflow_generations
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(generations)
    }
}
