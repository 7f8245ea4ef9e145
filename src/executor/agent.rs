use anyhow::Result;
use async_trait::async_trait;
use ratchet_common::{OutputFormat, StopReason};
use serde::{Deserialize, Serialize};

use crate::recovery::prompt::format_contract;

/// One request to the content-generating agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: String,
    pub phase_id: String,
    pub attempt: u32,
    /// Zero for the first request of an attempt, then one per continuation.
    pub round: u32,
    pub prompt: String,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub tokens_used: u64,
}

impl AgentResponse {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
            tokens_used: 0,
        }
    }

    pub fn truncated(text: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            text: text.into(),
            stop_reason: StopReason::MaxTokens,
            tokens_used,
        }
    }
}

/// Abstraction over the agent client.
/// The engine only needs raw text and a stop reason back.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn complete(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Prompt for the first request of an attempt.
///
/// Later attempts carry the previous failure so the agent can correct it.
pub fn build_phase_prompt(
    name: &str,
    instructions: &str,
    deliverables: &[String],
    format: OutputFormat,
    previous_failure: Option<&str>,
) -> String {
    let mut prompt = format!("## Phase: {}\n\n{}\n", name, instructions.trim());
    if !deliverables.is_empty() {
        prompt.push_str("\n### Deliverables\n");
        for d in deliverables {
            prompt.push_str(&format!("- {}\n", d));
        }
    }
    prompt.push_str("\n### Output format\n");
    prompt.push_str(format_contract(format));
    prompt.push('\n');
    if let Some(failure) = previous_failure {
        prompt.push_str("\n### Previous attempt failed\n");
        prompt.push_str(failure.trim());
        prompt.push('\n');
    }
    prompt
}
