use serde::{Deserialize, Serialize};

/// Why the agent stopped emitting output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Normal completion.
    EndTurn,
    /// Cut off by the output length limit.
    MaxTokens,
    StopSequence,
    ToolUse,
    Other(String),
}

impl StopReason {
    /// Parse the provider's raw stop reason string.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "end_turn" | "stop" | "complete" => StopReason::EndTurn,
            "max_tokens" | "length" | "max_output_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            other => StopReason::Other(other.to_string()),
        }
    }

    /// True when the output was cut off for length reasons.
    pub fn is_truncation(&self) -> bool {
        matches!(self, StopReason::MaxTokens)
    }
}

/// Structural format of an agent response.
///
/// Parsers are format-specific and not interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Unified diff, one section per file.
    #[default]
    Diff,
    /// Top-level JSON array of `{"file_path": .., "content": ..}` objects.
    FullFile,
    /// One JSON file object per line.
    Ndjson,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Diff => write!(f, "diff"),
            OutputFormat::FullFile => write!(f, "full_file"),
            OutputFormat::Ndjson => write!(f, "ndjson"),
        }
    }
}
