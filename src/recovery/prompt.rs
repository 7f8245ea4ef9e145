use ratchet_common::OutputFormat;

use super::truncation::ContinuationContext;

pub(crate) fn format_contract(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Diff => {
            "Respond with a unified diff only. Each file starts with `--- ` and `+++ b/<path>` headers \
             followed by complete `@@` hunks."
        }
        OutputFormat::FullFile => {
            "Respond with a JSON array of objects, each with `file_path` and `content` keys, and nothing else."
        }
        OutputFormat::Ndjson => {
            "Respond with one JSON object per line, each with `file_path` and `content` keys, and nothing else."
        }
    }
}

/// Follow-up request asking the agent to finish only what is still owed.
pub fn build_continuation_prompt(context: &ContinuationContext, original_prompt: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Your previous response was cut off by the output length limit. Continue it; \
         do not start over.\n\n",
    );

    prompt.push_str("## Original request\n\n");
    prompt.push_str(original_prompt.trim());
    prompt.push_str("\n\n");

    if !context.completed_files.is_empty() {
        prompt.push_str("## Already delivered (do not regenerate)\n\n");
        for file in &context.completed_files {
            prompt.push_str(&format!("- {}\n", file));
        }
        prompt.push('\n');
    }

    if let Some(partial) = &context.last_partial_file {
        prompt.push_str("## Cut off mid-file\n\n");
        prompt.push_str(&format!(
            "`{}` was interrupted. Emit it again in full, from its first line.\n\n",
            partial
        ));
    }

    if !context.remaining_deliverables.is_empty() {
        prompt.push_str("## Still to deliver\n\n");
        for file in &context.remaining_deliverables {
            prompt.push_str(&format!("- {}\n", file));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Format\n\n");
    prompt.push_str(format_contract(context.format_type));
    prompt.push('\n');
    prompt
}
