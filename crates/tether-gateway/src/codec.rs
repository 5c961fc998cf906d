//! Stream-json codec — turns prompts into input frames and output lines into
//! typed [`AgentEvent`]s. Stateless.

use thiserror::Error;

use tether_types::protocol::{AgentEvent, AgentInput, AgentOutput, ContentBlock};

/// Longest tool summary shown in a notice.
const MAX_SUMMARY_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed agent line: {0}")]
    Malformed(String),
    #[error("unknown agent event kind: {0}")]
    UnknownKind(String),
}

/// Encode one turn as a newline-terminated stream-json frame.
pub fn encode(prompt: &str) -> String {
    // AgentInput only holds strings, serialization cannot fail.
    let mut frame = serde_json::to_string(&AgentInput::text(prompt))
        .unwrap_or_else(|_| String::from("{}"));
    frame.push('\n');
    frame
}

/// Decode one line of agent output.
///
/// A line can carry several content blocks, so the result is a list in block
/// order. Known kinds with nothing to surface decode to an empty list.
pub fn decode_line(line: &str) -> Result<Vec<AgentEvent>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let output: AgentOutput = match serde_json::from_str(trimmed) {
        Ok(output) => output,
        Err(e) => return Err(classify_failure(trimmed, e)),
    };

    let events = match output {
        AgentOutput::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    Some(AgentEvent::TextDelta { text })
                }
                ContentBlock::ToolUse { name, input, .. } => Some(AgentEvent::ToolNotice {
                    summary: summarize_tool_input(&input),
                    name,
                }),
                _ => None,
            })
            .collect(),
        AgentOutput::Result(result) => vec![AgentEvent::Result {
            text: result.result.unwrap_or_default(),
            usage: result.usage,
            cost_usd: result.total_cost_usd,
            is_error: result.is_error,
            subtype: result.subtype,
            agent_session_id: result.session_id,
        }],
        AgentOutput::Error { message, error } => {
            let message = message
                .or_else(|| error.as_ref().and_then(error_text))
                .unwrap_or_else(|| "agent reported an error".to_string());
            vec![AgentEvent::StreamError { message }]
        }
        AgentOutput::System { .. } | AgentOutput::User { .. } | AgentOutput::StreamEvent { .. } => {
            Vec::new()
        }
    };
    Ok(events)
}

fn classify_failure(line: &str, err: serde_json::Error) -> DecodeError {
    let kind = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
    match kind {
        Some(kind) if !AgentOutput::KINDS.contains(&kind.as_str()) => DecodeError::UnknownKind(kind),
        _ => DecodeError::Malformed(format!("{err}: {}", truncate(line, 200))),
    }
}

fn error_text(error: &serde_json::Value) -> Option<String> {
    match error {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Pick the most telling field of a tool call for a one-line notice.
fn summarize_tool_input(input: &serde_json::Value) -> String {
    const KEYS: [&str; 6] = ["command", "file_path", "pattern", "url", "query", "description"];
    let summary = KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_else(|| match input {
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        });
    truncate(&summary, MAX_SUMMARY_CHARS)
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
