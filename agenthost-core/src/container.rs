//! Container subprocess wire protocol shared between the host daemon and the
//! in-container agent runtime.
//!
//! Host → container: one JSON object written to stdin per turn (`ContainerInput`).
//! Container → host: line-delimited JSON records on stdout (`ContainerOutputRecord`),
//! one per line. Any non-JSON text on stdout is logged and ignored by the reader.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeKind;

/// Request written to the container's standard input for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub chat_jid: String,
    pub folder: String,
    pub is_main: bool,
    /// Secrets and extra environment, flattened onto the request. Zeroed from
    /// memory after the write to the subprocess completes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// One parsed line of container stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerOutputRecord {
    Message {
        text: String,
    },
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        error: String,
    },
    Done,
}

/// Structured event delivered to an output-router subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterEvent {
    Message {
        text: String,
    },
    Error {
        error: String,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Outcome of one container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

/// Volume mount specification for container execution.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
    /// Subdirectory names to hide via tmpfs overlay.
    pub exclude: Vec<String>,
}

/// Container image name keyed by runtime.
pub fn container_image(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "agenthost-agent:latest",
        RuntimeKind::Gemini => "agenthost-agent-gemini:latest",
        RuntimeKind::Codex => "agenthost-agent-codex:latest",
    }
}

/// Directory name under `container/` holding a runtime's agent entrypoint
/// source, mounted read-only into the container at build/run time.
pub fn runner_dir_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "runner-claude",
        RuntimeKind::Gemini => "runner-gemini",
        RuntimeKind::Codex => "runner-codex",
    }
}

/// Path inside the container where that runtime's entrypoint source is
/// mounted.
pub fn runner_container_path(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "/workspace/runner",
        RuntimeKind::Gemini => "/workspace/runner",
        RuntimeKind::Codex => "/workspace/runner",
    }
}

/// Splits complete, newline-terminated lines out of a growing stdout buffer.
///
/// Returns the complete lines found and the number of bytes consumed; any
/// trailing partial line is left in the caller's buffer for the next read.
/// Blank lines are skipped. This is deliberately forgiving: a line that is
/// not valid JSON is returned as-is and the caller logs-and-skips it rather
/// than treating it as a framing error.
pub fn extract_output_lines(buf: &str) -> (Vec<String>, usize) {
    let mut lines = Vec::new();
    let mut consumed = 0;

    while let Some(rel_newline) = buf[consumed..].find('\n') {
        let line_end = consumed + rel_newline;
        let line = buf[consumed..line_end].trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
        consumed = line_end + 1;
    }

    (lines, consumed)
}

/// Strips `<internal>...</internal>` spans from agent message text before
/// it is forwarded to a subscriber.
pub fn strip_internal_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<internal>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</internal>") {
                    Some(end_rel) => {
                        let end = start + end_rel + "</internal>".len();
                        rest = &rest[end..];
                    }
                    None => break, // unterminated tag: drop the remainder
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_input_serializes_camel_case() {
        let input = ContainerInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            chat_jid: "team-a".to_string(),
            folder: "team-a".to_string(),
            is_main: false,
            env: HashMap::new(),
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatJid\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"env\""));
    }

    #[test]
    fn output_record_variants_parse() {
        let msg: ContainerOutputRecord =
            serde_json::from_str(r#"{"type":"message","text":"hi"}"#).unwrap();
        assert_eq!(msg, ContainerOutputRecord::Message { text: "hi".into() });

        let sess: ContainerOutputRecord =
            serde_json::from_str(r#"{"type":"session","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            sess,
            ContainerOutputRecord::Session {
                session_id: "s1".into()
            }
        );

        let err: ContainerOutputRecord =
            serde_json::from_str(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert_eq!(err, ContainerOutputRecord::Error { error: "boom".into() });

        let done: ContainerOutputRecord = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(done, ContainerOutputRecord::Done);
    }

    #[test]
    fn extract_lines_leaves_partial_tail() {
        let buf = "{\"type\":\"message\",\"text\":\"a\"}\n{\"type\":\"don";
        let (lines, consumed) = extract_output_lines(buf);
        assert_eq!(lines.len(), 1);
        assert_eq!(&buf[consumed..], "{\"type\":\"don");
    }

    #[test]
    fn extract_lines_skips_blank_lines() {
        let buf = "\n\n{\"type\":\"done\"}\n";
        let (lines, consumed) = extract_output_lines(buf);
        assert_eq!(lines.len(), 1);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn extract_lines_empty_buffer() {
        let (lines, consumed) = extract_output_lines("");
        assert!(lines.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn strip_internal_blocks_removes_span() {
        let text = "before <internal>hidden reasoning</internal> after";
        assert_eq!(strip_internal_blocks(text), "before  after");
    }

    #[test]
    fn strip_internal_blocks_multiple_spans() {
        let text = "<internal>a</internal>keep<internal>b</internal>";
        assert_eq!(strip_internal_blocks(text), "keep");
    }

    #[test]
    fn strip_internal_blocks_noop_without_tag() {
        let text = "nothing hidden here";
        assert_eq!(strip_internal_blocks(text), text);
    }

    #[test]
    fn container_image_names() {
        assert_eq!(container_image(RuntimeKind::Claude), "agenthost-agent:latest");
        assert_eq!(
            container_image(RuntimeKind::Gemini),
            "agenthost-agent-gemini:latest"
        );
    }
}
