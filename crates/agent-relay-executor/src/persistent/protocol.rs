//! Stream-json record codec.
//!
//! Records are decoded field by field from an untyped JSON value so that a
//! missing or oddly shaped field degrades to `None` instead of failing the
//! whole record.

use agent_relay_core::TurnUsage;
use serde_json::{Value, json};

/// Flags selecting the stream-json protocol on launch.
pub const STREAM_JSON_FLAGS: &[&str] = &[
    "-p",
    "--input-format",
    "stream-json",
    "--output-format",
    "stream-json",
    "--verbose",
];

/// Per-launch arguments: model selector and resume token.
#[must_use]
pub fn launch_args(model: Option<&str>, resume_token: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(token) = resume_token {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }
    args
}

/// Encode one outbound user message as a request record.
#[must_use]
pub fn encode_user_message(text: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
    .to_string()
}

/// A decoded protocol record.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub kind: RecordKind,
    /// Session token, on any record that carries one.
    pub session_id: Option<String>,
}

/// What a record represents.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Session/system notice.
    System { subtype: Option<String> },
    /// Assistant output made of content blocks.
    Assistant(Vec<ContentBlock>),
    /// Terminal record of a turn.
    Result(TurnResult),
    /// Anything else, tagged with its `type` if present.
    Other(Option<String>),
}

/// One block of assistant content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Plain narrative text.
    Text(String),
    /// A tool invocation; `message` is the `input.message` argument.
    ToolUse {
        name: String,
        message: Option<String>,
    },
    Other,
}

/// Payload of a turn-result record.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub summary: Option<String>,
    pub is_error: bool,
    pub usage: TurnUsage,
}

impl StreamRecord {
    /// Decode one record line.
    ///
    /// # Errors
    /// Returns error only if the line is not JSON at all.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::from_value(&value))
    }

    /// Classify an already parsed record.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let session_id = str_field(value, "session_id");
        let kind = match value.get("type").and_then(Value::as_str) {
            Some("system") => RecordKind::System {
                subtype: str_field(value, "subtype"),
            },
            Some("assistant") => RecordKind::Assistant(content_blocks(value)),
            Some("result") => RecordKind::Result(turn_result(value)),
            other => RecordKind::Other(other.map(str::to_string)),
        };
        Self { kind, session_id }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_blocks(value: &Value) -> Vec<ContentBlock> {
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => str_field(block, "text").map_or(ContentBlock::Other, ContentBlock::Text),
            Some("tool_use") => ContentBlock::ToolUse {
                name: str_field(block, "name").unwrap_or_default(),
                message: block.get("input").and_then(|i| str_field(i, "message")),
            },
            _ => ContentBlock::Other,
        })
        .collect()
}

fn turn_result(value: &Value) -> TurnResult {
    let usage = value.get("usage");
    let usage_u64 = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64);
    TurnResult {
        summary: str_field(value, "result"),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        usage: TurnUsage {
            cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            num_turns: value.get("num_turns").and_then(Value::as_u64),
            input_tokens: usage_u64("input_tokens"),
            output_tokens: usage_u64("output_tokens"),
            raw: usage.cloned().unwrap_or(Value::Null),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args() {
        assert!(launch_args(None, None).is_empty());
        assert_eq!(
            launch_args(Some("opus"), Some("tok-1")),
            vec!["--model", "opus", "--resume", "tok-1"]
        );
    }

    #[test]
    fn test_encode_user_message_escapes() {
        let line = encode_user_message("say \"hi\"\nplease");
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"], "say \"hi\"\nplease");
    }

    #[test]
    fn test_decode_assistant_blocks() {
        let record = StreamRecord::decode(
            r#"{"type":"assistant","session_id":"s1","message":{"content":[
                {"type":"text","text":"thinking"},
                {"type":"tool_use","name":"mcp__relay__chat","input":{"message":"hi there"}},
                {"type":"tool_use","name":"Bash","input":{"command":"ls"}},
                {"type":"image"}
            ]}}"#,
        )
        .unwrap();

        assert_eq!(record.session_id.as_deref(), Some("s1"));
        assert_eq!(
            record.kind,
            RecordKind::Assistant(vec![
                ContentBlock::Text("thinking".into()),
                ContentBlock::ToolUse {
                    name: "mcp__relay__chat".into(),
                    message: Some("hi there".into()),
                },
                ContentBlock::ToolUse {
                    name: "Bash".into(),
                    message: None,
                },
                ContentBlock::Other,
            ])
        );
    }

    #[test]
    fn test_decode_result_with_usage() {
        let record = StreamRecord::decode(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"done",
                "session_id":"s1","total_cost_usd":0.25,"duration_ms":1200,"num_turns":3,
                "usage":{"input_tokens":10,"output_tokens":20}}"#,
        )
        .unwrap();

        let RecordKind::Result(result) = record.kind else {
            panic!("expected result record");
        };
        assert_eq!(result.summary.as_deref(), Some("done"));
        assert!(!result.is_error);
        assert_eq!(result.usage.cost_usd, Some(0.25));
        assert_eq!(result.usage.num_turns, Some(3));
        assert_eq!(result.usage.output_tokens, Some(20));
    }

    #[test]
    fn test_decode_is_defensive() {
        let record = StreamRecord::decode(r#"{"type":"assistant","message":"not an object"}"#).unwrap();
        assert_eq!(record.kind, RecordKind::Assistant(Vec::new()));

        let record = StreamRecord::decode(r#"{"session_id":"s9"}"#).unwrap();
        assert_eq!(record.kind, RecordKind::Other(None));
        assert_eq!(record.session_id.as_deref(), Some("s9"));

        assert!(StreamRecord::decode("not json").is_err());
    }
}
