//! OpenAI-compatible request validation and response envelopes.

use chatrelay_core::{ApiError, ChatMode, ErrorCode, ErrorType, Message, Role};
use serde::Serialize;
use serde_json::{json, Value};

/// A validated `POST /v1/chat/completions` body.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub stream: bool,
    /// Non-standard extension selecting the chat surface.
    pub mode: Option<ChatMode>,
}

fn invalid_request(message: impl Into<String>, param: &str) -> ApiError {
    ApiError {
        message: message.into(),
        kind: ErrorType::InvalidRequestError,
        code: None,
        status: 400,
        param: Some(param.to_string()),
        details: None,
    }
}

/// A body that is not JSON at all.
pub fn malformed_body(reason: impl Into<String>) -> ApiError {
    invalid_request("Request body must be a JSON object", "body").with_details(reason)
}

pub fn parse_request(body: &Value) -> Result<CompletionRequest, ApiError> {
    let messages = validate_messages(body.get("messages"))?;
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mode = match body.get("mode") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(ChatMode::parse(s).ok_or_else(|| {
            invalid_request(
                format!("mode must be one of 'project' | 'temporary', got '{}'", s),
                "mode",
            )
        })?),
        Some(_) => return Err(invalid_request("mode must be a string", "mode")),
    };
    Ok(CompletionRequest {
        messages,
        model,
        stream,
        mode,
    })
}

fn is_present(v: &Value) -> bool {
    match v {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn validate_messages(messages: Option<&Value>) -> Result<Vec<Message>, ApiError> {
    let items = match messages.and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items,
        _ => {
            return Err(ApiError::new(
                ErrorCode::InvalidMessages,
                "`messages` must be a non-empty array",
            )
            .with_param("messages"))
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let role = item.get("role").filter(|r| is_present(r));
            let content = item.get("content").and_then(Value::as_str);
            let (Some(role), Some(content)) = (role, content) else {
                return Err(ApiError::new(
                    ErrorCode::InvalidMessageItem,
                    "Each message must have {role, content:string}",
                )
                .with_param(format!("messages[{}]", i)));
            };
            let role = role.as_str().and_then(Role::parse).ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidRole,
                    "role must be one of 'user' | 'assistant' | 'system'",
                )
                .with_param(format!("messages[{}].role", i))
            })?;
            Ok(Message {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}

/// Identity shared by every frame of one completion.
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl CompletionMeta {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-localproxy-{}", request_id),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatCompletion {
    pub fn new(meta: &CompletionMeta, content: String) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion",
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn frame(meta: &CompletionMeta, delta: ChunkDelta, finish_reason: Option<&'static str>) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion.chunk",
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Opening frame announcing the assistant role.
    pub fn role(meta: &CompletionMeta) -> Self {
        Self::frame(
            meta,
            ChunkDelta {
                role: Some("assistant"),
                content: Some(String::new()),
            },
            None,
        )
    }

    pub fn content(meta: &CompletionMeta, text: String) -> Self {
        Self::frame(
            meta,
            ChunkDelta {
                role: None,
                content: Some(text),
            },
            None,
        )
    }

    pub fn stop(meta: &CompletionMeta) -> Self {
        Self::frame(meta, ChunkDelta::default(), Some("stop"))
    }
}

/// `{"error": {message, type, param, code}}` with optional `details`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorType,
    pub param: Option<String>,
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&ApiError> for ErrorEnvelope {
    fn from(e: &ApiError) -> Self {
        Self {
            error: ErrorBody {
                message: e.message.clone(),
                kind: e.kind,
                param: e.param.clone(),
                code: e.code,
                details: e.details.clone(),
            },
        }
    }
}

pub fn model_list(model: &str) -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": model,
            "object": "model",
            "created": 0,
            "owned_by": "local-proxy",
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let body = json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "mode": "project",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "2+2?"}
            ]
        });
        let req = parse_request(&body).unwrap();
        assert_eq!(req.messages, vec![Message::system("Be brief."), Message::user("2+2?")]);
        assert_eq!(req.model.as_deref(), Some("gpt-4o-mini"));
        assert!(req.stream);
        assert_eq!(req.mode, Some(ChatMode::Project));

        let req = parse_request(&json!({"messages": [{"role": "user", "content": ""}]})).unwrap();
        assert!(!req.stream);
        assert_eq!(req.model, None);
        assert_eq!(req.mode, None);
    }

    #[test]
    fn test_messages_must_be_non_empty_array() {
        for body in [json!({}), json!({"messages": []}), json!({"messages": "hi"})] {
            let err = parse_request(&body).unwrap_err();
            assert!(err.is(ErrorCode::InvalidMessages));
            assert_eq!(err.status, 400);
            assert_eq!(err.kind, ErrorType::InvalidRequestError);
        }
    }

    #[test]
    fn test_message_items_are_checked() {
        let err = parse_request(&json!({"messages": [{"role": "user", "content": 4}]})).unwrap_err();
        assert!(err.is(ErrorCode::InvalidMessageItem));
        assert_eq!(err.param.as_deref(), Some("messages[0]"));

        let err = parse_request(&json!({"messages": [{"role": "", "content": "x"}]})).unwrap_err();
        assert!(err.is(ErrorCode::InvalidMessageItem));

        let err = parse_request(&json!({"messages": [
            {"role": "user", "content": "x"},
            {"role": "tool", "content": "y"}
        ]}))
        .unwrap_err();
        assert!(err.is(ErrorCode::InvalidRole));
        assert_eq!(err.param.as_deref(), Some("messages[1].role"));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let err = parse_request(&json!({
            "mode": "archive",
            "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.param.as_deref(), Some("mode"));
        assert_eq!(err.code, None);
    }

    #[test]
    fn test_completion_envelope() {
        let meta = CompletionMeta::new("abc", "gpt-4o");
        let v = serde_json::to_value(ChatCompletion::new(&meta, "4".into())).unwrap();
        assert_eq!(v["id"], "chatcmpl-localproxy-abc");
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "gpt-4o");
        assert_eq!(v["choices"][0]["message"]["role"], "assistant");
        assert_eq!(v["choices"][0]["message"]["content"], "4");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_chunk_frames() {
        let meta = CompletionMeta::new("abc", "gpt-4o");
        let role = serde_json::to_value(ChatCompletionChunk::role(&meta)).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert!(role["choices"][0]["finish_reason"].is_null());

        let content = serde_json::to_value(ChatCompletionChunk::content(&meta, "He".into())).unwrap();
        assert_eq!(content["choices"][0]["delta"], json!({"content": "He"}));

        let stop = serde_json::to_value(ChatCompletionChunk::stop(&meta)).unwrap();
        assert_eq!(stop["choices"][0]["delta"], json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_error_envelope() {
        let err = ApiError::new(ErrorCode::ResponseTimeout, "Response not completed in time")
            .with_details("busy indicator never seen");
        let v = serde_json::to_value(ErrorEnvelope::from(&err)).unwrap();
        assert_eq!(
            v,
            json!({"error": {
                "message": "Response not completed in time",
                "type": "server_error",
                "param": null,
                "code": "response_timeout",
                "details": "busy indicator never seen"
            }})
        );

        let v = serde_json::to_value(ErrorEnvelope::from(&ApiError::internal("boom"))).unwrap();
        assert!(v["error"].get("details").is_none());
        assert!(v["error"]["code"].is_null());
    }

    #[test]
    fn test_model_list() {
        let v = model_list("gpt-4o");
        assert_eq!(v["data"][0]["id"], "gpt-4o");
        assert_eq!(v["data"][0]["owned_by"], "local-proxy");
    }
}
