use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::time::Duration;

use super::base::{ChatEvent, GenerationParams, Usage};
use super::factory::ProviderKind;
use crate::errors::{ChatError, ErrorKind};
use crate::models::message::ChatMessage;
use crate::models::role::Role;

const REDACTED: &str = "[REDACTED]";
/// Inserted when a conversation would otherwise open with an assistant turn.
const CONVERSATION_OPENER: &str = "Continue.";

/// Render a message's text for the wire. Context messages gain a provenance line.
pub fn wire_text(message: &ChatMessage) -> Cow<'_, str> {
    match (message.role, message.source_block_id) {
        (Role::Context, Some(source)) => Cow::Owned(format!(
            "[Context from block {}]\n{}",
            source, message.content
        )),
        (Role::Context, None) => Cow::Owned(format!("[Context]\n{}", message.content)),
        _ => Cow::Borrowed(&message.content),
    }
}

/// Convert normalized messages to OpenAI's chat message specification
pub fn messages_to_openai_spec(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|message| !message.content.is_empty())
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User | Role::Context => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": wire_text(message) })
        })
        .collect()
}

/// Add the generation parameters that OpenAI-compatible endpoints accept
pub fn apply_openai_params(payload: &mut Value, params: &GenerationParams) {
    if let Some(temp) = params.temperature {
        payload["temperature"] = json!(temp);
    }
    if let Some(tokens) = params.max_tokens {
        payload["max_tokens"] = json!(tokens);
    }
    if let Some(top_p) = params.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(penalty) = params.frequency_penalty {
        payload["frequency_penalty"] = json!(penalty);
    }
    if let Some(penalty) = params.presence_penalty {
        payload["presence_penalty"] = json!(penalty);
    }
}

/// Read a token count, dropping values that are negative or too large for `i32`.
/// Some providers report whole counts as floats.
pub fn token_count(value: Option<&Value>) -> Option<i32> {
    let value = value?;
    let count = match value.as_i64() {
        Some(count) => count,
        None => {
            let float = value.as_f64().filter(|f| f.fract() == 0.0)?;
            if float.abs() > i64::MAX as f64 {
                return None;
            }
            float as i64
        }
    };
    i32::try_from(count).ok().filter(|count| *count >= 0)
}

pub fn get_openai_usage(data: &Value) -> Option<Usage> {
    let usage = data.get("usage").filter(|u| u.is_object())?;
    Some(Usage::new(
        token_count(usage.get("prompt_tokens")),
        token_count(usage.get("completion_tokens")),
        token_count(usage.get("total_tokens")),
    ))
}

/// Convert OpenAI's complete response into a final event
pub fn openai_response_to_event(
    kind: ProviderKind,
    response: &Value,
) -> Result<ChatEvent, ChatError> {
    let message = response
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| malformed(kind, "response has no choices"))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();

    let mut event = ChatEvent::delta(text).finished();
    if let Some(usage) = get_openai_usage(response) {
        event = event.with_usage(usage);
    }
    Ok(event)
}

/// Convert one OpenAI-style stream chunk. `[DONE]` terminates the stream.
pub fn openai_stream_event(kind: ProviderKind, data: &str) -> Result<Option<ChatEvent>, ChatError> {
    if data.trim() == "[DONE]" {
        return Ok(Some(ChatEvent::final_event()));
    }
    let chunk: Value =
        serde_json::from_str(data).map_err(|_| malformed(kind, "unreadable stream chunk"))?;

    if let Some(error) = chunk.get("error") {
        return Err(stream_error(kind, error));
    }

    let delta = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let usage = get_openai_usage(&chunk);

    if delta.is_empty() && usage.is_none() {
        return Ok(None);
    }
    let mut event = ChatEvent::delta(delta);
    event.usage = usage;
    Ok(Some(event))
}

/// A conversation reshaped for APIs that want alternating turns and a separate system field
#[derive(Debug, Default, PartialEq)]
pub struct Turns {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
}

#[derive(Debug, PartialEq)]
pub struct Turn {
    pub role: &'static str,
    pub texts: Vec<String>,
}

/// Lift system messages out, merge consecutive same-role messages and make sure the
/// conversation opens with a user turn.
pub fn split_turns(messages: &[ChatMessage], assistant_role: &'static str) -> Turns {
    let mut system = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();

    for message in messages.iter().filter(|m| !m.content.is_empty()) {
        let role = match message.role {
            Role::System => {
                system.push(message.content.clone());
                continue;
            }
            Role::User | Role::Context => "user",
            Role::Assistant => assistant_role,
        };
        let text = wire_text(message).into_owned();
        match turns.last_mut() {
            Some(last) if last.role == role => last.texts.push(text),
            _ => turns.push(Turn {
                role,
                texts: vec![text],
            }),
        }
    }

    if turns.first().is_some_and(|turn| turn.role != "user") {
        turns.insert(
            0,
            Turn {
                role: "user",
                texts: vec![CONVERSATION_OPENER.to_string()],
            },
        );
    }

    Turns {
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        turns,
    }
}

/// Status to taxonomy mapping shared by every provider
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::AuthFailed,
        429 => ErrorKind::RateLimited,
        400 => ErrorKind::InvalidRequest,
        500..=599 => ErrorKind::ProviderUnavailable,
        _ => ErrorKind::Unknown,
    }
}

/// Classify an error `type`/`code` string reported inside a response body or stream
pub fn classify_error_type(error_type: &str) -> ErrorKind {
    let error_type = error_type.to_ascii_lowercase();
    if error_type.contains("rate_limit") || error_type.contains("resource_exhausted") {
        ErrorKind::RateLimited
    } else if error_type.contains("auth")
        || error_type.contains("permission")
        || error_type.contains("api_key")
    {
        ErrorKind::AuthFailed
    } else if error_type.contains("overloaded")
        || error_type.contains("server_error")
        || error_type.contains("api_error")
        || error_type.contains("unavailable")
        || error_type.contains("internal")
    {
        ErrorKind::ProviderUnavailable
    } else if error_type.contains("invalid") {
        ErrorKind::InvalidRequest
    } else {
        ErrorKind::Unknown
    }
}

/// `Retry-After` in seconds, or the `retry-after-ms` variant some providers send
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Some(Duration::from_millis(ms.max(0.0) as u64));
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| Duration::from_millis((secs.max(0.0) * 1000.0) as u64))
}

/// Remove every occurrence of the secret from provider text
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED)
}

/// Pull a human-readable message out of the common error body shapes
pub fn error_detail(body: &Value) -> Option<String> {
    match body.get("error") {
        Some(Value::String(message)) => return Some(message.clone()),
        Some(error) => {
            if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
                return Some(message.to_string());
            }
        }
        None => {}
    }
    body.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

pub fn map_status_error(
    kind: ProviderKind,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    detail: Option<String>,
    secret: &str,
) -> ChatError {
    let diagnostic = redact(body, secret);
    let error = match classify_status(status) {
        // Never echo provider text for auth failures.
        ErrorKind::AuthFailed => ChatError::auth_failed(kind),
        ErrorKind::RateLimited => ChatError::rate_limited(kind, parse_retry_after(headers)),
        error_kind => {
            let detail = detail
                .map(|d| redact(&d, secret))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            ChatError::new(
                error_kind,
                format!("{} returned {}: {}", kind, status.as_u16(), detail),
            )
            .with_provider(kind)
        }
    };
    error.with_diagnostic(diagnostic)
}

/// Reclassify transport failures (timeouts, refused connections, broken bodies)
pub fn map_transport_error(kind: ProviderKind, err: &reqwest::Error, secret: &str) -> ChatError {
    let diagnostic = redact(&err.to_string(), secret);
    let error = if err.is_timeout() {
        ChatError::timeout(kind)
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ChatError::unavailable(kind, format!("Could not reach {}", kind))
    } else {
        ChatError::new(ErrorKind::Unknown, format!("Request to {} failed", kind)).with_provider(kind)
    };
    error.with_diagnostic(diagnostic)
}

/// Error reported inside a stream or a 200 body
pub fn stream_error(kind: ProviderKind, error: &Value) -> ChatError {
    let error_type = ["type", "code", "status"]
        .iter()
        .find_map(|field| error.get(*field).and_then(|t| t.as_str()))
        .unwrap_or_default();
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("stream interrupted");
    match classify_error_type(error_type) {
        ErrorKind::AuthFailed => ChatError::auth_failed(kind),
        ErrorKind::RateLimited => ChatError::rate_limited(kind, None),
        error_kind => ChatError::new(error_kind, format!("{}: {}", kind, message)).with_provider(kind),
    }
}

pub fn malformed(kind: ProviderKind, what: &str) -> ChatError {
    ChatError::new(
        ErrorKind::Unknown,
        format!("Malformed response from {}: {}", kind, what),
    )
    .with_provider(kind)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
