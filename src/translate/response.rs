use super::openai_types::{
    ChatChunk, ChatResponse, Choice, ChunkChoice, ChunkDelta, ResponseMessage, ResponseUsage,
    Role, ToolCall, ToolCallFunction,
};
use crate::gigachat::types::{ChatCompletion, ChatCompletionChunk, FunctionCall, Usage};

/// Fresh OpenAI-style completion id.
#[must_use]
pub fn new_response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// Translate a GigaChat completion into an OpenAI chat completion.
/// Pure function: `response_id` is generated by the caller.
pub fn completion_to_openai(resp: &ChatCompletion, response_id: &str) -> ChatResponse {
    let choices = resp
        .choices
        .iter()
        .map(|c| Choice {
            index: c.index,
            message: ResponseMessage {
                role: Role::from_vendor(&c.message.role),
                content: c.message.content.clone(),
                refusal: None,
                tool_calls: c.message.function_call.as_ref().map(function_call_to_tool_calls),
            },
            finish_reason: map_finish_reason(c.finish_reason.as_deref()),
        })
        .collect();

    ChatResponse {
        id: response_id.to_string(),
        object: "chat.completion".to_string(),
        created: resp.created,
        model: resp.model.clone(),
        choices,
        usage: map_usage(&resp.usage),
        service_tier: None,
        system_fingerprint: None,
    }
}

/// Translate one GigaChat stream chunk into an OpenAI stream chunk.
/// A missing finish reason stays missing: the choice is still in progress.
pub fn chunk_to_openai(chunk: &ChatCompletionChunk, response_id: &str) -> ChatChunk {
    let choices = chunk
        .choices
        .iter()
        .map(|c| ChunkChoice {
            index: c.index,
            delta: ChunkDelta {
                content: c.delta.content.clone(),
                role: c.delta.role.as_deref().map(Role::from_vendor),
                refusal: None,
                tool_calls: c.delta.function_call.as_ref().map(function_call_to_tool_calls),
            },
            finish_reason: c
                .finish_reason
                .as_deref()
                .map(|reason| map_finish_reason(Some(reason))),
        })
        .collect();

    ChatChunk {
        id: response_id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: chunk.created,
        model: chunk.model.clone(),
        choices,
        usage: chunk.usage.as_ref().map(map_usage),
    }
}

/// Map GigaChat `finish_reason` to OpenAI `finish_reason`
pub fn map_finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("blacklist") => "content_filter".to_string(),
        Some("function_call") => "tool_calls".to_string(),
        Some("error") | None => "stop".to_string(),
        Some(other) => other.to_string(),
    }
}

/// GigaChat reports no token details; they are always present and zero.
pub fn map_usage(usage: &Usage) -> ResponseUsage {
    ResponseUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        ..ResponseUsage::default()
    }
}

/// GigaChat makes at most one function call per turn.
pub fn function_call_to_tool_calls(call: &FunctionCall) -> Vec<ToolCall> {
    vec![ToolCall {
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name: call.name.clone(),
            arguments: serde_json::Value::Object(call.arguments.clone().unwrap_or_default()),
        },
    }]
}
