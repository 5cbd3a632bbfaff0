use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::{AgentError, AgentResult};
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Convert internal Message history to the Responses API input item list
///
/// Translation never fails: blocks with no wire mapping degrade to a
/// text item carrying their JSON form. A message made up entirely of
/// operator actions is narrated as user turns, since the function_call
/// slot is reserved for model-issued calls.
pub fn messages_to_responses_spec(messages: &[Message]) -> Vec<Value> {
    let mut items = Vec::new();

    for message in messages {
        let operator_turn = message
            .content
            .iter()
            .all(|block| matches!(block, MessageContent::UserAction(_)));

        if operator_turn {
            for block in &message.content {
                if let MessageContent::UserAction(action) = block {
                    for child in &action.content {
                        match child {
                            MessageContent::ToolRequest(request) => {
                                items.push(user_text_item(&narrate_action(&request.tool_call)));
                            }
                            MessageContent::Image(image) => {
                                items.push(user_image_item(image));
                            }
                            _ => {}
                        }
                    }
                }
            }
            continue;
        }

        for block in &message.content {
            match block {
                MessageContent::Text(text) => match message.role {
                    Role::User => items.push(user_text_item(&text.text)),
                    Role::Assistant => items.push(assistant_text_item(&text.text)),
                },
                MessageContent::ToolRequest(request) => {
                    // only the model issues function calls
                    if message.role == Role::Assistant {
                        items.push(json!({
                            "type": "function_call",
                            "call_id": request.id,
                            "name": sanitize_function_name(&request.tool_call.name),
                            "arguments": request.tool_call.arguments.to_string(),
                        }));
                    }
                }
                MessageContent::Thinking(thinking) => {
                    items.push(json!({
                        "type": "reasoning",
                        "id": thinking.signature,
                        "encrypted_content": thinking.thinking,
                        "summary": [],
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    for content in &response.tool_result {
                        match content {
                            Content::Text(text) => {
                                items.push(json!({
                                    "type": "function_call_output",
                                    "call_id": response.id,
                                    "output": text.text,
                                }));
                            }
                            Content::Image(image) => {
                                // The function output slot is text only, so the
                                // pixels travel as a user turn right after the
                                // placeholder output.
                                items.push(json!({
                                    "type": "function_call_output",
                                    "call_id": response.id,
                                    "output": "screenshot",
                                }));
                                items.push(user_image_item(image));
                            }
                        }
                    }
                }
                MessageContent::Image(_) | MessageContent::UserAction(_) => {
                    warn!("content block has no wire mapping here, sending as text");
                    items.push(user_text_item(
                        &serde_json::to_string(block).unwrap_or_else(|_| "{}".to_string()),
                    ));
                }
            }
        }
    }

    items
}

fn narrate_action(tool_call: &ToolCall) -> String {
    let input = serde_json::to_string_pretty(&tool_call.arguments)
        .unwrap_or_else(|_| tool_call.arguments.to_string());
    format!("User performed action: {}\n{}", tool_call.name, input)
}

fn user_text_item(text: &str) -> Value {
    json!({
        "type": "message",
        "role": "user",
        "content": [{"type": "input_text", "text": text}],
    })
}

fn assistant_text_item(text: &str) -> Value {
    json!({
        "type": "message",
        "role": "assistant",
        "content": [{"type": "output_text", "text": text}],
    })
}

fn user_image_item(image: &ImageContent) -> Value {
    json!({
        "type": "message",
        "role": "user",
        "content": [convert_image(image)],
    })
}

/// Convert an image content into an inline Responses image part
pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "input_image",
        "image_url": format!("data:{};base64,{}", image.mime_type, image.data),
        "detail": "high",
    })
}

/// Convert internal Tool format to the Responses API tool specification
pub fn tools_to_responses_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }));
    }

    Ok(result)
}

/// Convert a Responses API body to an internal assistant Message
///
/// Unsupported and unrecognized output items are kept as a text block
/// holding their JSON form. A function call whose arguments do not
/// parse is a hard error: it cannot be executed safely.
pub fn response_to_message(response: Value) -> AgentResult<Message> {
    let outputs = response
        .get("output")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut content = Vec::new();

    for item in outputs {
        match item.get("type").and_then(|v| v.as_str()) {
            Some("message") => {
                if let Some(parts) = item.get("content").and_then(|v| v.as_array()) {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            content.push(MessageContent::text(text));
                        } else if let Some(refusal) = part.get("refusal").and_then(|v| v.as_str())
                        {
                            content.push(MessageContent::text(format!("Refusal: {}", refusal)));
                        }
                    }
                }
            }
            Some("function_call") => {
                let id = item["call_id"].as_str().unwrap_or_default().to_string();
                let function_name = item["name"].as_str().unwrap_or_default().to_string();
                let arguments = item["arguments"].as_str().unwrap_or_default();

                if !is_valid_function_name(&function_name) {
                    return Err(AgentError::ToolNotFound(format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        function_name
                    )));
                }

                let params = serde_json::from_str::<Value>(arguments).map_err(|e| {
                    AgentError::InvalidParameters(format!(
                        "Could not interpret tool use parameters for id {}: {}",
                        id, e
                    ))
                })?;
                content.push(MessageContent::tool_request(
                    id,
                    ToolCall::new(function_name, params),
                ));
            }
            Some("reasoning") => {
                // nothing to replay unless the provider sent the encrypted state
                if let Some(encrypted) = item.get("encrypted_content").and_then(|v| v.as_str()) {
                    let signature = item["id"].as_str().unwrap_or_default();
                    content.push(MessageContent::thinking(encrypted, signature));
                }
            }
            Some("image_generation_call")
            | Some("code_interpreter_call")
            | Some("local_shell_call")
            | Some("mcp_call")
            | Some("mcp_list_tools")
            | Some("mcp_approval_request") => {
                warn!("unsupported provider call item, keeping as text");
                content.push(MessageContent::text(item.to_string()));
            }
            _ => {
                warn!("unrecognized output item, keeping as text");
                content.push(MessageContent::text(item.to_string()));
            }
        }
    }

    Ok(Message {
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content,
    })
}

fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

fn is_valid_function_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    re.is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
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

#[derive(Debug, thiserror::Error)]
#[error("Request was interrupted before the provider replied")]
pub struct InterruptedError;
