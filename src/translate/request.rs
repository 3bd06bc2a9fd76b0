//! Translate OpenAI chat requests into GigaChat chat requests.
//!
//! A part-list message expands into one GigaChat message per supported part.
//! Inline images are uploaded to GigaChat file storage and referenced as
//! attachments; uploads are deduplicated by the SHA-256 of the data URI
//! through the persistent [`KvStore`].

use base64::prelude::{Engine as _, BASE64_STANDARD};
use sha2::{Digest, Sha256};

use super::openai_types::{ChatRequest, ContentPart, Message, MessageContent, Tool, ToolCall};
use crate::cache::KvStore;
use crate::error::{AdapterError, Result};
use crate::gigachat::types::{
    Chat, ChatFunctionCall, FileUpload, Function, FunctionCall, FunctionCallSelector, Messages,
};
use crate::gigachat::VendorApi;
use crate::logging::{LogLevel, SharedLogger};

/// Everything the translator touches besides the request itself.
pub struct RequestTranslator<'a> {
    vendor: &'a dyn VendorApi,
    cache: &'a KvStore,
    logger: &'a SharedLogger,
    profanity_check: Option<bool>,
}

impl<'a> RequestTranslator<'a> {
    pub fn new(vendor: &'a dyn VendorApi, cache: &'a KvStore, logger: &'a SharedLogger) -> Self {
        Self {
            vendor,
            cache,
            logger,
            profanity_check: None,
        }
    }

    #[must_use]
    pub fn with_profanity_check(mut self, profanity_check: Option<bool>) -> Self {
        self.profanity_check = profanity_check;
        self
    }

    /// Translate an OpenAI chat request into a GigaChat chat request,
    /// uploading any inline images it contains.
    pub async fn translate(&self, req: &ChatRequest) -> Result<Chat> {
        let mut messages = Vec::new();
        for msg in &req.messages {
            let mut translated = self.translate_message(msg).await?;
            messages.append(&mut translated);
        }

        let functions = req.tools.as_deref().map(translate_tools);
        let function_call = match req.tool_choice {
            Some(ref choice) => translate_tool_choice(choice, self.logger)?,
            None => None,
        };

        Ok(Chat {
            model: req.model.clone(),
            messages,
            temperature: Some(req.temperature),
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: req.max_tokens,
            repetition_penalty: req.repetition_penalty,
            stream: Some(req.stream),
            profanity_check: self.profanity_check,
            functions,
            function_call,
        })
    }

    async fn translate_message(&self, msg: &Message) -> Result<Vec<Messages>> {
        let role = msg.role.as_str();
        let mut out = Vec::new();

        match msg.content {
            Some(MessageContent::Text(ref text)) => {
                out.push(text_message(role, text, msg.name.clone()));
            }
            Some(MessageContent::Parts(ref parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            out.push(text_message(role, text, msg.name.clone()));
                        }
                        ContentPart::ImageUrl { image_url } => {
                            if let Some(file_id) = self.resolve_image(&image_url.url).await? {
                                out.push(Messages {
                                    role: role.to_string(),
                                    content: String::new(),
                                    name: msg.name.clone(),
                                    attachments: Some(vec![file_id]),
                                    ..Messages::default()
                                });
                            }
                        }
                        ContentPart::InputAudio { input_audio } => {
                            self.logger.log_with_context(
                                LogLevel::Warn,
                                "translate",
                                "Audio content is not supported by GigaChat, dropping part",
                                serde_json::json!({ "format": input_audio.format }),
                            );
                        }
                        ContentPart::Unknown => {
                            self.logger
                                .warn("translate", "Unsupported content part type, dropping part");
                        }
                    }
                }
            }
            None => {}
        }

        if let Some(call) = msg.tool_calls.as_ref().and_then(|calls| calls.first()) {
            let function_call = tool_call_to_function_call(call)?;
            match out.last_mut() {
                Some(last) => last.function_call = Some(function_call),
                None => out.push(Messages {
                    role: role.to_string(),
                    function_call: Some(function_call),
                    ..Messages::default()
                }),
            }
        }

        Ok(out)
    }

    /// Resolve an image reference to a GigaChat file id.
    /// Returns `None` for references GigaChat cannot use (remote URLs).
    async fn resolve_image(&self, url: &str) -> Result<Option<String>> {
        let Some((mime, payload)) = split_data_uri(url) else {
            self.logger.warn(
                "translate",
                "Only base64 data URI images are supported, dropping remote image URL",
            );
            return Ok(None);
        };

        let key = content_hash(url);
        if let Some(file_id) = self.cache.get(&key) {
            self.logger
                .debug("translate", format!("Image cache hit {key} -> {file_id}"));
            return Ok(Some(file_id));
        }

        let data = BASE64_STANDARD
            .decode(payload.trim())
            .map_err(|e| AdapterError::invalid_request(format!("Invalid base64 image data: {e}")))?;

        let file_id = self
            .cache
            .get_or_try_insert_with(&key, || async {
                let upload = FileUpload {
                    filename: format!("{}.{}", uuid::Uuid::new_v4(), extension_for_mime(mime)),
                    content_type: mime.to_string(),
                    purpose: "general".to_string(),
                    data,
                };
                let uploaded = self.vendor.upload_file(upload).await?;
                self.logger.info(
                    "translate",
                    format!("Uploaded image {} ({} bytes)", uploaded.id, uploaded.bytes),
                );
                Ok(uploaded.id)
            })
            .await?;

        Ok(Some(file_id))
    }
}

fn text_message(role: &str, text: &str, name: Option<String>) -> Messages {
    Messages {
        role: role.to_string(),
        content: text.to_string(),
        name,
        ..Messages::default()
    }
}

/// SHA-256 hex digest of the raw data URI, used as the upload cache key.
#[must_use]
pub fn content_hash(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Split `data:<mime>;base64,<payload>` into `(mime, payload)`.
#[must_use]
pub fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
    Some((mime, payload))
}

#[must_use]
pub fn extension_for_mime(mime: &str) -> &str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/svg+xml" => "svg",
        other => other
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .filter(|s| !s.is_empty())
            .unwrap_or("bin"),
    }
}

fn translate_tools(tools: &[Tool]) -> Vec<Function> {
    tools
        .iter()
        .map(|t| Function {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
        })
        .collect()
}

/// Map OpenAI `tool_choice` onto GigaChat `function_call`.
///
/// Strings pass through. `{"name": ..}` and `{"type":"function","function":{"name": ..}}`
/// select a function. A non-string `name` is an error; any other shape means
/// no preference.
pub fn translate_tool_choice(
    choice: &serde_json::Value,
    logger: &SharedLogger,
) -> Result<Option<FunctionCallSelector>> {
    let obj = match choice {
        serde_json::Value::String(mode) => {
            return Ok(Some(FunctionCallSelector::Mode(mode.clone())));
        }
        serde_json::Value::Object(obj) => obj,
        serde_json::Value::Null => return Ok(None),
        other => {
            logger.warn(
                "translate",
                format!("Ignoring unrecognized tool_choice {other}"),
            );
            return Ok(None);
        }
    };

    let selector_source = if obj.contains_key("name") {
        Some(obj)
    } else {
        obj.get("function").and_then(serde_json::Value::as_object)
    };

    let Some(source) = selector_source.filter(|s| s.contains_key("name")) else {
        logger.warn(
            "translate",
            format!("Ignoring unrecognized tool_choice {choice}"),
        );
        return Ok(None);
    };

    let name = source
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AdapterError::invalid_request("tool_choice.name must be a string"))?;

    let partial_arguments = source
        .get("partial_arguments")
        .and_then(serde_json::Value::as_object)
        .cloned();

    Ok(Some(FunctionCallSelector::Named(ChatFunctionCall {
        name: name.to_string(),
        partial_arguments,
    })))
}

fn tool_call_to_function_call(call: &ToolCall) -> Result<FunctionCall> {
    let arguments = match call.function.arguments {
        serde_json::Value::Null => None,
        serde_json::Value::Object(ref map) => Some(map.clone()),
        serde_json::Value::String(ref raw) if raw.trim().is_empty() => None,
        serde_json::Value::String(ref raw) => Some(serde_json::from_str(raw).map_err(|e| {
            AdapterError::invalid_request(format!(
                "tool_calls[].function.arguments is not a JSON object: {e}"
            ))
        })?),
        _ => {
            return Err(AdapterError::invalid_request(
                "tool_calls[].function.arguments must be a JSON object or string",
            ))
        }
    };

    Ok(FunctionCall {
        name: call.function.name.clone(),
        arguments,
    })
}
