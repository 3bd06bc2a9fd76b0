//! The adapter service: OpenAI-shaped operations backed by GigaChat.
//!
//! Built once at startup and handed to the HTTP layer. Owns the vendor
//! client, the upload cache and the event log; holds no per-request state.

use crate::cache::KvStore;
use crate::error::Result;
use crate::gigachat::types::FileUpload;
use crate::gigachat::VendorApi;
use crate::logging::SharedLogger;
use crate::translate::openai_types::{
    ChatRequest, ChatResponse, FileObject, FilePurpose, ModelData, ModelList,
};
use crate::translate::request::RequestTranslator;
use crate::translate::response::{completion_to_openai, new_response_id};
use crate::translate::streaming::{self, SseStream};

use std::sync::Arc;

/// GigaChat does not report model creation times; every model advertises this one.
pub const MODEL_CREATED_AT: i64 = 1_735_689_600;

pub struct AdapterService {
    vendor: Arc<dyn VendorApi>,
    cache: KvStore,
    logger: SharedLogger,
    profanity_check: Option<bool>,
}

impl AdapterService {
    pub fn new(vendor: Arc<dyn VendorApi>, cache: KvStore, logger: SharedLogger) -> Self {
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

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    pub fn cache(&self) -> &KvStore {
        &self.cache
    }

    fn translator(&self) -> RequestTranslator<'_> {
        RequestTranslator::new(self.vendor.as_ref(), &self.cache, &self.logger)
            .with_profanity_check(self.profanity_check)
    }

    pub async fn list_models(&self) -> Result<ModelList> {
        let models = self.vendor.models().await?;
        let data = models
            .data
            .into_iter()
            .map(|m| ModelData {
                id: m.id,
                object: m.object,
                created: MODEL_CREATED_AT,
                owned_by: m.owned_by,
            })
            .collect();

        Ok(ModelList {
            object: "list".to_string(),
            data,
        })
    }

    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let chat = self.translator().translate(req).await?;

        self.logger.info(
            "service",
            format!("Chat: model={} messages={}", chat.model, chat.messages.len()),
        );

        let completion = self.vendor.chat(&chat).await?;
        let response = completion_to_openai(&completion, &new_response_id());

        self.logger.info(
            "service",
            format!(
                "Completed: prompt={} completion={} tokens",
                response.usage.prompt_tokens, response.usage.completion_tokens
            ),
        );

        Ok(response)
    }

    /// Start a streamed completion as SSE text.
    ///
    /// The first GigaChat chunk is awaited before this returns, so failures
    /// before any output are reported as an `Err` rather than a cut-off stream.
    pub async fn stream_chat_sse(&self, req: &ChatRequest) -> Result<SseStream> {
        let mut chat = self.translator().translate(req).await?;
        chat.stream = Some(true);

        self.logger.info(
            "service",
            format!(
                "Chat (streaming): model={} messages={}",
                chat.model,
                chat.messages.len()
            ),
        );

        let chunks = self.vendor.stream(&chat).await?;
        let primed = streaming::prime(chunks).await?;
        Ok(streaming::relay_sse(primed, self.logger.clone()))
    }

    pub async fn upload_file(
        &self,
        filename: String,
        content_type: String,
        purpose: FilePurpose,
        data: Vec<u8>,
    ) -> Result<FileObject> {
        let upload = FileUpload {
            filename,
            content_type,
            purpose: purpose.vendor_value().to_string(),
            data,
        };
        let uploaded = self.vendor.upload_file(upload).await?;

        self.logger.info(
            "service",
            format!("Uploaded file {} ({} bytes)", uploaded.id, uploaded.bytes),
        );

        let created_at = if uploaded.created_at > 0 {
            uploaded.created_at
        } else {
            chrono::Utc::now().timestamp()
        };

        Ok(FileObject {
            id: uploaded.id,
            object: "file".to_string(),
            bytes: uploaded.bytes,
            created_at,
            filename: uploaded.filename,
            purpose: FilePurpose::parse(&uploaded.purpose).unwrap_or(FilePurpose::General),
        })
    }
}
