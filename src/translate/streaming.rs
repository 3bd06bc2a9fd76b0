//! Relay GigaChat streaming chunks to clients as OpenAI Server-Sent Events.
//!
//! The [`StreamRelay`] translates GigaChat chunks one at a time, in arrival
//! order, and encodes each as a `data: <json>` event. Every relayed stream
//! ends with `data: [DONE]`, including streams that produced no chunks.

use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;

use super::openai_types::{ChatChunk, ErrorResponse};
use super::response::{chunk_to_openai, new_response_id};
use crate::error::Result;
use crate::gigachat::types::ChatCompletionChunk;
use crate::gigachat::ChunkStream;
use crate::logging::SharedLogger;

pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// SSE-encoded events, one `data:` event per item.
pub type SseStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Per-stream translation state. All chunks of one stream share one response id.
#[derive(Debug)]
pub struct StreamRelay {
    response_id: String,
    relayed: usize,
}

impl StreamRelay {
    pub fn new() -> Self {
        Self {
            response_id: new_response_id(),
            relayed: 0,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn relayed(&self) -> usize {
        self.relayed
    }

    /// Translate a single GigaChat chunk into its OpenAI counterpart.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> ChatChunk {
        self.relayed += 1;
        chunk_to_openai(chunk, &self.response_id)
    }

    /// Translate and encode a single chunk as one SSE event.
    pub fn encode_chunk(&mut self, chunk: &ChatCompletionChunk) -> Result<String> {
        let translated = self.process_chunk(chunk);
        Ok(sse_data(&serde_json::to_string(&translated)?))
    }

    /// Terminal event closing the stream.
    pub fn finish(&self) -> &'static str {
        DONE_EVENT
    }
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn sse_data(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Translate GigaChat chunks into OpenAI chunks without encoding them.
pub fn translate_chunks(chunks: ChunkStream) -> impl Stream<Item = Result<ChatChunk>> + Send {
    let mut relay = StreamRelay::new();
    chunks.map(move |item| item.map(|chunk| relay.process_chunk(&chunk)))
}

/// Encode a GigaChat chunk stream as OpenAI SSE text.
///
/// A GigaChat error after output has started cannot change the response
/// status any more; it is reported as a final `data: {"error": ..}` event.
pub fn relay_sse(chunks: ChunkStream, logger: SharedLogger) -> SseStream {
    let events = async_stream::stream! {
        let mut relay = StreamRelay::new();
        let mut chunks = chunks;

        while let Some(item) = chunks.next().await {
            let encoded = item.and_then(|chunk| relay.encode_chunk(&chunk));
            match encoded {
                Ok(event) => yield event,
                Err(e) => {
                    logger.error("stream", format!("Stream aborted: {e}"));
                    let body = ErrorResponse::http_exception(e.to_string());
                    if let Ok(json) = serde_json::to_string(&body) {
                        yield sse_data(&json);
                    }
                    break;
                }
            }
        }

        logger.info(
            "stream",
            format!("Stream {} completed after {} chunks", relay.response_id(), relay.relayed()),
        );
        yield relay.finish().to_string();
    };

    Box::pin(events)
}

/// Wait for the first chunk before committing to a streaming response, so
/// a GigaChat failure before any output can still become a plain error response.
pub async fn prime(mut chunks: ChunkStream) -> Result<ChunkStream> {
    match chunks.next().await {
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(Box::pin(stream::once(async move { Ok(first) }).chain(chunks))),
        None => Ok(Box::pin(stream::empty())),
    }
}
