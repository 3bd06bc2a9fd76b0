//! GigaChat API access.
//!
//! [`VendorApi`] is the seam the adapter talks through; [`GigaChatClient`] is
//! the real implementation over `reqwest`. Tests substitute fakes.

pub mod client;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use client::GigaChatClient;
use types::{Chat, ChatCompletion, ChatCompletionChunk, FileUpload, Models, UploadedFile};

/// Vendor chunks in arrival order.
pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk>>;

#[async_trait]
pub trait VendorApi: Send + Sync {
    async fn models(&self) -> Result<Models>;

    async fn chat(&self, chat: &Chat) -> Result<ChatCompletion>;

    /// Start a streamed completion. Errors before the first byte surface here;
    /// later failures arrive as `Err` items on the stream.
    async fn stream(&self, chat: &Chat) -> Result<ChunkStream>;

    async fn upload_file(&self, upload: FileUpload) -> Result<UploadedFile>;
}
