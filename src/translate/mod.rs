//! API translation between OpenAI and GigaChat formats.
//!
//! The core of the adapter: converts requests, responses, and streaming chunks
//! between the two API formats. Response translation is pure; request
//! translation uploads inline images as its one side effect.

pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
