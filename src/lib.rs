pub mod cache;
pub mod config;
pub mod error;
pub mod gigachat;
pub mod logging;
pub mod server;
pub mod service;
pub mod translate;

pub use config::AdapterConfig;
pub use error::{AdapterError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
pub use service::AdapterService;
