//! Puppet Service - remote bridge for chat-automation puppets.
//!
//! A puppet engine running in one process is exposed to automation code in
//! another. The server side ([`PuppetService`]) forwards façade calls to the
//! engine and streams its events to one subscriber at a time. The client side
//! ([`PuppetSession`]) re-raises those events locally and keeps the stream
//! alive across network failures, resuming from a persisted watermark so the
//! automation layer never sees a spurious login or logout.
//!
//! # Example
//!
//! ```rust,ignore
//! use puppet_service::{ClientOptions, MemoryWatermarkStore, PuppetSession, SessionOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> puppet_service::Result<()> {
//!     let options = SessionOptions::new(ClientOptions::new("127.0.0.1:8788", "insecure_demo"));
//!     let session = PuppetSession::new(options, Arc::new(MemoryWatermarkStore::new()));
//!
//!     session.events().on(puppet_service::EventKind::Message, |event| {
//!         println!("{:?}", event);
//!     });
//!     session.start().await?;
//!     session.ding("hello").await?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod emitter;
pub mod error;
pub mod event;
pub mod filebox;
pub mod ipc;
pub mod puppet;
pub mod retry;
pub mod server;

// Re-export commonly used types
pub use client::{
    MemoryWatermarkStore, PuppetSession, ReconnectTiming, SessionOptions, SqliteWatermarkStore,
    Watermark, WatermarkStore,
};
pub use config::{ClientOptions, ServerOptions, TlsOptions};
pub use emitter::{Emitter, ListenerId};
pub use error::{PuppetServiceError, Result};
pub use event::{DirtyType, EventEnvelope, EventKind, PuppetEvent};
pub use filebox::FileBox;
pub use ipc::IpcServerHandle;
pub use puppet::{MockPuppet, Puppet};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use server::{EventStreamSink, PuppetService};
