//! Bundled tool providers.
//!
//! Concrete upstreams for most tools (LLM APIs, geocoders, NLP services,
//! search indices) live outside the engine and are registered by the host
//! application as [`ToolProvider`](crate::broker::ToolProvider)
//! implementations. This module ships the two adapters that need nothing
//! external:
//!
//! - [`CustomHttpProvider`]: the `custom_http` tool over a pooled reqwest
//!   client with a per-construction domain allowlist.
//! - [`DataToolProvider`] + [`InMemoryDataBackend`]: the `data.*` family
//!   over a pluggable [`DataBackend`]; the in-memory backend serves tests
//!   and single-process deployments, and a relational adapter implements
//!   the same trait in production.

pub mod custom_http;
pub mod data;

pub use custom_http::CustomHttpProvider;
pub use data::{DataBackend, DataToolProvider, InMemoryDataBackend};
