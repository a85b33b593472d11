// src/lib.rs

// Import the top-level `domainflow` module.
pub mod domainflow;

// Re-export the component modules so callers write domainflow::scheduler
// instead of domainflow::domainflow::scheduler.
pub use domainflow::{
    broker, config, config_store, engine, error, graph, job, runtime, scheduler, status,
    synthesizer, tools, types,
};

// Re-exporting key items for easier external access.
pub use domainflow::broker::{
    PermissionSource, SecretCache, SecretProvider, ToolBroker, ToolContext, ToolError,
    ToolProvider,
};
pub use domainflow::engine::Engine;
pub use domainflow::error::{EngineError, EngineResult, ErrorEnvelope};
