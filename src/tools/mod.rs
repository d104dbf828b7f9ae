//! Tool registry, policy-checked execution, and output sanitization.

pub mod builtin;
pub mod executor;
pub mod registry;
pub mod sanitize;

pub use builtin::builtin_registry;
pub use executor::ToolExecutor;
pub use registry::{
    RegistryError, SandboxPolicy, ToolContext, ToolHandler, ToolRegistry, ToolSpec,
};
pub use sanitize::Sanitizer;
