//! Built-in task handlers and the default module wiring
//!
//! - `command` runs a shell command (used for `test` tasks)
//! - `completion` sends a prompt through the credential pool to a completion
//!   backend (used for the generative task kinds), optionally answering
//!   repeated prompts from a response cache
//! - `gemini` is the HTTP completion backend

mod builtin;
mod cache;
mod command;
mod completion;
mod gemini;

pub use builtin::{builtin_constructors, default_wiring};
pub use cache::{CacheStats, CachedResponse, ResponseCache};
pub use command::CommandHandler;
pub use completion::{BackendError, CompletionBackend, CompletionHandler};
pub use gemini::GeminiBackend;
