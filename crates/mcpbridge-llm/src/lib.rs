//! LLM provider adapters with streaming and tool-use support.

pub mod anthropic;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use types::*;
