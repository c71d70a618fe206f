//! Chat session engine: the authorization pipeline, conversation/session
//! state, the LLM ⇄ tool loop, and cost accounting. Transport-agnostic —
//! adapters supply a frame sink and a cancellation signal.

pub mod cost;
pub mod engine;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod users;

pub use cost::CostModel;
pub use engine::{ChatEngine, EngineDeps};
pub use pipeline::{Admission, AuthPipeline, Identity};
pub use session::{Conversation, Session};
pub use sink::FrameSink;
pub use users::{MemoryUserDirectory, UserDirectory};
