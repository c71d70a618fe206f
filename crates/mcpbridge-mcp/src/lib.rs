//! MCP coordination: descriptors, HTTP transport, per-MCP circuit breakers,
//! the bounded tool-result cache, and the dispatch coordinator.

pub mod breaker;
pub mod cache;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod fingerprint;
pub mod transport;

pub use breaker::{BreakerState, CircuitBreaker};
pub use cache::{CacheKey, CacheStats, ToolCache};
pub use coordinator::{Invocation, McpCoordinator, McpStatusChange};
pub use descriptor::{HealthState, McpDescriptor, ToolDescriptor};
pub use error::{McpError, McpResult};
pub use fingerprint::fingerprint;
pub use transport::{HttpMcpTransport, McpTransport};
