//! Frame sink — the engine's only view of a client transport.

use mcpbridge_core::{Error, ServerFrame};

/// Where server frames go. A send error means the client is gone; the
/// engine treats it as a cancellation signal.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), Error>;
}

/// Sink that collects frames in memory. Used by tests and by adapters that
/// buffer before flushing.
#[derive(Default)]
pub struct CollectingSink {
    pub frames: Vec<ServerFrame>,
}

#[async_trait::async_trait]
impl FrameSink for CollectingSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), Error> {
        self.frames.push(frame);
        Ok(())
    }
}
