// =============================================================================
// Memory sink — channel-backed consumer for embedding and tests
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::candle::Candle;
use crate::sink::Sink;

/// Forwards every emitted candle into an unbounded channel. Useful for
/// consuming the pipeline in-process without a file or database.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Candle>,
}

impl MemorySink {
    /// Create the sink plus the receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Candle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn emit(&self, candle: &Candle) -> Result<()> {
        self.tx
            .send(candle.clone())
            .map_err(|_| anyhow::anyhow!("memory sink receiver dropped"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
