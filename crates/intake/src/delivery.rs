use std::sync::Arc;

use {async_trait::async_trait, courier_filter::Verdict};

/// A fully reassembled message that passed (or was flagged by) the filters.
#[derive(Debug, Clone)]
pub struct CompletedMessage {
    /// Payloads of every fragment, in sequence order.
    pub payloads: Arc<Vec<Vec<u8>>>,
    /// Transport format tag resolved from the stored fragments.
    pub format: String,
    /// Application port the message was addressed to, if any.
    pub dest_port: Option<i64>,
    /// Sender address as shown to the user.
    pub address: String,
    /// Transport timestamp of the message.
    pub timestamp_ms: i64,
    /// Show-immediately messages bypass the normal notification path.
    pub priority: bool,
    /// Combined filter verdict, for notification suppression downstream.
    pub verdict: Verdict,
}

/// Final consumer of completed messages.
///
/// Delivery failures are logged and the message is still finalized in the
/// store; the sink is expected to do its own retries if it needs them.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: CompletedMessage) -> anyhow::Result<()>;
}
