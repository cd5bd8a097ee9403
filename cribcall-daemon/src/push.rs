//! Push-notification collaborator interface
//!
//! Delivery internals are external to this core: the collaborator takes a
//! token list and a payload and reports per-batch success/failure plus
//! the tokens it found invalid. Only the invalid-token list is consumed
//! here, to purge dead subscriptions.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Result of one push batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    /// Tokens the provider rejected as permanently invalid.
    pub invalid_tokens: Vec<String>,
}

/// External push sender.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, tokens: &[String], payload: &Value) -> PushOutcome;
}

/// Sender that drops everything; used when no push provider is wired up.
#[derive(Debug, Default)]
pub struct NoopPushSender;

#[async_trait]
impl PushSender for NoopPushSender {
    async fn send(&self, tokens: &[String], _payload: &Value) -> PushOutcome {
        debug!(count = tokens.len(), "push delivery skipped (no provider)");
        PushOutcome {
            failure_count: tokens.len(),
            ..PushOutcome::default()
        }
    }
}
