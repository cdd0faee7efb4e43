//! Dry-run transport.

use async_trait::async_trait;
use tracing::info;

use super::{Transport, TransportError};

/// Writes every message to the log and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn transport_type(&self) -> &'static str {
        "log"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<(), TransportError> {
        info!(recipient_id, chars = text.chars().count(), "{}", text);
        Ok(())
    }
}
