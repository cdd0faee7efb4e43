//! Outbound transports.
//!
//! A transport pushes one plain-text message to one recipient and reports
//! failures with a typed [`FailureClass`], so callers never inspect error text:
//! - Telegram Bot API
//! - Log (writes messages to the tracing output, for dry runs)

mod log;
mod telegram;

pub use log::LogTransport;
pub use telegram::{TelegramConfig, TelegramTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Result;

/// How the delivery engine should react to a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FailureClass {
    /// The recipient can never be reached (blocked the bot, chat gone).
    Permanent,
    /// Worth retrying: rate limit, server error, network trouble.
    Transient,
}

/// A failed send, classified.
#[derive(Debug, Clone, Error)]
#[error("{class} transport failure: {message}")]
pub struct TransportError {
    pub class: FailureClass,
    pub message: String,
    /// Minimum wait requested by the remote side before retrying.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.class == FailureClass::Permanent
    }
}

/// Message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport type name, for logs.
    fn transport_type(&self) -> &'static str;

    /// Deliver `text` to `recipient_id`.
    async fn send(&self, recipient_id: i64, text: &str) -> std::result::Result<(), TransportError>;
}

/// Transport configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    /// Telegram Bot API.
    Telegram(TelegramConfig),
    /// Log every message instead of sending it.
    Log,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Telegram(TelegramConfig::default())
    }
}

impl TransportConfig {
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Telegram(_) => "telegram",
            Self::Log => "log",
        }
    }

    /// Construct the configured transport.
    pub fn build(&self) -> Result<Arc<dyn Transport>> {
        Ok(match self {
            Self::Telegram(config) => Arc::new(TelegramTransport::new(config.clone())?),
            Self::Log => Arc::new(LogTransport),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted in-memory transport shared by pipeline unit tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Replies from a per-recipient script, then succeeds. Records every
    /// successful send.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<HashMap<i64, VecDeque<std::result::Result<(), TransportError>>>>,
        sent: Mutex<Vec<(i64, String)>>,
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        send_delay: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_send_delay(delay: Duration) -> Self {
            Self {
                send_delay: Some(delay),
                ..Self::default()
            }
        }

        /// Queue a failure for the next send to `recipient_id`.
        pub fn fail_next(&self, recipient_id: i64, err: TransportError) {
            self.script
                .lock()
                .entry(recipient_id)
                .or_default()
                .push_back(Err(err));
        }

        /// Fail every send to `recipient_id` permanently.
        pub fn block(&self, recipient_id: i64) {
            let mut script = self.script.lock();
            let queue = script.entry(recipient_id).or_default();
            for _ in 0..64 {
                queue.push_back(Err(TransportError::permanent("Forbidden: bot was blocked")));
            }
        }

        pub fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().clone()
        }

        pub fn sent_to(&self, recipient_id: i64) -> usize {
            self.sent.lock().iter().filter(|(id, _)| *id == recipient_id).count()
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn transport_type(&self) -> &'static str {
            "scripted"
        }

        async fn send(
            &self,
            recipient_id: i64,
            text: &str,
        ) -> std::result::Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = self
                .script
                .lock()
                .get_mut(&recipient_id)
                .and_then(|queue| queue.pop_front());
            match scripted {
                Some(Err(err)) => Err(err),
                _ => {
                    self.sent.lock().push((recipient_id, text.to_string()));
                    Ok(())
                }
            }
        }
    }
}
