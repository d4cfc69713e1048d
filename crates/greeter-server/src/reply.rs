//! Broadcast payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use greeter_core::SessionId;
use serde::Serialize;
use tracing::warn;

/// What a [`ReplySource`] knows about the session it is producing for.
#[derive(Clone, Copy, Debug)]
pub struct ReplyContext<'a> {
    /// Session the payload is for.
    pub session_id: SessionId,
    /// 1-based number of the write this payload will become.
    pub sequence: u64,
    /// Latest payload the client sent, if any.
    pub last_inbound: Option<&'a [u8]>,
}

/// Produces the payload for each server-initiated write.
pub trait ReplySource: Send + Sync {
    /// Payload for the next write, or `None` to skip this tick.
    fn next_reply(&self, ctx: &ReplyContext<'_>) -> Option<Bytes>;
}

/// Name used when the client has not sent anything yet.
pub const ANONYMOUS_NAME: &str = "stranger";

/// Default greeting prefix.
pub const DEFAULT_PREFIX: &str = "Hello";

/// JSON greetings addressed to the last name the client sent.
#[derive(Clone, Debug)]
pub struct GreetingReplies {
    prefix: String,
}

/// Wire shape of one greeting.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Greeting {
    session_id: SessionId,
    sequence: u64,
    message: String,
    timestamp: DateTime<Utc>,
}

impl GreetingReplies {
    /// Greetings starting with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The greeting prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn name(last_inbound: Option<&[u8]>) -> String {
        let name = last_inbound
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
            .unwrap_or_default();
        if name.is_empty() {
            ANONYMOUS_NAME.to_string()
        } else {
            name
        }
    }
}

impl Default for GreetingReplies {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ReplySource for GreetingReplies {
    fn next_reply(&self, ctx: &ReplyContext<'_>) -> Option<Bytes> {
        let greeting = Greeting {
            session_id: ctx.session_id,
            sequence: ctx.sequence,
            message: format!("{} {}", self.prefix, Self::name(ctx.last_inbound)),
            timestamp: Utc::now(),
        };
        match serde_json::to_vec(&greeting) {
            Ok(json) => Some(Bytes::from(json)),
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "failed to encode greeting");
                None
            }
        }
    }
}
