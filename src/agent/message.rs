use serde::Deserialize;
use serde_json::Value;

/// Control signals a page can send to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting install immediately
  SkipWaiting,
}

impl ControlMessage {
  /// Parse a message payload. Unrecognized payloads yield `None`.
  pub fn parse(payload: &Value) -> Option<Self> {
    Self::deserialize(payload).ok()
  }
}
