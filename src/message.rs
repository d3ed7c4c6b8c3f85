//! Control messages posted to the worker by its pages.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A message of the form `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate the waiting worker immediately
  SkipWaiting,
  /// Delete the current cache and acknowledge
  ClearCache,
  /// Any type the worker does not handle
  #[serde(other)]
  Unknown,
}

impl ControlMessage {
  pub fn parse(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Invalid control message: {}", e))
  }
}

/// Acknowledgement sent on a message's reply port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageReply {
  pub success: bool,
}

/// Reply port attached to a message, if the sender supplied one.
pub type ReplyPort = oneshot::Sender<MessageReply>;
