//! Control messages posted to the worker by pages.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Activate a waiting worker without waiting for pages to close
  SkipWaiting,
  /// Report the cache version
  GetVersion,
  /// Delete the current cache store
  ClearCache,
}

impl WorkerMessage {
  pub fn parse(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Invalid worker message {}: {}", json, e))
  }
}

/// Answer sent back over a message's reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageReply {
  Version { version: String },
  Cleared { success: bool },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_messages() {
    assert_eq!(
      WorkerMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      WorkerMessage::SkipWaiting
    );
    assert_eq!(
      WorkerMessage::parse(r#"{"type":"GET_VERSION"}"#).unwrap(),
      WorkerMessage::GetVersion
    );
    assert_eq!(
      WorkerMessage::parse(r#"{"type":"CLEAR_CACHE","extra":1}"#).unwrap(),
      WorkerMessage::ClearCache
    );
    assert!(WorkerMessage::parse(r#"{"type":"REBOOT"}"#).is_err());
    assert!(WorkerMessage::parse("{}").is_err());
  }

  #[test]
  fn test_reply_shape() {
    let version = MessageReply::Version {
      version: "smdlabtech-v1.0.0".to_string(),
    };
    assert_eq!(
      serde_json::to_string(&version).unwrap(),
      r#"{"version":"smdlabtech-v1.0.0"}"#
    );
    let cleared = MessageReply::Cleared { success: true };
    assert_eq!(serde_json::to_string(&cleared).unwrap(), r#"{"success":true}"#);
  }
}
