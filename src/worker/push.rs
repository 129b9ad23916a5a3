//! Push notifications: rendering payloads and resolving clicks.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::NotificationConfig;

/// Action id that dismisses a notification.
pub const CLOSE_ACTION: &str = "close";
/// Action id that opens the notification URL.
pub const OPEN_ACTION: &str = "open";

/// JSON pushed by the server. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationData {
  pub url: String,
}

/// A notification ready to be shown by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// A browser window the worker could focus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
}

/// What to do in response to a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
  /// Nothing, the notification was dismissed
  Dismiss,
  /// Focus the window with this id
  Focus(String),
  /// Open a new window at this URL
  OpenWindow(Url),
}

/// Build a notification from a push payload.
///
/// Returns `None` for an empty push; a payload that is not JSON is an error.
pub fn render(payload: &[u8], config: &NotificationConfig) -> Result<Option<Notification>> {
  if payload.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }

  let payload: PushPayload =
    serde_json::from_slice(payload).map_err(|e| eyre!("Invalid push payload: {}", e))?;

  Ok(Some(Notification {
    title: payload.title.unwrap_or_else(|| config.default_title.clone()),
    body: payload.body.unwrap_or_else(|| config.default_body.clone()),
    icon: config.icon.clone(),
    badge: config.badge.clone(),
    vibrate: config.vibrate.clone(),
    data: NotificationData {
      url: payload.url.unwrap_or_else(|| "/".to_string()),
    },
    actions: vec![
      NotificationAction {
        action: OPEN_ACTION.to_string(),
        title: config.open_title.clone(),
        icon: config.open_icon.clone(),
      },
      NotificationAction {
        action: CLOSE_ACTION.to_string(),
        title: config.close_title.clone(),
        icon: config.close_icon.clone(),
      },
    ],
  }))
}

/// Decide how to react to a click on `notification`.
///
/// The close action dismisses. Anything else (including a click on the body)
/// focuses a window already showing the notification URL, or opens one.
pub fn on_click(
  notification: &Notification,
  action: Option<&str>,
  clients: &[WindowClient],
  origin: &Url,
) -> Result<ClientAction> {
  if action == Some(CLOSE_ACTION) {
    return Ok(ClientAction::Dismiss);
  }

  let target = origin
    .join(&notification.data.url)
    .map_err(|e| eyre!("Invalid notification URL '{}': {}", notification.data.url, e))?;

  let existing = clients.iter().find(|client| {
    origin
      .join(&client.url)
      .map(|url| url == target)
      .unwrap_or(false)
  });

  Ok(match existing {
    Some(client) => ClientAction::Focus(client.id.clone()),
    None => ClientAction::OpenWindow(target),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://site.test/").unwrap()
  }

  #[test]
  fn test_render_fills_defaults() {
    let config = NotificationConfig::default();
    let notification = render(br#"{"title":"New post"}"#, &config).unwrap().unwrap();

    assert_eq!(notification.title, "New post");
    assert_eq!(notification.body, "Nouveau contenu disponible");
    assert_eq!(notification.data.url, "/");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    let actions: Vec<&str> = notification.actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["open", "close"]);
  }

  #[test]
  fn test_render_empty_payload() {
    let config = NotificationConfig::default();
    assert!(render(b"", &config).unwrap().is_none());
    assert!(render(b"  \n", &config).unwrap().is_none());
    assert!(render(b"not json", &config).is_err());
  }

  #[test]
  fn test_render_serializes_like_platform_options() {
    let config = NotificationConfig::default();
    let notification = render(br#"{"url":"/blog/new"}"#, &config).unwrap().unwrap();
    let json = serde_json::to_value(&notification).unwrap();
    assert_eq!(json["data"]["url"], "/blog/new");
    assert_eq!(json["title"], "SMDLabTech");
    assert_eq!(json["actions"][1]["title"], "Fermer");
  }

  #[test]
  fn test_click_close_dismisses() {
    let config = NotificationConfig::default();
    let notification = render(br#"{"url":"/blog/new"}"#, &config).unwrap().unwrap();
    let action = on_click(&notification, Some("close"), &[], &origin()).unwrap();
    assert_eq!(action, ClientAction::Dismiss);
  }

  #[test]
  fn test_click_focuses_existing_window() {
    let config = NotificationConfig::default();
    let notification = render(br#"{"url":"/blog/new"}"#, &config).unwrap().unwrap();
    let clients = vec![
      WindowClient {
        id: "a".to_string(),
        url: "https://site.test/".to_string(),
      },
      WindowClient {
        id: "b".to_string(),
        url: "https://site.test/blog/new".to_string(),
      },
    ];

    let action = on_click(&notification, Some("open"), &clients, &origin()).unwrap();
    assert_eq!(action, ClientAction::Focus("b".to_string()));
  }

  #[test]
  fn test_click_opens_new_window() {
    let config = NotificationConfig::default();
    let notification = render(br#"{"url":"/blog/new"}"#, &config).unwrap().unwrap();
    let clients = vec![WindowClient {
      id: "a".to_string(),
      url: "https://site.test/".to_string(),
    }];

    let action = on_click(&notification, None, &clients, &origin()).unwrap();
    assert_eq!(
      action,
      ClientAction::OpenWindow(Url::parse("https://site.test/blog/new").unwrap())
    );
  }
}
