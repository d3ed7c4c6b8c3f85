//! Effects the worker asks its host to perform.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use url::Url;

const ICON: &str = "/icons/icon-192.png";
const BADGE: &str = "/icons/icon-96.png";
const ACTION_ICON: &str = "/icons/icon-96.png";
const VIBRATE: [u32; 3] = [200, 100, 200];

/// Host-side capabilities: user notifications and client windows.
pub trait Host: Send + Sync {
  fn show_notification(&self, notification: &Notification) -> Result<()>;

  /// Dismiss the notification the user interacted with.
  fn close_notification(&self) -> Result<()>;

  fn open_window(&self, url: &Url) -> Result<()>;
}

/// A user notification as handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<NotificationData>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  /// Epoch milliseconds
  pub date_of_arrival: i64,
  pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl NotificationAction {
  fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: ACTION_ICON.to_string(),
    }
  }
}

impl Notification {
  fn new(title: &str, body: &str) -> Self {
    Self {
      title: title.to_string(),
      body: body.to_string(),
      icon: ICON.to_string(),
      badge: BADGE.to_string(),
      vibrate: VIBRATE.to_vec(),
      data: None,
      actions: Vec::new(),
    }
  }

  /// Notification for a push message. Without a payload a default body is used.
  pub fn push(text: Option<&str>) -> Self {
    Self {
      data: Some(NotificationData {
        date_of_arrival: Utc::now().timestamp_millis(),
        primary_key: 1,
      }),
      actions: vec![
        NotificationAction::new("view", "View"),
        NotificationAction::new("close", "Close"),
      ],
      ..Self::new("WBS Mobile", text.unwrap_or("New notification from WBS"))
    }
  }

  /// Shown after background sync delivers a queued report.
  pub fn report_submitted() -> Self {
    Self::new(
      "Report Submitted",
      "Your offline report has been submitted successfully",
    )
  }
}

/// Host for the CLI: effects are printed to stdout.
pub struct ConsoleHost;

impl Host for ConsoleHost {
  fn show_notification(&self, notification: &Notification) -> Result<()> {
    let json = serde_json::to_string_pretty(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    println!("notification: {}", json);
    Ok(())
  }

  fn close_notification(&self) -> Result<()> {
    println!("close notification");
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    println!("open window: {}", url);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_push_defaults_body() {
    let notification = Notification::push(None);
    assert_eq!(notification.title, "WBS Mobile");
    assert_eq!(notification.body, "New notification from WBS");
    assert_eq!(notification.vibrate, vec![200, 100, 200]);
    assert_eq!(notification.actions.len(), 2);
    assert_eq!(notification.data.as_ref().unwrap().primary_key, 1);
  }

  #[test]
  fn test_push_serializes_camel_case() {
    let value = serde_json::to_value(Notification::push(Some("New case assigned"))).unwrap();
    assert_eq!(value["body"], "New case assigned");
    assert!(value["data"]["dateOfArrival"].as_i64().unwrap() > 0);
    assert_eq!(value["actions"][0]["action"], "view");
    assert_eq!(value["actions"][1]["icon"], "/icons/icon-96.png");
  }

  #[test]
  fn test_report_submitted_has_no_actions() {
    let value = serde_json::to_value(Notification::report_submitted()).unwrap();
    assert_eq!(value["icon"], "/icons/icon-192.png");
    assert!(value.get("actions").is_none());
    assert!(value.get("data").is_none());
  }
}
