//! Task documents, the payload of queued writes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "low" => Ok(Priority::Low),
      "medium" => Ok(Priority::Medium),
      "high" => Ok(Priority::High),
      other => Err(eyre!("Unknown priority {} (expected low, medium or high)", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
  /// Assigned by the backend; absent on creation
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub completed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub user_id: String,
}

impl Todo {
  pub fn new(title: &str, user_id: &str) -> Self {
    let now = Utc::now();
    Self {
      id: None,
      title: title.to_string(),
      body: String::new(),
      priority: Priority::default(),
      completed: false,
      due_date: None,
      created_at: now,
      updated_at: now,
      user_id: user_id.to_string(),
    }
  }

  pub fn with_body(mut self, body: &str) -> Self {
    self.body = body.to_string();
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
    self.due_date = Some(due_date);
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.title.trim().is_empty() {
      return Err(eyre!("Todo title must not be empty"));
    }
    if self.user_id.trim().is_empty() {
      return Err(eyre!("Todo must belong to a user"));
    }
    Ok(())
  }

  /// JSON body for the write endpoint.
  pub fn to_payload(&self) -> Result<Vec<u8>> {
    self.validate()?;
    serde_json::to_vec(self).map_err(|e| eyre!("Failed to serialize todo: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_serializes_camel_case() {
    let todo = Todo::new("Buy milk", "user-1").with_priority(Priority::High);
    let value = serde_json::to_value(&todo).unwrap();
    assert_eq!(value["title"], "Buy milk");
    assert_eq!(value["priority"], "high");
    assert_eq!(value["userId"], "user-1");
    assert!(value.get("createdAt").is_some());
    assert!(value.get("id").is_none());
    assert!(value.get("dueDate").is_none());
  }

  #[test]
  fn test_due_date_in_payload() {
    let due = DateTime::parse_from_rfc3339("2026-11-01T09:00:00Z")
      .unwrap()
      .with_timezone(&Utc);
    let todo = Todo::new("Buy milk", "user-1").with_due_date(due);
    let value: serde_json::Value = serde_json::from_slice(&todo.to_payload().unwrap()).unwrap();
    assert_eq!(value["dueDate"], "2026-11-01T09:00:00Z");
  }

  #[test]
  fn test_deserializes_backend_document() {
    let todo: Todo = serde_json::from_value(json!({
      "id": "abc",
      "title": "Walk the dog",
      "priority": "low",
      "completed": true,
      "dueDate": "2024-05-01T09:00:00Z",
      "createdAt": "2024-04-01T09:00:00Z",
      "updatedAt": "2024-04-02T09:00:00Z",
      "userId": "user-1"
    }))
    .unwrap();
    assert_eq!(todo.id.as_deref(), Some("abc"));
    assert_eq!(todo.priority, Priority::Low);
    assert!(todo.completed);
    assert_eq!(todo.body, "");
    assert!(todo.due_date.is_some());
  }

  #[test]
  fn test_rejects_unknown_priority() {
    let err = serde_json::from_value::<Todo>(json!({
      "title": "x",
      "priority": "urgent",
      "createdAt": "2024-04-01T09:00:00Z",
      "updatedAt": "2024-04-01T09:00:00Z",
      "userId": "u"
    }));
    assert!(err.is_err());
    assert!("urgent".parse::<Priority>().is_err());
    assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
  }

  #[test]
  fn test_empty_title_is_invalid() {
    assert!(Todo::new("   ", "user-1").validate().is_err());
    assert!(Todo::new("ok", "").to_payload().is_err());
    assert!(Todo::new("ok", "user-1").to_payload().is_ok());
  }
}
