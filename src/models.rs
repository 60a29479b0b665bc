//! Data models for runs, users, and API envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Image stored for runs submitted without one.
pub const PLACEHOLDER_IMAGE: &str = "trichter-images/placeholder.jpg";

/// Measured values of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    pub duration: f64,
    pub rate: f64,
    pub volume: f64,
}

/// Minimal user projection attached to runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub username: String,
}

/// A stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub user_id: Option<String>,
    pub data: RunData,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

/// A run joined with its optional owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithUser {
    pub id: String,
    pub user_id: Option<String>,
    pub data: RunData,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub user: Option<UserInfo>,
}

/// Body of a create-run request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub duration: f64,
    pub rate: f64,
    pub volume: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl NewRun {
    pub fn data(&self) -> RunData {
        RunData {
            duration: self.duration,
            rate: self.rate,
            volume: self.volume,
        }
    }
}

/// Body of a link-run-to-user request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRunUser {
    pub user_id: String,
}

/// A user account as returned by search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub username: String,
    pub display_username: Option<String>,
}

/// Response envelope for mutations and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            details: None,
        }
    }

    pub fn failure(msg: &str, details: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(msg.to_string()),
            details,
        }
    }
}
