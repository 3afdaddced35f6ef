//! Versioned output documents.
//!
//! The document store keeps exactly one `is_latest` version per
//! `(scope, doc_type)`; writing a new version clears the previous flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::thread::SpaceRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Final,
}

/// A generated document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub doc_type: String,
    pub scope: SpaceRef,
    /// Assigned by the repository on save; 1-based per `(scope, doc_type)`.
    pub version: u32,
    pub title: String,
    pub content: serde_json::Value,
    pub status: DocumentStatus,
    pub is_latest: bool,
    /// Step that produced this version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// A draft ready to be saved; version and latest flag are set by the store.
    pub fn draft(
        scope: SpaceRef,
        doc_type: impl Into<String>,
        title: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            doc_type: doc_type.into(),
            scope,
            version: 0,
            title: title.into(),
            content,
            status: DocumentStatus::Draft,
            is_latest: false,
            source_step_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_source_step(mut self, step_id: impl Into<String>) -> Self {
        self.source_step_id = Some(step_id.into());
        self
    }

    /// Text form of the content used when feeding it back into prompts.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}
