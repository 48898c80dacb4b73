//! Packing event rows and DTOs.

use packline_core::types::DbId;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `packing_events` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PackingEvent {
    pub id: DbId,
    pub item_id: DbId,
    pub camera_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub detection_count: i64,
    /// Derived metadata as JSON text.
    pub metadata: String,
    pub created_at_ms: i64,
}

/// DTO for persisting a synthesized event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPackingEvent {
    pub item_id: DbId,
    pub camera_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub detection_count: i64,
    pub metadata: serde_json::Value,
}
