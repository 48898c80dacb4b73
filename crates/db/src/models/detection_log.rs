//! Detection log rows.

use packline_core::detector::DetectionRecord;
use packline_core::types::DbId;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `detection_logs` table. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DetectionLog {
    pub id: DbId,
    pub item_id: DbId,
    /// Claim attempt that produced this row.
    pub attempt: i64,
    pub offset_ms: i64,
    /// Detector payload as JSON text.
    pub payload: String,
    pub written_by: String,
    pub written_at_ms: i64,
}

impl DetectionLog {
    /// Decode back into the detector's record shape.
    pub fn record(&self) -> Result<DetectionRecord, serde_json::Error> {
        Ok(DetectionRecord {
            offset_ms: self.offset_ms,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}
